// ===============================
// src/monitor.rs (SLA / issue monitor)
// ===============================
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::domain::{ActiveOrder, Issue, IssueType, NewIssue, OrderStatus};
use crate::hub::NotificationHub;
use crate::metrics::{ISSUES_OPENED, ISSUE_DUPLICATES, SLA_SCANS, SLA_SCAN_MS};
use crate::store::{bounded, Store, StoreError};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlaRules {
    /// Used when the order's store has no positive threshold of its own.
    pub default_breach_minutes: f64,
    pub pickup_delay_minutes: f64,
}

fn minutes_since(then: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (now - then).num_milliseconds() as f64 / 60_000.0
}

/// Conditions an order currently violates, with the measured minutes.
pub fn evaluate(row: &ActiveOrder, now: DateTime<Utc>, rules: &SlaRules) -> Vec<(IssueType, f64)> {
    let order = &row.order;
    let threshold = row
        .stores
        .as_ref()
        .and_then(|s| s.sla_breach_minutes)
        .filter(|m| m.is_finite() && *m > 0.0)
        .unwrap_or(rules.default_breach_minutes);

    let mut hits = Vec::new();
    let elapsed = minutes_since(order.created_at, now);
    if elapsed >= threshold && order.status != OrderStatus::Ready {
        hits.push((IssueType::Late, elapsed));
    }
    if order.status == OrderStatus::Ready {
        if let Some(ready_at) = order.ready_at {
            let shelf = minutes_since(ready_at, now);
            if shelf >= rules.pickup_delay_minutes {
                hits.push((IssueType::PickupDelay, shelf));
            }
        }
    }
    hits
}

pub struct Monitor {
    store: Arc<dyn Store>,
    hub: Arc<NotificationHub>,
    rules: SlaRules,
    call_timeout: Duration,
}

impl Monitor {
    pub fn new(store: Arc<dyn Store>, hub: Arc<NotificationHub>, rules: SlaRules, call_timeout: Duration) -> Self {
        Self { store, hub, rules, call_timeout }
    }

    /// One scan pass; returns the issues opened by it.
    pub async fn scan_at(&self, now: DateTime<Utc>) -> Vec<Issue> {
        let started = Instant::now();
        SLA_SCANS.inc();

        let rows = match bounded(self.call_timeout, "active_orders", self.store.active_orders()).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "sla scan skipped: active order query failed");
                return Vec::new();
            }
        };

        let mut opened = Vec::new();
        for row in &rows {
            for (kind, minutes) in evaluate(row, now, &self.rules) {
                match self.raise(&row.order.id, kind, minutes).await {
                    Ok(Some(issue)) => {
                        self.hub.notify_new_issue(&row.order.store_id, issue.clone());
                        opened.push(issue);
                    }
                    Ok(None) => {}
                    Err(e) => warn!(order = %row.order.id, kind = kind.as_str(), error = %e, "issue check failed"),
                }
            }
        }

        SLA_SCAN_MS.observe(started.elapsed().as_secs_f64() * 1000.0);
        if !opened.is_empty() {
            info!(orders = rows.len(), opened = opened.len(), "sla scan raised issues");
        }
        opened
    }

    /// Opens the issue unless one is already open for `(order, kind)`.
    async fn raise(&self, order_id: &str, kind: IssueType, minutes: f64) -> Result<Option<Issue>, StoreError> {
        if bounded(self.call_timeout, "open_issue", self.store.open_issue(order_id, kind)).await?.is_some() {
            return Ok(None);
        }
        let draft = NewIssue::open(order_id.to_string(), kind, minutes);
        match bounded(self.call_timeout, "insert_issue", self.store.insert_issue(&draft)).await {
            Ok(issue) => {
                ISSUES_OPENED.with_label_values(&[kind.as_str()]).inc();
                Ok(Some(issue))
            }
            // the uniqueness rule beat us to it
            Err(StoreError::Conflict(msg)) => {
                ISSUE_DUPLICATES.with_label_values(&[kind.as_str()]).inc();
                debug!(order = %order_id, kind = kind.as_str(), %msg, "issue already open");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

pub async fn run(monitor: Monitor, every: Duration) {
    let mut tick = interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // first tick fires immediately; the first scan is one period in
    tick.tick().await;
    info!(?every, "monitor: started");
    loop {
        tick.tick().await;
        monitor.scan_at(Utc::now()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        Driver, IssueStatus, NewOrder, NewTrip, Order, OrderPatch, Severity, StoreRef, Trip, TripPatch,
    };
    use crate::hub::tests::{drain, names};
    use crate::push::LogPush;
    use crate::store::{order_aged, MemoryStore};
    use crate::transport::Transport;
    use chrono::Duration as Minutes;

    const RULES: SlaRules = SlaRules { default_breach_minutes: 30.0, pickup_delay_minutes: 20.0 };

    fn monitor(store: Arc<MemoryStore>) -> (Monitor, Arc<NotificationHub>) {
        let hub = Arc::new(NotificationHub::new(
            Arc::new(Transport::new()),
            store.clone(),
            Arc::new(LogPush::new()),
            Duration::from_millis(200),
        ));
        (Monitor::new(store, hub.clone(), RULES, Duration::from_millis(200)), hub)
    }

    #[tokio::test]
    async fn late_order_opens_exactly_one_issue() {
        let store = Arc::new(MemoryStore::new());
        store.seed_store(StoreRef { id: "s1".into(), organization_id: None }, Some(30.0));
        store.seed_order(order_aged("o-late", "s1", OrderStatus::New, 31));
        let (mon, hub) = monitor(store.clone());
        let (member, mut rx_member) = hub.transport().connect();
        let (_other, mut rx_other) = hub.transport().connect();
        hub.transport().join(member, "s1");

        let first = mon.scan_at(Utc::now()).await;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].kind, IssueType::Late);
        assert_eq!(first[0].severity, Severity::High);
        assert_eq!(first[0].resolution_notes.as_deref(), Some("System detected SLA breach at 31 mins."));

        for _ in 0..3 {
            assert!(mon.scan_at(Utc::now()).await.is_empty());
        }
        assert_eq!(store.issues_snapshot().len(), 1);
        assert_eq!(names(&drain(&mut rx_member)), vec!["newIssue"]);
        assert!(drain(&mut rx_other).is_empty());
    }

    #[tokio::test]
    async fn ready_order_on_shelf_opens_pickup_delay() {
        let store = Arc::new(MemoryStore::new());
        let mut order = order_aged("o-shelf", "s1", OrderStatus::Ready, 45);
        order.ready_at = Some(Utc::now() - Minutes::minutes(21));
        store.seed_order(order);
        let (mon, _hub) = monitor(store.clone());

        let opened = mon.scan_at(Utc::now()).await;
        // ready orders are never flagged late, however old
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].kind, IssueType::PickupDelay);
        assert_eq!(opened[0].severity, Severity::Medium);
        assert_eq!(opened[0].resolution_notes.as_deref(), Some("Order waiting on shelf for 21 mins."));
        assert!(mon.scan_at(Utc::now()).await.is_empty());
    }

    #[tokio::test]
    async fn resolved_issue_can_be_raised_again() {
        let store = Arc::new(MemoryStore::new());
        store.seed_order(order_aged("o-1", "s1", OrderStatus::InProgress, 40));
        let (mon, _hub) = monitor(store.clone());
        let first = mon.scan_at(Utc::now()).await;
        store.resolve_issue(&first[0].id);

        let again = mon.scan_at(Utc::now()).await;
        assert_eq!(again.len(), 1);
        let open = store.issues_snapshot().into_iter().filter(|i| i.status == IssueStatus::Open).count();
        assert_eq!(open, 1);
    }

    #[tokio::test]
    async fn store_outage_skips_the_tick() {
        let store = Arc::new(MemoryStore::new());
        store.seed_order(order_aged("o-1", "s1", OrderStatus::New, 90));
        store.set_offline(true);
        let (mon, _hub) = monitor(store.clone());
        assert!(mon.scan_at(Utc::now()).await.is_empty());

        store.set_offline(false);
        assert_eq!(mon.scan_at(Utc::now()).await.len(), 1);
    }

    /// Misses existing issues on the pre-check, so only the insert's
    /// uniqueness rule stands between a scan and a duplicate.
    struct BlindCheckStore(MemoryStore);

    #[async_trait::async_trait]
    impl Store for BlindCheckStore {
        async fn drivers(&self) -> Result<Vec<Driver>, StoreError> { self.0.drivers().await }
        async fn update_driver_position(&self, d: &Driver) -> Result<(), StoreError> { self.0.update_driver_position(d).await }
        async fn negotiating_trips(&self) -> Result<Vec<Trip>, StoreError> { self.0.negotiating_trips().await }
        async fn insert_trip(&self, t: &NewTrip) -> Result<Trip, StoreError> { self.0.insert_trip(t).await }
        async fn update_trip(&self, id: &str, p: &TripPatch) -> Result<Trip, StoreError> { self.0.update_trip(id, p).await }
        async fn active_orders(&self) -> Result<Vec<ActiveOrder>, StoreError> { self.0.active_orders().await }
        async fn order(&self, id: &str) -> Result<Option<Order>, StoreError> { self.0.order(id).await }
        async fn update_order(&self, id: &str, p: &OrderPatch) -> Result<Order, StoreError> { self.0.update_order(id, p).await }
        async fn insert_order(&self, o: &NewOrder) -> Result<Order, StoreError> { self.0.insert_order(o).await }
        async fn resolve_store(&self, id: Option<&str>) -> Result<Option<StoreRef>, StoreError> { self.0.resolve_store(id).await }
        async fn open_issue(&self, _order_id: &str, _kind: IssueType) -> Result<Option<Issue>, StoreError> { Ok(None) }
        async fn insert_issue(&self, i: &NewIssue) -> Result<Issue, StoreError> { self.0.insert_issue(i).await }
        async fn push_tokens(&self) -> Result<Vec<String>, StoreError> { self.0.push_tokens().await }
        async fn set_push_token(&self, user: &str, token: &str) -> Result<(), StoreError> { self.0.set_push_token(user, token).await }
    }

    #[tokio::test]
    async fn insert_conflict_counts_as_already_open() {
        let inner = MemoryStore::new();
        inner.seed_order(order_aged("o-race", "s1", OrderStatus::New, 45));
        // another writer already opened it
        inner.insert_issue(&NewIssue::open("o-race".into(), IssueType::Late, 44.0)).await.unwrap();
        let store = Arc::new(BlindCheckStore(inner));

        let hub = Arc::new(NotificationHub::new(
            Arc::new(Transport::new()),
            store.clone(),
            Arc::new(LogPush::new()),
            Duration::from_millis(200),
        ));
        let mon = Monitor::new(store.clone(), hub.clone(), RULES, Duration::from_millis(200));
        let (member, mut rx) = hub.transport().connect();
        hub.transport().join(member, "s1");
        let before = ISSUE_DUPLICATES.with_label_values(&["late"]).get();

        assert!(mon.scan_at(Utc::now()).await.is_empty());

        assert!(ISSUE_DUPLICATES.with_label_values(&["late"]).get() >= before + 1);
        assert_eq!(store.0.issues_snapshot().len(), 1);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn per_store_threshold_overrides_default() {
        let now = Utc::now();
        let row = |age: i64, sla: Option<f64>| ActiveOrder {
            order: order_aged("o", "s", OrderStatus::New, age),
            stores: Some(crate::domain::StoreSla { sla_breach_minutes: sla }),
        };
        assert_eq!(evaluate(&row(16, Some(15.0)), now, &RULES).len(), 1);
        assert!(evaluate(&row(16, None), now, &RULES).is_empty());
        // non-positive thresholds fall back to the default
        assert!(evaluate(&row(16, Some(0.0)), now, &RULES).is_empty());
        assert_eq!(evaluate(&row(31, Some(-1.0)), now, &RULES)[0].0, IssueType::Late);
    }

    #[test]
    fn ready_without_timestamp_is_not_flagged() {
        let row = ActiveOrder { order: order_aged("o", "s", OrderStatus::Ready, 120), stores: None };
        assert!(evaluate(&row, Utc::now(), &RULES).is_empty());
    }
}
