// ===============================
// src/store.rs (persistence gateway + in-memory backend)
// ===============================
use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::domain::{
    ActiveOrder, Driver, Issue, IssueStatus, IssueType, NewIssue, NewOrder, NewTrip, Order,
    OrderPatch, OrderStatus, StoreRef, StoreSla, Trip, TripPatch, TripStatus,
};
use crate::metrics::STORE_TIMEOUTS;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("store returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("bad store url: {0}")]
    Url(#[from] url::ParseError),
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Record operations the coordinator needs from the hosted data store.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn drivers(&self) -> Result<Vec<Driver>, StoreError>;
    async fn update_driver_position(&self, driver: &Driver) -> Result<(), StoreError>;

    async fn negotiating_trips(&self) -> Result<Vec<Trip>, StoreError>;
    async fn insert_trip(&self, trip: &NewTrip) -> Result<Trip, StoreError>;
    async fn update_trip(&self, id: &str, patch: &TripPatch) -> Result<Trip, StoreError>;

    async fn active_orders(&self) -> Result<Vec<ActiveOrder>, StoreError>;
    async fn order(&self, id: &str) -> Result<Option<Order>, StoreError>;
    async fn update_order(&self, id: &str, patch: &OrderPatch) -> Result<Order, StoreError>;
    async fn insert_order(&self, order: &NewOrder) -> Result<Order, StoreError>;
    /// The named store, or the first store when `id` is unknown or absent.
    async fn resolve_store(&self, id: Option<&str>) -> Result<Option<StoreRef>, StoreError>;

    async fn open_issue(&self, order_id: &str, kind: IssueType) -> Result<Option<Issue>, StoreError>;
    /// Rejects a second open issue for the same `(order_id, type)` with `Conflict`.
    async fn insert_issue(&self, issue: &NewIssue) -> Result<Issue, StoreError>;

    async fn push_tokens(&self) -> Result<Vec<String>, StoreError>;
    async fn set_push_token(&self, user_id: &str, token: &str) -> Result<(), StoreError>;
}

/// Bounds a gateway call; an expired call is abandoned, never retried inline.
pub async fn bounded<T, F>(limit: Duration, op: &'static str, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => {
            STORE_TIMEOUTS.with_label_values(&[op]).inc();
            warn!(op, ?limit, "store call abandoned after timeout");
            Err(StoreError::Timeout(op))
        }
    }
}

// -----------------------------------------------------------------------------
// In-memory backend: demo mode and tests.
// -----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Tables {
    drivers: Vec<Driver>,
    trips: Vec<Trip>,
    orders: Vec<Order>,
    stores: Vec<(StoreRef, StoreSla)>,
    issues: Vec<Issue>,
    users: HashMap<String, Option<String>>,
    seq: u64,
}

impl Tables {
    fn next_id(&mut self, prefix: &str) -> String {
        self.seq += 1;
        format!("{prefix}-{:06}", self.seq)
    }
}

#[derive(Debug, Default)]
struct Faults {
    offline: bool,
    drivers: Vec<String>,
    delay: Option<Duration>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    faults: Mutex<Faults>,
    calls: Mutex<HashMap<&'static str, usize>>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    /// A fleet scattered around a city centre plus one store.
    pub fn with_demo_fleet(drivers: usize) -> Self {
        let store = Self::new();
        let mut rng = rand::thread_rng();
        let fleet = (0..drivers)
            .map(|i| Driver {
                external_id: format!("DRV-{:03}", i + 1),
                name: Some(format!("Driver {}", i + 1)),
                latitude: -6.2088 + rng.gen_range(-0.03..0.03),
                longitude: 106.8456 + rng.gen_range(-0.03..0.03),
                heading: Some(rng.gen_range(0.0..360.0)),
                speed: Some(rng.gen_range(10.0..60.0)),
                battery: Some(rng.gen_range(40.0..100.0_f64).round()),
                altitude: Some(8.0),
                status: Some(if i % 4 == 3 { "busy" } else { "online" }.to_string()),
            })
            .collect();
        store.seed_drivers(fleet);
        store.seed_store(StoreRef { id: "store-1".into(), organization_id: Some("org-1".into()) }, None);
        store
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn seed_drivers(&self, drivers: Vec<Driver>) { self.lock().drivers = drivers; }

    pub fn seed_store(&self, store: StoreRef, sla_breach_minutes: Option<f64>) {
        self.lock().stores.push((store, StoreSla { sla_breach_minutes }));
    }

    async fn enter(&self, op: &'static str) -> Result<(), StoreError> {
        *self.calls.lock().unwrap_or_else(|e| e.into_inner()).entry(op).or_insert(0) += 1;
        let (offline, delay) = {
            let f = self.faults.lock().unwrap_or_else(|e| e.into_inner());
            (f.offline, f.delay)
        };
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        if offline {
            return Err(StoreError::Unavailable(op.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
impl MemoryStore {
    pub fn seed_order(&self, order: Order) { self.lock().orders.push(order); }

    pub fn seed_trip(&self, trip: Trip) { self.lock().trips.push(trip); }

    pub fn seed_user(&self, user_id: &str, token: Option<&str>) {
        self.lock().users.insert(user_id.to_string(), token.map(str::to_string));
    }

    /// Every call fails with `Unavailable` while set.
    pub fn set_offline(&self, offline: bool) {
        self.faults.lock().unwrap_or_else(|e| e.into_inner()).offline = offline;
    }

    /// Position updates for this driver fail.
    pub fn fail_driver(&self, external_id: &str) {
        self.faults.lock().unwrap_or_else(|e| e.into_inner()).drivers.push(external_id.to_string());
    }

    /// Every call sleeps this long before answering.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.faults.lock().unwrap_or_else(|e| e.into_inner()).delay = delay;
    }

    pub fn calls(&self, op: &'static str) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).get(op).copied().unwrap_or(0)
    }

    pub fn drivers_snapshot(&self) -> Vec<Driver> { self.lock().drivers.clone() }
    pub fn trips_snapshot(&self) -> Vec<Trip> { self.lock().trips.clone() }
    pub fn issues_snapshot(&self) -> Vec<Issue> { self.lock().issues.clone() }
    pub fn orders_snapshot(&self) -> Vec<Order> { self.lock().orders.clone() }

    pub fn resolve_issue(&self, issue_id: &str) {
        if let Some(i) = self.lock().issues.iter_mut().find(|i| i.id == issue_id) {
            i.status = IssueStatus::Resolved;
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn drivers(&self) -> Result<Vec<Driver>, StoreError> {
        self.enter("drivers").await?;
        Ok(self.lock().drivers.clone())
    }

    async fn update_driver_position(&self, driver: &Driver) -> Result<(), StoreError> {
        self.enter("update_driver_position").await?;
        let failing = self
            .faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drivers
            .iter()
            .any(|id| id == &driver.external_id);
        if failing {
            return Err(StoreError::Unavailable(format!("driver {}", driver.external_id)));
        }
        let mut t = self.lock();
        let row = t
            .drivers
            .iter_mut()
            .find(|d| d.external_id == driver.external_id)
            .ok_or_else(|| StoreError::NotFound(driver.external_id.clone()))?;
        row.latitude = driver.latitude;
        row.longitude = driver.longitude;
        row.heading = driver.heading;
        row.speed = driver.speed;
        Ok(())
    }

    async fn negotiating_trips(&self) -> Result<Vec<Trip>, StoreError> {
        self.enter("negotiating_trips").await?;
        Ok(self.lock().trips.iter().filter(|t| t.status == TripStatus::Negotiating).cloned().collect())
    }

    async fn insert_trip(&self, trip: &NewTrip) -> Result<Trip, StoreError> {
        self.enter("insert_trip").await?;
        let mut t = self.lock();
        let now = Utc::now();
        let row = Trip {
            id: t.next_id("trip"),
            external_id: trip.external_id.clone(),
            rider_id: trip.rider_id.clone(),
            initial_offer: trip.initial_offer,
            current_price: trip.current_price,
            final_price: None,
            negotiation_history: trip.negotiation_history.clone(),
            status: trip.status,
            created_at: Some(now),
            updated_at: Some(now),
        };
        t.trips.push(row.clone());
        Ok(row)
    }

    async fn update_trip(&self, id: &str, patch: &TripPatch) -> Result<Trip, StoreError> {
        self.enter("update_trip").await?;
        let mut t = self.lock();
        let row = t.trips.iter_mut().find(|t| t.id == id).ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        patch.apply(row);
        Ok(row.clone())
    }

    async fn active_orders(&self) -> Result<Vec<ActiveOrder>, StoreError> {
        self.enter("active_orders").await?;
        let t = self.lock();
        Ok(t.orders
            .iter()
            .filter(|o| o.status.is_active())
            .map(|o| ActiveOrder {
                order: o.clone(),
                stores: t.stores.iter().find(|(s, _)| s.id == o.store_id).map(|(_, sla)| sla.clone()),
            })
            .collect())
    }

    async fn order(&self, id: &str) -> Result<Option<Order>, StoreError> {
        self.enter("order").await?;
        Ok(self.lock().orders.iter().find(|o| o.id == id).cloned())
    }

    async fn update_order(&self, id: &str, patch: &OrderPatch) -> Result<Order, StoreError> {
        self.enter("update_order").await?;
        let mut t = self.lock();
        let row = t.orders.iter_mut().find(|o| o.id == id).ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        patch.apply(row);
        Ok(row.clone())
    }

    async fn insert_order(&self, order: &NewOrder) -> Result<Order, StoreError> {
        self.enter("insert_order").await?;
        let mut t = self.lock();
        let store_id = order.store_id.clone().ok_or_else(|| StoreError::Conflict("order without store".into()))?;
        let row = Order {
            id: t.next_id("order"),
            store_id,
            tenant_id: order.tenant_id.clone(),
            customer_name: Some(order.customer_name.clone()),
            total_amount: order.total_amount,
            status: OrderStatus::New,
            created_at: Utc::now(),
            accepted_at: None,
            ready_at: None,
            completed_at: None,
            updated_at: None,
        };
        t.orders.push(row.clone());
        Ok(row)
    }

    async fn resolve_store(&self, id: Option<&str>) -> Result<Option<StoreRef>, StoreError> {
        self.enter("resolve_store").await?;
        let t = self.lock();
        let named = id.and_then(|id| t.stores.iter().find(|(s, _)| s.id == id));
        Ok(named.or_else(|| t.stores.first()).map(|(s, _)| s.clone()))
    }

    async fn open_issue(&self, order_id: &str, kind: IssueType) -> Result<Option<Issue>, StoreError> {
        self.enter("open_issue").await?;
        Ok(self
            .lock()
            .issues
            .iter()
            .find(|i| i.order_id == order_id && i.kind == kind && i.status == IssueStatus::Open)
            .cloned())
    }

    async fn insert_issue(&self, issue: &NewIssue) -> Result<Issue, StoreError> {
        self.enter("insert_issue").await?;
        let mut t = self.lock();
        let duplicate = t
            .issues
            .iter()
            .any(|i| i.order_id == issue.order_id && i.kind == issue.kind && i.status == IssueStatus::Open);
        if duplicate {
            return Err(StoreError::Conflict(format!("open {} issue for {}", issue.kind.as_str(), issue.order_id)));
        }
        let row = Issue {
            id: t.next_id("issue"),
            order_id: issue.order_id.clone(),
            kind: issue.kind,
            severity: issue.severity,
            status: issue.status,
            resolution_notes: Some(issue.resolution_notes.clone()),
            created_at: Some(Utc::now()),
        };
        t.issues.push(row.clone());
        Ok(row)
    }

    async fn push_tokens(&self) -> Result<Vec<String>, StoreError> {
        self.enter("push_tokens").await?;
        Ok(self.lock().users.values().flatten().cloned().collect())
    }

    async fn set_push_token(&self, user_id: &str, token: &str) -> Result<(), StoreError> {
        self.enter("set_push_token").await?;
        let mut t = self.lock();
        let slot = t.users.get_mut(user_id).ok_or_else(|| StoreError::NotFound(user_id.to_string()))?;
        *slot = Some(token.to_string());
        Ok(())
    }
}

/// An order created `age_minutes` ago.
#[cfg(test)]
pub fn order_aged(id: &str, store_id: &str, status: OrderStatus, age_minutes: i64) -> Order {
    Order {
        id: id.to_string(),
        store_id: store_id.to_string(),
        tenant_id: None,
        customer_name: Some("Walk-in".into()),
        total_amount: 24.0,
        status,
        created_at: Utc::now() - chrono::Duration::minutes(age_minutes),
        accepted_at: None,
        ready_at: None,
        completed_at: None,
        updated_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_issue_uniqueness_is_enforced() {
        let store = MemoryStore::new();
        let first = store.insert_issue(&NewIssue::open("o1".into(), IssueType::Late, 31.0)).await.unwrap();
        let dup = store.insert_issue(&NewIssue::open("o1".into(), IssueType::Late, 32.0)).await;
        assert!(matches!(dup, Err(StoreError::Conflict(_))));

        // a different type on the same order is fine
        store.insert_issue(&NewIssue::open("o1".into(), IssueType::PickupDelay, 21.0)).await.unwrap();

        // once resolved, a fresh one may be opened
        store.resolve_issue(&first.id);
        store.insert_issue(&NewIssue::open("o1".into(), IssueType::Late, 45.0)).await.unwrap();
        assert_eq!(store.issues_snapshot().len(), 3);
    }

    #[tokio::test]
    async fn resolve_store_falls_back_to_first() {
        let store = MemoryStore::with_demo_fleet(2);
        let s = store.resolve_store(Some("nope")).await.unwrap().unwrap();
        assert_eq!(s.id, "store-1");
        assert_eq!(store.drivers().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn bounded_abandons_slow_calls() {
        let store = MemoryStore::new();
        store.set_delay(Some(Duration::from_millis(200)));
        let res = bounded(Duration::from_millis(10), "drivers", store.drivers()).await;
        assert!(matches!(res, Err(StoreError::Timeout("drivers"))));
    }

    #[tokio::test]
    async fn push_tokens_skip_users_without_token() {
        let store = MemoryStore::new();
        store.seed_user("u1", Some("ExponentPushToken[a]"));
        store.seed_user("u2", None);
        assert_eq!(store.push_tokens().await.unwrap(), vec!["ExponentPushToken[a]".to_string()]);
        store.set_push_token("u2", "ExponentPushToken[b]").await.unwrap();
        assert_eq!(store.push_tokens().await.unwrap().len(), 2);
        assert!(matches!(store.set_push_token("ghost", "x").await, Err(StoreError::NotFound(_))));
    }
}
