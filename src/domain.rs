// ===============================
// src/domain.rs
// ===============================
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type ClientId = u64;

/// Ids arrive from clients as either JSON strings or numbers.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Key {
    Text(String),
    Number(i64),
}

impl Key {
    pub fn into_string(self) -> String {
        match self {
            Key::Text(s) => s,
            Key::Number(n) => n.to_string(),
        }
    }
}

// -------- Fleet --------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Driver {
    pub external_id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub heading: Option<f64>,
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub battery: Option<f64>,
    #[serde(default)]
    pub altitude: Option<f64>,
    #[serde(default)]
    pub status: Option<String>,
}

impl Driver {
    pub fn heading(&self) -> f64 { self.heading.filter(|h| h.is_finite()).unwrap_or(0.0) }
    pub fn speed(&self) -> f64 { self.speed.filter(|s| s.is_finite()).unwrap_or(10.0) }
    pub fn is_online(&self) -> bool {
        matches!(self.status.as_deref(), Some("online") | Some("available") | Some("idle"))
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct GeoPoint { pub lat: f64, pub lng: f64 }

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct Telemetry {
    pub speed: f64,
    pub battery: Option<f64>,
    pub heading: f64,
    pub altitude: Option<f64>,
}

/// Client-facing shape of one driver inside `driversUpdate`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DriverTelemetry {
    pub id: String,
    pub name: Option<String>,
    pub location: GeoPoint,
    pub telemetry: Telemetry,
    pub online_status: Option<String>,
}

impl From<&Driver> for DriverTelemetry {
    fn from(d: &Driver) -> Self {
        Self {
            id: d.external_id.clone(),
            name: d.name.clone(),
            location: GeoPoint { lat: d.latitude, lng: d.longitude },
            telemetry: Telemetry {
                speed: d.speed(),
                battery: d.battery,
                heading: d.heading(),
                altitude: d.altitude,
            },
            online_status: d.status.clone(),
        }
    }
}

pub fn round2(x: f64) -> f64 { (x * 100.0).round() / 100.0 }

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MarketUpdate {
    pub liquidity_ratio: f64,
    pub discovery_gap: f64,
    pub active_trips: usize,
}

// -------- Trips --------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TripStatus { Negotiating, Matched }

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OfferKind {
    #[serde(rename = "Rider Proposal")]
    RiderProposal,
    #[serde(rename = "Driver Counter")]
    DriverCounter,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NegotiationEntry {
    #[serde(rename = "type")]
    pub kind: OfferKind,
    pub price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_id: Option<String>,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trip {
    pub id: String,
    pub external_id: String,
    pub rider_id: String,
    pub initial_offer: f64,
    pub current_price: f64,
    #[serde(default)]
    pub final_price: Option<f64>,
    #[serde(default)]
    pub negotiation_history: Vec<NegotiationEntry>,
    pub status: TripStatus,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Trip {
    /// Clients may reference a trip by its external id or the store's id.
    pub fn matches(&self, trip_id: &str) -> bool {
        self.external_id == trip_id || self.id == trip_id
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NewTrip {
    pub external_id: String,
    pub rider_id: String,
    pub initial_offer: f64,
    pub current_price: f64,
    pub negotiation_history: Vec<NegotiationEntry>,
    pub status: TripStatus,
}

impl NewTrip {
    pub fn proposal(external_id: String, rider_id: String, amount: f64, now: DateTime<Utc>) -> Self {
        Self {
            external_id,
            rider_id,
            initial_offer: amount,
            current_price: amount,
            negotiation_history: vec![NegotiationEntry {
                kind: OfferKind::RiderProposal,
                price: amount,
                driver_id: None,
                time: now,
            }],
            status: TripStatus::Negotiating,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TripPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub negotiation_history: Option<Vec<NegotiationEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TripStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_price: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

impl TripPatch {
    /// Appends a driver counter to the existing history; never rewrites earlier entries.
    pub fn counter(trip: &Trip, driver_id: String, amount: f64, now: DateTime<Utc>) -> Self {
        let mut history = trip.negotiation_history.clone();
        history.push(NegotiationEntry {
            kind: OfferKind::DriverCounter,
            price: amount,
            driver_id: Some(driver_id),
            time: now,
        });
        Self {
            current_price: Some(amount),
            negotiation_history: Some(history),
            status: None,
            final_price: None,
            updated_at: now,
        }
    }

    pub fn matched(trip: &Trip, now: DateTime<Utc>) -> Self {
        Self {
            current_price: None,
            negotiation_history: None,
            status: Some(TripStatus::Matched),
            final_price: Some(trip.current_price),
            updated_at: now,
        }
    }

    pub fn apply(&self, trip: &mut Trip) {
        if let Some(p) = self.current_price { trip.current_price = p; }
        if let Some(h) = &self.negotiation_history { trip.negotiation_history = h.clone(); }
        if let Some(s) = self.status { trip.status = s; }
        if let Some(f) = self.final_price { trip.final_price = Some(f); }
        trip.updated_at = Some(self.updated_at);
    }
}

// -------- Orders --------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus { New, InProgress, Ready, Completed }

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "new",
            OrderStatus::InProgress => "in_progress",
            OrderStatus::Ready => "ready",
            OrderStatus::Completed => "completed",
        }
    }

    /// Human form used in push copy ("in progress").
    pub fn label(&self) -> String { self.as_str().replacen('_', " ", 1) }

    pub fn is_active(&self) -> bool { !matches!(self, OrderStatus::Completed) }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown order status {:?}", self.0)
    }
}

impl FromStr for OrderStatus {
    type Err = UnknownStatus;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "new" => Ok(OrderStatus::New),
            "in_progress" => Ok(OrderStatus::InProgress),
            "ready" => Ok(OrderStatus::Ready),
            "completed" => Ok(OrderStatus::Completed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub id: String,
    pub store_id: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub total_amount: f64,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub accepted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ready_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Row returned by the SLA query: the order plus its store's breach setting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActiveOrder {
    #[serde(flatten)]
    pub order: Order,
    #[serde(default)]
    pub stores: Option<StoreSla>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StoreSla {
    #[serde(default)]
    pub sla_breach_minutes: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreRef {
    pub id: String,
    #[serde(default)]
    pub organization_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NewOrder {
    pub customer_name: String,
    pub total_amount: f64,
    pub status: OrderStatus,
    pub store_id: Option<String>,
    pub tenant_id: Option<String>,
    pub items: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OrderPatch {
    pub status: OrderStatus,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accepted_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl OrderPatch {
    /// Milestone timestamps are written only the first time a status is reached.
    pub fn transition(current: &Order, status: OrderStatus, now: DateTime<Utc>) -> Self {
        let mut patch = Self {
            status,
            updated_at: now,
            accepted_at: None,
            ready_at: None,
            completed_at: None,
        };
        match status {
            OrderStatus::InProgress if current.accepted_at.is_none() => patch.accepted_at = Some(now),
            OrderStatus::Ready if current.ready_at.is_none() => patch.ready_at = Some(now),
            OrderStatus::Completed if current.completed_at.is_none() => patch.completed_at = Some(now),
            _ => {}
        }
        patch
    }

    pub fn apply(&self, order: &mut Order) {
        order.status = self.status;
        order.updated_at = Some(self.updated_at);
        if self.accepted_at.is_some() { order.accepted_at = self.accepted_at; }
        if self.ready_at.is_some() { order.ready_at = self.ready_at; }
        if self.completed_at.is_some() { order.completed_at = self.completed_at; }
    }
}

// -------- Issues --------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IssueType { Late, PickupDelay }

impl IssueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueType::Late => "late",
            IssueType::PickupDelay => "pickup_delay",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            IssueType::Late => Severity::High,
            IssueType::PickupDelay => Severity::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Severity { Medium, High }

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus { Open, Resolved }

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Issue {
    pub id: String,
    pub order_id: String,
    #[serde(rename = "type")]
    pub kind: IssueType,
    pub severity: Severity,
    pub status: IssueStatus,
    #[serde(default)]
    pub resolution_notes: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NewIssue {
    pub order_id: String,
    #[serde(rename = "type")]
    pub kind: IssueType,
    pub severity: Severity,
    pub status: IssueStatus,
    pub resolution_notes: String,
}

impl NewIssue {
    pub fn open(order_id: String, kind: IssueType, minutes: f64) -> Self {
        let resolution_notes = match kind {
            IssueType::Late => format!("System detected SLA breach at {:.0} mins.", minutes),
            IssueType::PickupDelay => format!("Order waiting on shelf for {:.0} mins.", minutes),
        };
        Self { order_id, kind, severity: kind.severity(), status: IssueStatus::Open, resolution_notes }
    }
}

// -------- Realtime wire --------

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OrderNotice {
    #[serde(flatten)]
    pub order: Order,
    pub reason: Option<String>,
}

/// Minimal relay of a database change notification.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderSyncNotice {
    pub id: serde_json::Value,
    pub status: serde_json::Value,
    pub updated_at: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NegotiationFailure {
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trip_id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    Joined { room: String },
    DriversUpdate(Vec<DriverTelemetry>),
    MarketUpdate(MarketUpdate),
    NewTripRequest(Trip),
    TripUpdate(Trip),
    TripMatched(Trip),
    NewIncomingOrder(Order),
    OrderStatusChanged(OrderNotice),
    #[serde(rename = "orderStatusChanged")]
    OrderStatusSynced(OrderSyncNotice),
    NewIssue(Issue),
    NegotiationFailed(NegotiationFailure),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Joined { .. } => "joined",
            ServerEvent::DriversUpdate(_) => "driversUpdate",
            ServerEvent::MarketUpdate(_) => "marketUpdate",
            ServerEvent::NewTripRequest(_) => "newTripRequest",
            ServerEvent::TripUpdate(_) => "tripUpdate",
            ServerEvent::TripMatched(_) => "tripMatched",
            ServerEvent::NewIncomingOrder(_) => "newIncomingOrder",
            ServerEvent::OrderStatusChanged(_) | ServerEvent::OrderStatusSynced(_) => "orderStatusChanged",
            ServerEvent::NewIssue(_) => "newIssue",
            ServerEvent::NegotiationFailed(_) => "negotiationFailed",
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProposeFare { pub rider_id: Key, pub amount: f64 }

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CounterOffer { pub trip_id: Key, pub driver_id: Key, pub amount: f64 }

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AcceptFare { pub trip_id: Key }

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    #[serde(rename = "join_store")]
    JoinStore(Key),
    ProposeFare(ProposeFare),
    DriverCounterOffer(CounterOffer),
    AcceptFare(AcceptFare),
}

// -------- Recording --------

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", content = "target", rename_all = "snake_case")]
pub enum Audience {
    All,
    Room(String),
    Client(ClientId),
}

#[derive(Debug, Clone, Serialize)]
pub struct Recorded {
    pub ts: DateTime<Utc>,
    pub audience: Audience,
    pub event: ServerEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn order(status: OrderStatus) -> Order {
        Order {
            id: "ord-1".into(),
            store_id: "s1".into(),
            tenant_id: None,
            customer_name: Some("Ana".into()),
            total_amount: 18.5,
            status,
            created_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
            accepted_at: None,
            ready_at: None,
            completed_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn milestone_timestamps_are_stamped_once() {
        let mut o = order(OrderStatus::New);
        let t1 = o.created_at + Duration::minutes(5);
        OrderPatch::transition(&o, OrderStatus::Ready, t1).apply(&mut o);
        assert_eq!(o.ready_at, Some(t1));

        let t2 = t1 + Duration::minutes(3);
        let again = OrderPatch::transition(&o, OrderStatus::Ready, t2);
        assert!(again.ready_at.is_none());
        again.apply(&mut o);
        assert_eq!(o.ready_at, Some(t1));
        assert_eq!(o.updated_at, Some(t2));
    }

    #[test]
    fn status_labels() {
        assert_eq!(OrderStatus::InProgress.label(), "in progress");
        assert_eq!("ready".parse::<OrderStatus>(), Ok(OrderStatus::Ready));
        assert!("cooking".parse::<OrderStatus>().is_err());
    }

    #[test]
    fn parses_client_frames() {
        let ev: ClientEvent = serde_json::from_str(r#"{"event":"join_store","data":42}"#).unwrap();
        assert_eq!(ev, ClientEvent::JoinStore(Key::Number(42)));

        let ev: ClientEvent = serde_json::from_str(
            r#"{"event":"driverCounterOffer","data":{"tripId":"TRIP-ABC","driverId":"d-7","amount":15}}"#,
        )
        .unwrap();
        match ev {
            ClientEvent::DriverCounterOffer(c) => {
                assert_eq!(c.trip_id.into_string(), "TRIP-ABC");
                assert_eq!(c.amount, 15.0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn server_frames_carry_event_name() {
        let ev = ServerEvent::MarketUpdate(MarketUpdate { liquidity_ratio: 0.5, discovery_gap: 1.25, active_trips: 3 });
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["event"], "marketUpdate");
        assert_eq!(v["data"]["activeTrips"], 3);

        let notice = ServerEvent::OrderStatusChanged(OrderNotice { order: order(OrderStatus::Ready), reason: Some("packed".into()) });
        let v = serde_json::to_value(&notice).unwrap();
        assert_eq!(v["event"], "orderStatusChanged");
        assert_eq!(v["data"]["status"], "ready");
        assert_eq!(v["data"]["reason"], "packed");
        assert_eq!(notice.name(), "orderStatusChanged");
    }

    #[test]
    fn history_entries_use_readable_types() {
        let now = Utc::now();
        let t = NewTrip::proposal("TRIP-1".into(), "r1".into(), 12.0, now);
        let v = serde_json::to_value(&t).unwrap();
        assert_eq!(v["negotiation_history"][0]["type"], "Rider Proposal");
        assert!(v["negotiation_history"][0].get("driverId").is_none());
    }
}
