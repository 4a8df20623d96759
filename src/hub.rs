// ===============================
// src/hub.rs (notification hub)
// ===============================
//
// Every outbound realtime frame goes through here:
// - trip / fleet / market frames to all clients
// - issues and new orders to the store room
// - order status changes to the store room AND all clients
//   (store dashboards + unscoped monitoring audience)
// Push alerts are a detached fan-out: one task per distinct token,
// never awaited by the broadcast path.
//
use ahash::AHashSet as HashSet;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::{sync::mpsc, task::JoinHandle, task::JoinSet};
use tracing::{debug, error, info, warn};

use crate::domain::{
    Audience, ClientId, Driver, DriverTelemetry, Issue, MarketUpdate, NegotiationFailure, Order,
    OrderNotice, OrderSyncNotice, Recorded, ServerEvent, Trip,
};
use crate::metrics::{FRAMES_SENT, PUSH_RESULTS, RECORDER_DROPPED};
use crate::push::{PushError, PushGateway, PushMessage};
use crate::store::{bounded, Store};
use crate::transport::{room_name, Frame, Transport};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushSummary {
    pub delivered: usize,
    pub failed: usize,
}

pub struct NotificationHub {
    transport: Arc<Transport>,
    store: Arc<dyn Store>,
    push: Arc<dyn PushGateway>,
    call_timeout: Duration,
    recorder: Option<mpsc::Sender<Recorded>>,
}

impl NotificationHub {
    pub fn new(
        transport: Arc<Transport>,
        store: Arc<dyn Store>,
        push: Arc<dyn PushGateway>,
        call_timeout: Duration,
    ) -> Self {
        Self { transport, store, push, call_timeout, recorder: None }
    }

    pub fn with_recorder(mut self, tx: mpsc::Sender<Recorded>) -> Self {
        self.recorder = Some(tx);
        self
    }

    pub fn transport(&self) -> &Arc<Transport> { &self.transport }

    fn emit(&self, audience: Audience, event: ServerEvent) -> usize {
        let frame: Frame = match serde_json::to_string(&event) {
            Ok(s) => Arc::from(s),
            Err(e) => {
                error!(?e, event = event.name(), "frame serialize failed");
                return 0;
            }
        };
        let (delivered, label) = match &audience {
            Audience::All => (self.transport.send_all(&frame), "all"),
            Audience::Room(store_id) => (self.transport.send_room(store_id, &frame), "room"),
            Audience::Client(id) => (usize::from(self.transport.send_to(*id, &frame)), "client"),
        };
        FRAMES_SENT.with_label_values(&[event.name(), label]).inc();
        if let Some(tx) = &self.recorder {
            let audience = match audience {
                Audience::Room(store_id) => Audience::Room(room_name(&store_id)),
                other => other,
            };
            let name = event.name();
            // a full queue never stalls the broadcast; the line is counted and dropped
            if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(Recorded { ts: Utc::now(), audience, event }) {
                RECORDER_DROPPED.inc();
                debug!(event = name, "recorder queue full, frame not recorded");
            }
        }
        delivered
    }

    pub fn broadcast(&self, event: ServerEvent) -> usize { self.emit(Audience::All, event) }

    pub fn to_store(&self, store_id: &str, event: ServerEvent) -> usize {
        self.emit(Audience::Room(store_id.to_string()), event)
    }

    pub fn to_client(&self, id: ClientId, event: ServerEvent) -> bool {
        self.emit(Audience::Client(id), event) > 0
    }

    // ---- fleet / negotiation ----

    pub fn publish_fleet(&self, drivers: &[Driver], market: MarketUpdate) {
        let telemetry = drivers.iter().map(DriverTelemetry::from).collect();
        self.broadcast(ServerEvent::DriversUpdate(telemetry));
        self.broadcast(ServerEvent::MarketUpdate(market));
    }

    pub fn trip_proposed(&self, trip: Trip) { self.broadcast(ServerEvent::NewTripRequest(trip)); }
    pub fn trip_updated(&self, trip: Trip) { self.broadcast(ServerEvent::TripUpdate(trip)); }
    pub fn trip_matched(&self, trip: Trip) { self.broadcast(ServerEvent::TripMatched(trip)); }

    pub fn negotiation_failed(&self, client: ClientId, failure: NegotiationFailure) {
        self.to_client(client, ServerEvent::NegotiationFailed(failure));
    }

    // ---- orders / issues ----

    pub fn notify_new_issue(&self, store_id: &str, issue: Issue) {
        self.to_store(store_id, ServerEvent::NewIssue(issue));
    }

    /// Room + global broadcast, then a detached push fan-out.
    pub fn notify_order_status_change(&self, order: Order, reason: Option<String>) -> JoinHandle<PushSummary> {
        info!(order = %order.id, status = %order.status, "notifying status change");
        let label = order.status.label();
        let title = format!("Order {label}! 📦");
        let body = format!(
            "Order #{} for {} is now {label}.",
            short_id(&order.id),
            order.customer_name.as_deref().unwrap_or("customer"),
        );
        let data = json!({ "orderId": order.id, "status": order.status, "type": "status_update" });

        let notice = OrderNotice { order, reason };
        self.to_store(&notice.order.store_id.clone(), ServerEvent::OrderStatusChanged(notice.clone()));
        self.broadcast(ServerEvent::OrderStatusChanged(notice));

        self.dispatch_push(title, body, data)
    }

    /// Store room only, then a detached push fan-out.
    pub fn notify_new_order(&self, order: Order) -> JoinHandle<PushSummary> {
        info!(order = %order.id, store = %order.store_id, "notifying new order");
        let body = format!("A new order of ${:.2} is waiting for acceptance.", order.total_amount);
        let data = json!({ "orderId": order.id, "type": "new_order" });
        self.to_store(&order.store_id.clone(), ServerEvent::NewIncomingOrder(order));
        self.dispatch_push("New Order Received! 🍱".to_string(), body, data)
    }

    /// Relays a database change notification; no push.
    pub fn relay_order_sync(&self, store_id: &str, notice: OrderSyncNotice) {
        self.to_store(store_id, ServerEvent::OrderStatusSynced(notice.clone()));
        self.broadcast(ServerEvent::OrderStatusSynced(notice));
    }

    fn dispatch_push(&self, title: String, body: String, data: serde_json::Value) -> JoinHandle<PushSummary> {
        let store = self.store.clone();
        let push = self.push.clone();
        let limit = self.call_timeout;

        tokio::spawn(async move {
            let tokens = match bounded(limit, "push_tokens", store.push_tokens()).await {
                Ok(t) => t,
                Err(e) => {
                    warn!(error = %e, "push fan-out skipped: token lookup failed");
                    return PushSummary::default();
                }
            };
            let mut seen = HashSet::new();
            let tokens: Vec<String> = tokens.into_iter().filter(|t| seen.insert(t.clone())).collect();
            if tokens.is_empty() {
                return PushSummary::default();
            }
            info!(tokens = tokens.len(), %title, "dispatching push");

            let mut tasks = JoinSet::new();
            for token in tokens {
                let push = push.clone();
                let msg = PushMessage::new(token, &title, &body, data.clone());
                tasks.spawn(async move {
                    let outcome = match tokio::time::timeout(limit, push.send(&msg)).await {
                        Ok(res) => res,
                        Err(_) => Err(PushError::Timeout),
                    };
                    outcome.map_err(|e| (msg.to, e))
                });
            }

            let mut summary = PushSummary::default();
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(Ok(())) => {
                        summary.delivered += 1;
                        PUSH_RESULTS.with_label_values(&["ok"]).inc();
                    }
                    Ok(Err((token, e))) => {
                        summary.failed += 1;
                        PUSH_RESULTS.with_label_values(&[e.label()]).inc();
                        warn!(%token, error = %e, "push failed");
                    }
                    Err(e) => {
                        summary.failed += 1;
                        error!(?e, "push task aborted");
                    }
                }
            }
            info!(delivered = summary.delivered, failed = summary.failed, "push fan-out done");
            summary
        })
    }
}

fn short_id(id: &str) -> &str {
    id.char_indices().nth(8).map(|(i, _)| &id[..i]).unwrap_or(id)
}
