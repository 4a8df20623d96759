// ===============================
// src/negotiation.rs (fare negotiation state machine)
// ===============================
//
// negotiating --counter--> negotiating --accept--> matched (terminal)
//
// The Negotiator is the single owner of the active trip set. Commands arrive
// over one mpsc queue and are handled to completion (persist + broadcast)
// before the next one starts, so per-trip broadcasts follow persistence order.
// A counter/accept for a trip that is no longer active is a silent no-op.
//
use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::domain::{round2, ClientId, NegotiationFailure, NewTrip, Trip, TripPatch};
use crate::hub::NotificationHub;
use crate::metrics::{
    ACTIVE_TRIPS, NEGOTIATION_FAILURES, NEGOTIATION_STALE, TRIPS_MATCHED, TRIPS_PROPOSED, TRIP_COUNTERS,
};
use crate::store::{bounded, Store, StoreError};

#[derive(Debug, Clone, PartialEq)]
pub enum NegotiationAction {
    Propose { rider_id: String, amount: f64 },
    Counter { trip_id: String, driver_id: String, amount: f64 },
    Accept { trip_id: String },
}

impl NegotiationAction {
    fn name(&self) -> &'static str {
        match self {
            NegotiationAction::Propose { .. } => "proposeFare",
            NegotiationAction::Counter { .. } => "driverCounterOffer",
            NegotiationAction::Accept { .. } => "acceptFare",
        }
    }

    fn trip_id(&self) -> Option<String> {
        match self {
            NegotiationAction::Propose { .. } => None,
            NegotiationAction::Counter { trip_id, .. } | NegotiationAction::Accept { trip_id } => Some(trip_id.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NegotiationCommand {
    pub client: ClientId,
    pub action: NegotiationAction,
}

/// Read-only view of the active set, published for the market summary.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NegotiationStats {
    pub active_trips: usize,
    /// Mean of `current_price - initial_offer` over active trips.
    pub discovery_gap: f64,
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("amount must be a positive number, got {0}")]
    InvalidAmount(f64),
    #[error(transparent)]
    Store(#[from] StoreError),
}

const TRIP_ID_CHARS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

pub fn trip_external_id<R: Rng>(rng: &mut R) -> String {
    let suffix: String = (0..9)
        .map(|_| TRIP_ID_CHARS[rng.gen_range(0..TRIP_ID_CHARS.len())] as char)
        .collect();
    format!("TRIP-{suffix}")
}

fn check_amount(amount: f64) -> Result<(), NegotiationError> {
    if amount.is_finite() && amount > 0.0 {
        Ok(())
    } else {
        Err(NegotiationError::InvalidAmount(amount))
    }
}

pub struct Negotiator {
    store: Arc<dyn Store>,
    hub: Arc<NotificationHub>,
    active: Vec<Trip>,
    stats_tx: watch::Sender<NegotiationStats>,
    call_timeout: Duration,
}

impl Negotiator {
    pub fn new(
        store: Arc<dyn Store>,
        hub: Arc<NotificationHub>,
        stats_tx: watch::Sender<NegotiationStats>,
        call_timeout: Duration,
    ) -> Self {
        Self { store, hub, active: Vec::new(), stats_tx, call_timeout }
    }

    /// Loads trips still negotiating from a previous run.
    pub async fn seed(&mut self) -> Result<usize, StoreError> {
        let trips = bounded(self.call_timeout, "negotiating_trips", self.store.negotiating_trips()).await?;
        self.active = trips;
        self.publish_stats();
        Ok(self.active.len())
    }

    #[cfg(test)]
    pub fn active(&self) -> &[Trip] { &self.active }

    fn position(&self, trip_id: &str) -> Option<usize> {
        self.active.iter().position(|t| t.matches(trip_id))
    }

    fn publish_stats(&self) {
        let active_trips = self.active.len();
        let discovery_gap = if active_trips == 0 {
            0.0
        } else {
            let total: f64 = self.active.iter().map(|t| t.current_price - t.initial_offer).sum();
            round2(total / active_trips as f64)
        };
        ACTIVE_TRIPS.set(active_trips as i64);
        self.stats_tx.send_replace(NegotiationStats { active_trips, discovery_gap });
    }

    pub async fn propose(&mut self, rider_id: String, amount: f64) -> Result<Trip, NegotiationError> {
        check_amount(amount)?;
        // ThreadRng must not live across an .await
        let external_id = trip_external_id(&mut rand::thread_rng());
        let draft = NewTrip::proposal(external_id, rider_id, amount, Utc::now());

        let trip = bounded(self.call_timeout, "insert_trip", self.store.insert_trip(&draft)).await?;

        self.active.push(trip.clone());
        self.publish_stats();
        TRIPS_PROPOSED.inc();
        info!(trip = %trip.external_id, amount, "fare proposed");
        self.hub.trip_proposed(trip.clone());
        Ok(trip)
    }

    /// `Ok(None)` when the trip is no longer negotiable.
    pub async fn counter(&mut self, trip_id: &str, driver_id: String, amount: f64) -> Result<Option<Trip>, NegotiationError> {
        // stale trips are ignored before the amount is looked at
        let Some(idx) = self.position(trip_id) else {
            NEGOTIATION_STALE.with_label_values(&["driverCounterOffer"]).inc();
            debug!(trip = %trip_id, "counter for inactive trip ignored");
            return Ok(None);
        };
        check_amount(amount)?;
        let internal_id = self.active[idx].id.clone();
        let patch = TripPatch::counter(&self.active[idx], driver_id.clone(), amount, Utc::now());

        let updated = bounded(self.call_timeout, "update_trip", self.store.update_trip(&internal_id, &patch)).await?;

        self.active[idx] = updated.clone();
        self.publish_stats();
        TRIP_COUNTERS.inc();
        info!(trip = %updated.external_id, driver = %driver_id, amount, "driver countered");
        self.hub.trip_updated(updated.clone());
        Ok(Some(updated))
    }

    /// `Ok(None)` when the trip is no longer negotiable (e.g. already matched).
    pub async fn accept(&mut self, trip_id: &str) -> Result<Option<Trip>, NegotiationError> {
        let Some(idx) = self.position(trip_id) else {
            NEGOTIATION_STALE.with_label_values(&["acceptFare"]).inc();
            debug!(trip = %trip_id, "accept for inactive trip ignored");
            return Ok(None);
        };
        let internal_id = self.active[idx].id.clone();
        let patch = TripPatch::matched(&self.active[idx], Utc::now());

        let matched = bounded(self.call_timeout, "update_trip", self.store.update_trip(&internal_id, &patch)).await?;

        self.active.remove(idx);
        self.publish_stats();
        TRIPS_MATCHED.inc();
        info!(trip = %matched.external_id, final_price = ?matched.final_price, "trip matched");
        self.hub.trip_matched(matched.clone());
        Ok(Some(matched))
    }

    pub async fn handle(&mut self, cmd: NegotiationCommand) {
        let action = cmd.action.name();
        let trip_id = cmd.action.trip_id();
        let res = match cmd.action {
            NegotiationAction::Propose { rider_id, amount } => self.propose(rider_id, amount).await.map(|_| ()),
            NegotiationAction::Counter { trip_id, driver_id, amount } => {
                self.counter(&trip_id, driver_id, amount).await.map(|_| ())
            }
            NegotiationAction::Accept { trip_id } => self.accept(&trip_id).await.map(|_| ()),
        };
        if let Err(e) = res {
            NEGOTIATION_FAILURES.with_label_values(&[action]).inc();
            warn!(client = cmd.client, action, error = %e, "negotiation step aborted");
            self.hub.negotiation_failed(
                cmd.client,
                NegotiationFailure { action: action.to_string(), trip_id, reason: e.to_string() },
            );
        }
    }
}

/// Negotiation task: drains client commands one at a time.
pub async fn run(mut rx: mpsc::Receiver<NegotiationCommand>, mut negotiator: Negotiator) {
    while let Some(cmd) = rx.recv().await {
        negotiator.handle(cmd).await;
    }
    info!("negotiation: command channel closed, stopped");
}
