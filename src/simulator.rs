// ===============================
// src/simulator.rs (driver position simulator)
// ===============================
//
// Two cadences, one task:
// - resync: replace the working fleet wholesale from the store
// - tick:   dead-reckon every driver, persist best-effort, broadcast
// Both arms run inside one select! loop, so the fleet Vec has exactly
// one writer and a resync never interleaves with a half-applied tick.
//
use futures_util::future::join_all;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::{
    select,
    sync::watch,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::domain::{round2, Driver, MarketUpdate};
use crate::hub::NotificationHub;
use crate::metrics::{DRIVER_PERSIST_ERRORS, FLEET_RESYNC_ERRORS, FLEET_SIZE, FLEET_TICKS};
use crate::negotiation::NegotiationStats;
use crate::store::{bounded, Store};

const KM_PER_DEG: f64 = 111.32;
const MIN_SPEED: f64 = 10.0;
const MAX_SPEED: f64 = 60.0;
const HEADING_JITTER: f64 = 5.0;
const SPEED_JITTER: f64 = 2.5;

/// One dead-reckoning step with the given jitter applied afterwards.
pub fn step(d: &Driver, heading_jitter: f64, speed_jitter: f64) -> Driver {
    let heading = d.heading();
    let speed = d.speed();
    let km_per_sec = speed / 3600.0;

    let (sin_h, cos_h) = heading.to_radians().sin_cos();
    let d_lat = cos_h * km_per_sec / KM_PER_DEG;
    // near the poles the longitude term blows up; hold longitude instead
    let cos_lat = d.latitude.to_radians().cos();
    let d_lng = if cos_lat.abs() < 1e-9 { 0.0 } else { sin_h * km_per_sec / (KM_PER_DEG * cos_lat) };

    let mut next_heading = (heading + heading_jitter + 360.0).rem_euclid(360.0);
    if next_heading >= 360.0 {
        next_heading = 0.0;
    }
    let next_speed = (speed + speed_jitter).clamp(MIN_SPEED, MAX_SPEED);

    Driver {
        latitude: d.latitude + d_lat,
        longitude: d.longitude + d_lng,
        heading: Some(next_heading),
        speed: Some(next_speed),
        ..d.clone()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SimConfig {
    pub resync_every: Duration,
    pub tick_every: Duration,
    pub call_timeout: Duration,
}

pub struct Simulator {
    store: Arc<dyn Store>,
    hub: Arc<NotificationHub>,
    stats_rx: watch::Receiver<NegotiationStats>,
    drivers: Vec<Driver>,
    cfg: SimConfig,
}

impl Simulator {
    pub fn new(
        store: Arc<dyn Store>,
        hub: Arc<NotificationHub>,
        stats_rx: watch::Receiver<NegotiationStats>,
        cfg: SimConfig,
    ) -> Self {
        Self { store, hub, stats_rx, drivers: Vec::new(), cfg }
    }

    #[cfg(test)]
    pub fn drivers(&self) -> &[Driver] { &self.drivers }

    /// Last writer wins: the snapshot supersedes whatever was simulated.
    /// On failure the previous fleet is kept.
    pub async fn resync(&mut self) {
        match bounded(self.cfg.call_timeout, "drivers", self.store.drivers()).await {
            Ok(fleet) => {
                if fleet.len() != self.drivers.len() {
                    info!(drivers = fleet.len(), "fleet resynced");
                }
                self.drivers = fleet;
                FLEET_SIZE.set(self.drivers.len() as i64);
            }
            Err(e) => {
                FLEET_RESYNC_ERRORS.inc();
                warn!(error = %e, kept = self.drivers.len(), "fleet resync failed");
            }
        }
    }

    /// Moves every driver one step in memory.
    pub fn advance<R: Rng>(&mut self, rng: &mut R) {
        for d in self.drivers.iter_mut() {
            let jh = rng.gen_range(-HEADING_JITTER..HEADING_JITTER);
            let js = rng.gen_range(-SPEED_JITTER..SPEED_JITTER);
            *d = step(d, jh, js);
        }
    }

    pub fn market(&self) -> MarketUpdate {
        let stats = *self.stats_rx.borrow();
        let online = self.drivers.iter().filter(|d| d.is_online()).count();
        let denom = online + stats.active_trips;
        let liquidity_ratio = if denom == 0 { 0.0 } else { round2(online as f64 / denom as f64) };
        MarketUpdate { liquidity_ratio, discovery_gap: stats.discovery_gap, active_trips: stats.active_trips }
    }

    pub async fn tick(&mut self) {
        if self.drivers.is_empty() {
            return;
        }
        self.advance(&mut rand::thread_rng());
        FLEET_TICKS.inc();

        // saves run concurrently, so a stalled store costs one call timeout per tick
        let limit = self.cfg.call_timeout;
        let store = &self.store;
        let results = join_all(
            self.drivers
                .iter()
                .map(|d| async move { (d, bounded(limit, "update_driver_position", store.update_driver_position(d)).await) }),
        )
        .await;

        let mut failed = 0usize;
        for (d, res) in results {
            if let Err(e) = res {
                failed += 1;
                DRIVER_PERSIST_ERRORS.inc();
                debug!(driver = %d.external_id, error = %e, "position persist failed");
            }
        }
        if failed > 0 {
            warn!(failed, total = self.drivers.len(), "some driver positions not persisted");
        }

        self.hub.publish_fleet(&self.drivers, self.market());
    }
}

pub async fn run(mut sim: Simulator) {
    let mut resync = interval(sim.cfg.resync_every);
    resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut tick = interval(sim.cfg.tick_every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(resync = ?sim.cfg.resync_every, tick = ?sim.cfg.tick_every, "simulator: started");
    loop {
        select! {
            biased;
            _ = resync.tick() => sim.resync().await,
            _ = tick.tick() => sim.tick().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::tests::{drain, names};
    use crate::push::LogPush;
    use crate::store::MemoryStore;
    use crate::transport::Transport;
    use rand::{rngs::StdRng, SeedableRng};

    fn driver(id: &str, heading: f64, speed: f64) -> Driver {
        Driver {
            external_id: id.into(),
            name: None,
            latitude: -6.2,
            longitude: 106.8,
            heading: Some(heading),
            speed: Some(speed),
            battery: Some(80.0),
            altitude: None,
            status: Some("online".into()),
        }
    }

    fn sim(store: Arc<MemoryStore>) -> (Simulator, watch::Sender<NegotiationStats>, Arc<NotificationHub>) {
        let hub = Arc::new(NotificationHub::new(
            Arc::new(Transport::new()),
            store.clone(),
            Arc::new(LogPush::new()),
            Duration::from_millis(200),
        ));
        let (stats_tx, stats_rx) = watch::channel(NegotiationStats::default());
        let cfg = SimConfig {
            resync_every: Duration::from_secs(10),
            tick_every: Duration::from_secs(2),
            call_timeout: Duration::from_millis(200),
        };
        (Simulator::new(store, hub.clone(), stats_rx, cfg), stats_tx, hub)
    }

    #[test]
    fn due_north_moves_latitude_only() {
        let next = step(&driver("a", 0.0, 36.0), 0.0, 0.0);
        assert!((next.latitude - (-6.2 + 0.01 / KM_PER_DEG)).abs() < 1e-12);
        assert!((next.longitude - 106.8).abs() < 1e-12);
    }

    #[test]
    fn heading_wraps_and_speed_clamps() {
        let next = step(&driver("a", 358.0, 59.0), 4.0, 2.5);
        assert!((next.heading.unwrap() - 2.0).abs() < 1e-9);
        assert_eq!(next.speed, Some(MAX_SPEED));

        let next = step(&driver("a", 2.0, 11.0), -4.0, -2.5);
        assert!((next.heading.unwrap() - 358.0).abs() < 1e-9);
        assert_eq!(next.speed, Some(MIN_SPEED));
    }

    #[test]
    fn long_runs_stay_in_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut d = driver("a", 359.9, 10.0);
        for _ in 0..10_000 {
            d = step(&d, rng.gen_range(-5.0..5.0), rng.gen_range(-2.5..2.5));
            let h = d.heading.unwrap();
            let s = d.speed.unwrap();
            assert!((0.0..360.0).contains(&h), "heading {h}");
            assert!((MIN_SPEED..=MAX_SPEED).contains(&s), "speed {s}");
        }
    }

    #[test]
    fn missing_motion_fields_use_defaults() {
        let mut d = driver("a", 0.0, 0.0);
        d.heading = None;
        d.speed = Some(f64::NAN);
        let next = step(&d, 0.0, 0.0);
        assert_eq!(next.speed, Some(MIN_SPEED));
        assert_eq!(next.heading, Some(0.0));
    }

    #[tokio::test]
    async fn failing_driver_does_not_stall_broadcast() {
        let store = Arc::new(MemoryStore::new());
        store.seed_drivers(vec![driver("a", 90.0, 30.0), driver("b", 180.0, 30.0), driver("c", 270.0, 30.0)]);
        store.fail_driver("b");
        let (mut sim, _stats, hub) = sim(store.clone());
        let (_c, mut rx) = hub.transport().connect();

        sim.resync().await;
        sim.tick().await;

        // every driver attempted, b failed alone
        assert_eq!(store.calls("update_driver_position"), 3);
        let persisted = store.drivers_snapshot();
        assert_ne!(persisted[0].longitude, 106.8);
        assert_eq!(persisted[1].latitude, -6.2);

        let frames = drain(&mut rx);
        assert_eq!(names(&frames), vec!["driversUpdate", "marketUpdate"]);
        assert_eq!(frames[0]["data"].as_array().unwrap().len(), 3);
        // in-memory copy still advanced for the failing driver
        assert_ne!(sim.drivers()[1].latitude, -6.2);
    }

    #[tokio::test]
    async fn stalled_store_costs_one_timeout_per_tick() {
        let store = Arc::new(MemoryStore::new());
        let fleet: Vec<Driver> = (0..12).map(|i| driver(&format!("d{i}"), 45.0, 30.0)).collect();
        store.seed_drivers(fleet);
        let (mut sim, _stats, hub) = sim(store.clone());
        let (_c, mut rx) = hub.transport().connect();
        sim.resync().await;

        store.set_delay(Some(Duration::from_secs(60)));
        let started = std::time::Instant::now();
        sim.tick().await;
        let elapsed = started.elapsed();

        // call timeout is 200ms; sequential saves would take 12x that
        assert!(elapsed < Duration::from_millis(1000), "tick took {elapsed:?}");
        assert_eq!(store.calls("update_driver_position"), 12);
        assert_eq!(names(&drain(&mut rx)), vec!["driversUpdate", "marketUpdate"]);
    }

    #[tokio::test]
    async fn resync_replaces_fleet_wholesale() {
        let store = Arc::new(MemoryStore::new());
        store.seed_drivers(vec![driver("a", 0.0, 20.0), driver("b", 0.0, 20.0)]);
        let (mut sim, _stats, _hub) = sim(store.clone());
        sim.resync().await;
        sim.advance(&mut StdRng::seed_from_u64(1));

        store.seed_drivers(vec![driver("z", 45.0, 15.0)]);
        sim.resync().await;
        assert_eq!(sim.drivers(), &[driver("z", 45.0, 15.0)]);

        // a failed resync keeps the previous list
        store.set_offline(true);
        sim.resync().await;
        assert_eq!(sim.drivers().len(), 1);
    }

    #[tokio::test]
    async fn empty_fleet_tick_is_silent() {
        let store = Arc::new(MemoryStore::new());
        let (mut sim, _stats, hub) = sim(store);
        let (_c, mut rx) = hub.transport().connect();
        sim.tick().await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn market_summary_uses_negotiation_stats() {
        let store = Arc::new(MemoryStore::new());
        let mut busy = driver("c", 0.0, 20.0);
        busy.status = Some("busy".into());
        store.seed_drivers(vec![driver("a", 0.0, 20.0), driver("b", 0.0, 20.0), busy]);
        let (mut sim, stats, _hub) = sim(store);
        assert_eq!(sim.market().liquidity_ratio, 0.0);

        sim.resync().await;
        stats.send_replace(NegotiationStats { active_trips: 1, discovery_gap: 2.5 });
        let m = sim.market();
        assert_eq!(m.liquidity_ratio, 0.67);
        assert_eq!(m.discovery_gap, 2.5);
        assert_eq!(m.active_trips, 1);
    }
}
