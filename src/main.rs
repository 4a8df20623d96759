// ===============================
// src/main.rs
// ===============================
/*
 # what is running
 curl -s localhost:9898/metrics | egrep '^config_(store_mode|push_mode)'

 # negotiation + fleet activity
 curl -s localhost:9898/metrics | egrep '^(active_trips|trips_matched_total|fleet_size)'

 # move an order along
 curl -s -X PATCH localhost:9898/orders/<id>/status -d '{"status":"ready"}'
*/
/*
=============================================================================
Project : dispatch_core: realtime negotiation & dispatch coordinator
Module  : main.rs
Version : 0.5.0
License : MIT (see LICENSE)

Summary : Runs rider/driver fare negotiation, simulates and broadcasts live
          driver telemetry, scans active orders for SLA violations, and fans
          events out to WebSocket rooms plus push alerts for staff.
=============================================================================
*/
mod config;
mod domain;
mod http;
mod hub;
mod metrics;
mod monitor;
mod negotiation;
mod push;
mod push_expo;        // Expo push service client
mod recorder;
mod simulator;
mod store;
mod store_rest;       // hosted PostgREST tables
mod transport;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::{
    net::TcpListener,
    select,
    sync::{mpsc, watch},
    time::{interval, Duration},
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{PushMode, StoreMode};
use crate::domain::Recorded;
use crate::hub::NotificationHub;
use crate::monitor::{Monitor, SlaRules};
use crate::negotiation::{NegotiationCommand, NegotiationStats, Negotiator};
use crate::push::{LogPush, PushGateway};
use crate::simulator::{SimConfig, Simulator};
use crate::store::{MemoryStore, Store};
use crate::transport::Transport;

#[tokio::main]
async fn main() {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ---- Config ----
    let args = match config::load() {
        Ok(a) => a,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return;
        }
    };

    // ---- Metrics + startup info ----
    metrics::init();
    metrics::CONFIG_STORE_MODE.with_label_values(&[args.store_mode.as_str()]).set(1);
    metrics::CONFIG_PUSH_MODE.with_label_values(&[args.push_mode.as_str()]).set(1);
    info!(
        store_mode = args.store_mode.as_str(),
        push_mode = args.push_mode.as_str(),
        ws_port = args.ws_port,
        http_port = args.http_port,
        resync_secs = args.fleet_resync_secs,
        tick_secs = args.fleet_tick_secs,
        sla_scan_secs = args.sla_scan_secs,
        webhook_key = args.backend_api_key.is_some(),
        "startup config"
    );

    // ---- Gateways ----
    let store: Arc<dyn Store> = match args.store_mode {
        StoreMode::Memory => Arc::new(MemoryStore::with_demo_fleet(args.demo_drivers)),
        StoreMode::Rest => {
            let url = args.supabase_url.as_deref().unwrap_or_default();
            let key = args.supabase_key.as_deref().unwrap_or_default();
            match store_rest::RestStore::new(url, key) {
                Ok(s) => Arc::new(s),
                Err(e) => {
                    error!(error = %e, "store client init failed");
                    return;
                }
            }
        }
    };
    let push: Arc<dyn PushGateway> = match args.push_mode {
        PushMode::Log => Arc::new(LogPush::new()),
        PushMode::Expo => Arc::new(push_expo::ExpoPush::new(
            args.expo_push_url.clone(),
            args.expo_access_token.clone(),
        )),
    };
    let call_timeout = args.call_timeout();

    // ---- Hub (+ optional recorder) ----
    let mut hub = NotificationHub::new(Arc::new(Transport::new()), store.clone(), push, call_timeout);
    if let Some(path) = args.record_file.clone() {
        let (rec_tx, rec_rx) = mpsc::channel::<Recorded>(8192);
        tokio::spawn(recorder::run(rec_rx, path));
        hub = hub.with_recorder(rec_tx);
    }
    let hub = Arc::new(hub);

    // ---- Negotiation ----
    let (stats_tx, stats_rx) = watch::channel(NegotiationStats::default());
    let (neg_tx, neg_rx) = mpsc::channel::<NegotiationCommand>(1024);
    let mut negotiator = Negotiator::new(store.clone(), hub.clone(), stats_tx, call_timeout);
    match negotiator.seed().await {
        Ok(n) => info!(active_trips = n, "negotiation: active set seeded"),
        Err(e) => warn!(error = %e, "negotiation: seeding failed, starting empty"),
    }
    tokio::spawn(negotiation::run(neg_rx, negotiator));

    // ---- Simulator ----
    let sim = Simulator::new(
        store.clone(),
        hub.clone(),
        stats_rx,
        SimConfig {
            resync_every: Duration::from_secs(args.fleet_resync_secs),
            tick_every: Duration::from_secs(args.fleet_tick_secs),
            call_timeout,
        },
    );
    tokio::spawn(simulator::run(sim));

    // ---- SLA monitor ----
    let rules = SlaRules {
        default_breach_minutes: args.default_sla_breach_minutes,
        pickup_delay_minutes: args.pickup_delay_minutes,
    };
    let mon = Monitor::new(store.clone(), hub.clone(), rules, call_timeout);
    tokio::spawn(monitor::run(mon, Duration::from_secs(args.sla_scan_secs)));

    // ---- HTTP ----
    let http_state = Arc::new(http::HttpState {
        store: store.clone(),
        hub: hub.clone(),
        api_key: args.backend_api_key.clone(),
        call_timeout,
    });
    let http_addr = SocketAddr::from(([0, 0, 0, 0], args.http_port));
    tokio::spawn(async move {
        if let Err(e) = http::serve(http_addr, http_state).await {
            error!(error = %e, %http_addr, "http server stopped");
        }
    });

    // ---- Realtime listener ----
    let ws_addr = SocketAddr::from(([0, 0, 0, 0], args.ws_port));
    let listener = match TcpListener::bind(ws_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(?e, %ws_addr, "realtime bind failed");
            return;
        }
    };
    tokio::spawn(ws::serve(listener, hub.clone(), neg_tx));

    // ---- Heartbeat ----
    let mut beat = interval(Duration::from_secs(30));
    loop {
        select! {
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl-c, shutting down");
                break;
            }
            _ = beat.tick() => {
                info!(
                    clients = hub.transport().client_count(),
                    fleet = metrics::FLEET_SIZE.get(),
                    active_trips = metrics::ACTIVE_TRIPS.get(),
                    "heartbeat"
                );
            }
        }
    }
}
