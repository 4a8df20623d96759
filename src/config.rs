// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : dispatch_core: realtime negotiation & dispatch coordinator
Module  : config.rs
Version : 0.5.0
License : MIT (see LICENSE)

Summary : Runs rider/driver fare negotiation, simulates and broadcasts live
          driver telemetry, scans active orders for SLA violations, and fans
          events out to WebSocket rooms plus push alerts for staff.
=============================================================================
*/
use clap::{Parser, ValueEnum};
use dotenvy::dotenv;
use std::time::Duration;
use thiserror::Error;

/// Which persistence backend the coordinator talks to
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum StoreMode {
    /// In-process tables seeded with a demo fleet
    Memory,
    /// Hosted PostgREST (Supabase) tables
    Rest,
}

impl StoreMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreMode::Memory => "memory",
            StoreMode::Rest => "rest",
        }
    }
}

/// Which push backend receives staff alerts
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum PushMode {
    /// Validate and log only
    Log,
    /// Expo push service
    Expo,
}

impl PushMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PushMode::Log => "log",
            PushMode::Expo => "expo",
        }
    }
}

#[derive(Clone, Debug, Parser)]
#[command(name = "dispatch_core", version, about = "Realtime negotiation & dispatch coordinator")]
pub struct Args {
    // listeners
    #[arg(long, env = "WS_PORT", default_value_t = 8000)]
    pub ws_port: u16,
    #[arg(long, env = "HTTP_PORT", default_value_t = 9898)]
    pub http_port: u16,

    // backends
    #[arg(long, env = "STORE_MODE", value_enum, default_value_t = StoreMode::Memory)]
    pub store_mode: StoreMode,
    #[arg(long, env = "SUPABASE_URL")]
    pub supabase_url: Option<String>,
    #[arg(long, env = "SUPABASE_SERVICE_ROLE_KEY", hide_env_values = true)]
    pub supabase_key: Option<String>,
    #[arg(long, env = "PUSH_MODE", value_enum, default_value_t = PushMode::Log)]
    pub push_mode: PushMode,
    #[arg(long, env = "EXPO_PUSH_URL", default_value = "https://exp.host/--/api/v2/push/send")]
    pub expo_push_url: String,
    #[arg(long, env = "EXPO_ACCESS_TOKEN", hide_env_values = true)]
    pub expo_access_token: Option<String>,

    // webhook shared secret (x-api-key); unset disables the check
    #[arg(long, env = "BACKEND_API_KEY", hide_env_values = true)]
    pub backend_api_key: Option<String>,

    // cadence
    #[arg(long, env = "FLEET_RESYNC_SECS", default_value_t = 10)]
    pub fleet_resync_secs: u64,
    #[arg(long, env = "FLEET_TICK_SECS", default_value_t = 2)]
    pub fleet_tick_secs: u64,
    #[arg(long, env = "SLA_SCAN_SECS", default_value_t = 60)]
    pub sla_scan_secs: u64,
    #[arg(long, env = "CALL_TIMEOUT_MS", default_value_t = 5000)]
    pub call_timeout_ms: u64,

    // SLA rules
    #[arg(long, env = "DEFAULT_SLA_BREACH_MINUTES", default_value_t = 30.0)]
    pub default_sla_breach_minutes: f64,
    #[arg(long, env = "PICKUP_DELAY_MINUTES", default_value_t = 20.0)]
    pub pickup_delay_minutes: f64,

    // memory mode fleet size
    #[arg(long, env = "DEMO_DRIVERS", default_value_t = 12)]
    pub demo_drivers: usize,

    // JSONL recording of every outbound frame
    #[arg(long, env = "RECORD_FILE")]
    pub record_file: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required when STORE_MODE=rest")]
    MissingStoreSetting(&'static str),
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
}

impl Args {
    pub fn call_timeout(&self) -> Duration { Duration::from_millis(self.call_timeout_ms) }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, v) in [
            ("FLEET_RESYNC_SECS", self.fleet_resync_secs),
            ("FLEET_TICK_SECS", self.fleet_tick_secs),
            ("SLA_SCAN_SECS", self.sla_scan_secs),
            ("CALL_TIMEOUT_MS", self.call_timeout_ms),
        ] {
            if v == 0 {
                return Err(ConfigError::ZeroInterval(name));
            }
        }
        if self.store_mode == StoreMode::Rest {
            if self.supabase_url.is_none() {
                return Err(ConfigError::MissingStoreSetting("SUPABASE_URL"));
            }
            if self.supabase_key.is_none() {
                return Err(ConfigError::MissingStoreSetting("SUPABASE_SERVICE_ROLE_KEY"));
            }
        }
        Ok(())
    }
}

pub fn load() -> Result<Args, ConfigError> {
    // .env first so clap's env fallbacks see it
    let _ = dotenv();
    let args = Args::parse();
    args.validate()?;
    Ok(args)
}
