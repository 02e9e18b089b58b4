use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::auth::Credentials;
use crate::pricing::HourlyRates;

/// Bounded lock acquisition for per-slot mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    /// How long a single acquisition attempt may wait.
    pub timeout: Duration,
    /// Retries after the first timed-out attempt before giving up with `Contention`.
    pub retries: u32,
    /// Backoff before retry `n` is `backoff_base * 2^n`.
    pub backoff_base: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(500),
            retries: 3,
            backoff_base: Duration::from_millis(10),
        }
    }
}

impl LockPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base.saturating_mul(1u32 << attempt.min(16))
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    /// Shared password for regular users.
    pub password: String,
    /// Login name with elevated privileges.
    pub admin_user: String,
    pub admin_password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub lock: LockPolicy,
    /// Zero disables the sweeper.
    pub sweep_interval: Duration,
    /// Provision the built-in campus layout when the store starts empty.
    pub seed_inventory: bool,
    pub rates: HourlyRates,
}

fn var_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5434,
            data_dir: PathBuf::from("./data"),
            password: "parkd".into(),
            admin_user: "admin".into(),
            admin_password: "admin".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
            lock: LockPolicy::default(),
            sweep_interval: Duration::ZERO,
            seed_inventory: true,
            rates: HourlyRates::default(),
        }
    }
}

impl Config {
    /// Defaults overridden by any `PARKD_*` variable that parses.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            bind: env::var("PARKD_BIND").unwrap_or(d.bind),
            port: var_or("PARKD_PORT", d.port),
            data_dir: env::var("PARKD_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            password: env::var("PARKD_PASSWORD").unwrap_or(d.password),
            admin_user: env::var("PARKD_ADMIN_USER").unwrap_or(d.admin_user),
            admin_password: env::var("PARKD_ADMIN_PASSWORD").unwrap_or(d.admin_password),
            max_connections: var_or("PARKD_MAX_CONNECTIONS", d.max_connections),
            compact_threshold: var_or("PARKD_COMPACT_THRESHOLD", d.compact_threshold),
            metrics_port: env::var("PARKD_METRICS_PORT").ok().and_then(|s| s.parse().ok()),
            tls_cert: env::var("PARKD_TLS_CERT").ok(),
            tls_key: env::var("PARKD_TLS_KEY").ok(),
            lock: LockPolicy {
                timeout: Duration::from_millis(var_or(
                    "PARKD_LOCK_TIMEOUT_MS",
                    d.lock.timeout.as_millis() as u64,
                )),
                retries: var_or("PARKD_LOCK_RETRIES", d.lock.retries),
                backoff_base: Duration::from_millis(var_or(
                    "PARKD_LOCK_BACKOFF_MS",
                    d.lock.backoff_base.as_millis() as u64,
                )),
            },
            sweep_interval: Duration::from_secs(var_or(
                "PARKD_SWEEP_INTERVAL_SECS",
                d.sweep_interval.as_secs(),
            )),
            seed_inventory: var_or("PARKD_SEED_INVENTORY", d.seed_inventory),
            rates: HourlyRates {
                two_wheeler: var_or("PARKD_RATE_TWO_WHEELER", d.rates.two_wheeler),
                four_wheeler: var_or("PARKD_RATE_FOUR_WHEELER", d.rates.four_wheeler),
                bus: var_or("PARKD_RATE_BUS", d.rates.bus),
            },
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("parkd.wal")
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            user_password: self.password.clone(),
            admin_user: self.admin_user.clone(),
            admin_password: self.admin_password.clone(),
        }
    }
}
