use std::env;

#[derive(Clone, Debug)]
pub struct Config {
    pub bind: String,
    pub port: String,
    pub data_dir: String,
    pub hold_ttl_secs: i64,
    pub sweep_interval_secs: u64,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
}

impl Config {
    /// Every knob has a default; the service starts with no environment at all.
    pub fn from_env() -> Self {
        let bind = env::var("HOLDFAST_BIND").unwrap_or_else(|_| "0.0.0.0".into());
        let port = env::var("HOLDFAST_PORT").unwrap_or_else(|_| "8080".into());
        let data_dir = env::var("HOLDFAST_DATA_DIR").unwrap_or_else(|_| "./data".into());
        let hold_ttl_secs = env::var("HOLDFAST_HOLD_TTL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(180);
        let sweep_interval_secs = env::var("HOLDFAST_SWEEP_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5);
        let compact_threshold = env::var("HOLDFAST_COMPACT_THRESHOLD")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1000);
        let metrics_port = env::var("HOLDFAST_METRICS_PORT")
            .ok()
            .and_then(|s| s.parse().ok());

        Self {
            bind,
            port,
            data_dir,
            hold_ttl_secs,
            sweep_interval_secs,
            compact_threshold,
            metrics_port,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}
