// Server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. The database pool reads its own `MAPSYNC_DB_*` variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

use crate::lease::InstanceIdentity;
use crate::matchmaker::MatchmakerConfig;
use crate::session::SessionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Core server configuration.
///
/// Constructed via [`ServerConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// Address other instances redirect clients to when this one owns a map.
    pub advertised_host: String,
    pub run_id: Uuid,
    /// PostgreSQL connection string; `None` runs a single instance in memory.
    pub database_url: Option<String>,
    pub lease_duration: Duration,
    pub lease_renew_interval: Duration,
    pub session_idle_timeout: Duration,
    pub save_interval: Duration,
    pub broadcast_interval: Duration,
    /// Per-client outbound buffer on the WebSocket edge.
    pub outbound_buffer: usize,
    /// Traffic capture directory; `None` when capture is off.
    pub traffic_dir: Option<PathBuf>,
    /// Log filter directive (e.g. `info`, `mapsync_server=debug`).
    pub log_filter: String,
    pub log_format: LogFormat,
}

impl ServerConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `MAPSYNC_LISTEN_HOST` | `0.0.0.0` |
    /// | `MAPSYNC_LISTEN_PORT` | `4010` |
    /// | `MAPSYNC_HOST` | `{listen_addr}` |
    /// | `MAPSYNC_RUN_ID` | random |
    /// | `MAPSYNC_DATABASE_URL` | *(none)* |
    /// | `MAPSYNC_LEASE_DURATION_MS` | `300000` |
    /// | `MAPSYNC_LEASE_RENEW_INTERVAL_MS` | lease duration / 4 |
    /// | `MAPSYNC_SESSION_IDLE_TIMEOUT_MS` | `300000` |
    /// | `MAPSYNC_SAVE_INTERVAL_MS` | `60000` |
    /// | `MAPSYNC_BROADCAST_INTERVAL_MS` | `10` |
    /// | `MAPSYNC_OUTBOUND_BUFFER` | `16` |
    /// | `MAPSYNC_LOG_TRAFFIC` | `false` |
    /// | `MAPSYNC_TRAFFIC_DIR` | `$TMPDIR/mapsync-traffic` |
    /// | `MAPSYNC_LOG_FILTER` | `info` |
    /// | `MAPSYNC_LOG_FORMAT` | `text` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("MAPSYNC_LISTEN_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = parse_or(&env, "MAPSYNC_LISTEN_PORT", 4010);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let advertised_host = env("MAPSYNC_HOST").unwrap_or_else(|_| listen_addr.to_string());
        let run_id = env("MAPSYNC_RUN_ID")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(Uuid::new_v4);
        let database_url = env("MAPSYNC_DATABASE_URL").ok().filter(|v| !v.is_empty());

        let lease_duration = millis_or(&env, "MAPSYNC_LEASE_DURATION_MS", 300_000);
        let lease_renew_interval = env("MAPSYNC_LEASE_RENEW_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .filter(|interval| !interval.is_zero() && *interval < lease_duration)
            .unwrap_or(lease_duration / 4);

        let session_idle_timeout = millis_or(&env, "MAPSYNC_SESSION_IDLE_TIMEOUT_MS", 300_000);
        let save_interval = millis_or(&env, "MAPSYNC_SAVE_INTERVAL_MS", 60_000);
        let broadcast_interval = millis_or(&env, "MAPSYNC_BROADCAST_INTERVAL_MS", 10);
        let outbound_buffer = parse_or(&env, "MAPSYNC_OUTBOUND_BUFFER", 16usize).max(1);

        let log_traffic = env("MAPSYNC_LOG_TRAFFIC")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false);
        let traffic_dir = log_traffic.then(|| {
            env("MAPSYNC_TRAFFIC_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| std::env::temp_dir().join("mapsync-traffic"))
        });

        let log_filter = env("MAPSYNC_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_format = match env("MAPSYNC_LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        Self {
            listen_addr,
            advertised_host,
            run_id,
            database_url,
            lease_duration,
            lease_renew_interval,
            session_idle_timeout,
            save_interval,
            broadcast_interval,
            outbound_buffer,
            traffic_dir,
            log_filter,
            log_format,
        }
    }

    pub fn identity(&self) -> InstanceIdentity {
        InstanceIdentity::new(self.advertised_host.clone(), self.run_id)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            idle_timeout: self.session_idle_timeout,
            save_interval: self.save_interval,
            broadcast_interval: self.broadcast_interval,
        }
    }

    pub fn matchmaker_config(&self) -> MatchmakerConfig {
        MatchmakerConfig {
            identity: self.identity(),
            lease_duration: self.lease_duration,
            renew_interval: self.lease_renew_interval,
            session: self.session_config(),
            traffic_dir: self.traffic_dir.clone(),
        }
    }
}

fn parse_or<F, T>(env: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
    T: std::str::FromStr,
{
    env(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Zero is not a usable interval for any timer here.
fn millis_or<F>(env: &F, key: &str, default_ms: u64) -> Duration
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
{
    let ms = parse_or(env, key, default_ms);
    Duration::from_millis(if ms == 0 { default_ms } else { ms })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from_map(
        map: HashMap<&'static str, &'static str>,
    ) -> impl Fn(&str) -> Result<String, std::env::VarError> {
        move |key: &str| map.get(key).map(|v| v.to_string()).ok_or(std::env::VarError::NotPresent)
    }

    #[test]
    fn defaults_when_no_env_vars() {
        let cfg = ServerConfig::from_env_fn(env_from_map(HashMap::new()));
        assert_eq!(cfg.listen_addr.to_string(), "0.0.0.0:4010");
        assert_eq!(cfg.advertised_host, "0.0.0.0:4010");
        assert!(cfg.database_url.is_none());
        assert_eq!(cfg.lease_duration, Duration::from_secs(300));
        assert_eq!(cfg.lease_renew_interval, Duration::from_secs(75));
        assert_eq!(cfg.session_idle_timeout, Duration::from_secs(300));
        assert_eq!(cfg.save_interval, Duration::from_secs(60));
        assert_eq!(cfg.broadcast_interval, Duration::from_millis(10));
        assert_eq!(cfg.outbound_buffer, 16);
        assert!(cfg.traffic_dir.is_none());
        assert_eq!(cfg.log_filter, "info");
        assert_eq!(cfg.log_format, LogFormat::Text);
    }

    #[test]
    fn run_id_is_fresh_per_process_unless_pinned() {
        let a = ServerConfig::from_env_fn(env_from_map(HashMap::new()));
        let b = ServerConfig::from_env_fn(env_from_map(HashMap::new()));
        assert_ne!(a.run_id, b.run_id);

        let pinned = ServerConfig::from_env_fn(env_from_map(HashMap::from([(
            "MAPSYNC_RUN_ID",
            "00000000-0000-0000-0000-000000000007",
        )])));
        assert_eq!(pinned.run_id.to_string(), "00000000-0000-0000-0000-000000000007");
    }

    #[test]
    fn advertised_host_overrides_listen_addr() {
        let cfg = ServerConfig::from_env_fn(env_from_map(HashMap::from([
            ("MAPSYNC_LISTEN_PORT", "9000"),
            ("MAPSYNC_HOST", "sync-2.internal:9000"),
        ])));
        assert_eq!(cfg.listen_addr.port(), 9000);
        assert_eq!(cfg.identity().host, "sync-2.internal:9000");
        assert_eq!(cfg.identity().run_id, cfg.run_id);
    }

    #[test]
    fn renew_interval_follows_lease_duration() {
        let cfg = ServerConfig::from_env_fn(env_from_map(HashMap::from([(
            "MAPSYNC_LEASE_DURATION_MS",
            "8000",
        )])));
        assert_eq!(cfg.lease_renew_interval, Duration::from_secs(2));
    }

    #[test]
    fn renew_interval_not_below_lease_is_ignored() {
        let cfg = ServerConfig::from_env_fn(env_from_map(HashMap::from([
            ("MAPSYNC_LEASE_DURATION_MS", "8000"),
            ("MAPSYNC_LEASE_RENEW_INTERVAL_MS", "8000"),
        ])));
        assert_eq!(cfg.lease_renew_interval, Duration::from_secs(2));

        let cfg = ServerConfig::from_env_fn(env_from_map(HashMap::from([
            ("MAPSYNC_LEASE_DURATION_MS", "8000"),
            ("MAPSYNC_LEASE_RENEW_INTERVAL_MS", "3000"),
        ])));
        assert_eq!(cfg.lease_renew_interval, Duration::from_secs(3));
    }

    #[test]
    fn invalid_numbers_fall_back_to_defaults() {
        let cfg = ServerConfig::from_env_fn(env_from_map(HashMap::from([
            ("MAPSYNC_LISTEN_PORT", "not-a-port"),
            ("MAPSYNC_SAVE_INTERVAL_MS", "-5"),
            ("MAPSYNC_BROADCAST_INTERVAL_MS", "0"),
            ("MAPSYNC_OUTBOUND_BUFFER", "0"),
        ])));
        assert_eq!(cfg.listen_addr.port(), 4010);
        assert_eq!(cfg.save_interval, Duration::from_secs(60));
        assert_eq!(cfg.broadcast_interval, Duration::from_millis(10));
        assert_eq!(cfg.outbound_buffer, 1);
    }

    #[test]
    fn traffic_capture_is_opt_in() {
        let off = ServerConfig::from_env_fn(env_from_map(HashMap::from([(
            "MAPSYNC_TRAFFIC_DIR",
            "/srv/traffic",
        )])));
        assert!(off.traffic_dir.is_none());

        let on = ServerConfig::from_env_fn(env_from_map(HashMap::from([
            ("MAPSYNC_LOG_TRAFFIC", "true"),
            ("MAPSYNC_TRAFFIC_DIR", "/srv/traffic"),
        ])));
        assert_eq!(on.traffic_dir, Some(PathBuf::from("/srv/traffic")));
        assert_eq!(on.matchmaker_config().traffic_dir, Some(PathBuf::from("/srv/traffic")));
    }

    #[test]
    fn matchmaker_config_carries_timers() {
        let cfg = ServerConfig::from_env_fn(env_from_map(HashMap::from([
            ("MAPSYNC_SESSION_IDLE_TIMEOUT_MS", "1500"),
            ("MAPSYNC_SAVE_INTERVAL_MS", "2500"),
            ("MAPSYNC_BROADCAST_INTERVAL_MS", "25"),
            ("MAPSYNC_LOG_FORMAT", "json"),
        ])));
        let matchmaker = cfg.matchmaker_config();
        assert_eq!(matchmaker.session.idle_timeout, Duration::from_millis(1500));
        assert_eq!(matchmaker.session.save_interval, Duration::from_millis(2500));
        assert_eq!(matchmaker.session.broadcast_interval, Duration::from_millis(25));
        assert_eq!(matchmaker.lease_duration, Duration::from_secs(300));
        assert_eq!(cfg.log_format, LogFormat::Json);
    }
}
