use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ClusterError, Result};
use crate::membership::SchedulerSettings;

pub const ENV_PREFIX: &str = "TRINITY";

/// Node settings. Every field has a default, so a config file only needs the
/// values it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Address of the RPC interface; also advertised in the self descriptor.
    pub bind_addr: String,
    /// Shared secret for the administrative methods.
    pub key: String,
    pub store_path: PathBuf,
    pub tick_interval_ms: u64,
    pub call_timeout_ms: u64,
    pub refused_backoff_ms: u64,
    pub registration_backoff_ms: u64,
    pub heartbeat_backoff_ms: u64,
    pub max_concurrent_calls: usize,
    pub log_level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5555".to_string(),
            key: "1".to_string(),
            store_path: PathBuf::from("nodes.json"),
            tick_interval_ms: 2000,
            call_timeout_ms: 5000,
            refused_backoff_ms: 5000,
            registration_backoff_ms: 7000,
            heartbeat_backoff_ms: 10000,
            max_concurrent_calls: 32,
            log_level: "info".to_string(),
        }
    }
}

/// Command-line overrides, applied on top of file and environment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CliArgs {
    pub config: Option<String>,
    pub bind: Option<String>,
    pub store: Option<PathBuf>,
}

impl CliArgs {
    /// Parses `--config <path> --bind <ip:port> --store <path>`; the program
    /// name must already be stripped.
    pub fn parse<I>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut parsed = CliArgs::default();
        let mut args = args.into_iter();

        while let Some(flag) = args.next() {
            let mut value = || {
                args.next()
                    .ok_or_else(|| ClusterError::Config(format!("{} needs a value", flag)))
            };
            match flag.as_str() {
                "--config" => parsed.config = Some(value()?),
                "--bind" => parsed.bind = Some(value()?),
                "--store" => parsed.store = Some(PathBuf::from(value()?)),
                other => {
                    return Err(ClusterError::Config(format!("unknown argument '{}'", other)));
                }
            }
        }
        Ok(parsed)
    }
}

impl NodeConfig {
    /// Defaults, then the optional file, then `TRINITY_*` environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .map_err(|e| ClusterError::Config(e.to_string()))?;

        settings
            .try_deserialize()
            .map_err(|e| ClusterError::Config(e.to_string()))
    }

    /// Full resolution used by the binary.
    pub fn from_cli(cli: &CliArgs) -> Result<Self> {
        let mut config = Self::load(cli.config.as_deref())?;
        if let Some(bind) = &cli.bind {
            config.bind_addr = bind.clone();
        }
        if let Some(store) = &cli.store {
            config.store_path = store.clone();
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.key.is_empty() {
            return Err(ClusterError::Config("key must not be empty".to_string()));
        }
        if self.store_path.as_os_str().is_empty() {
            return Err(ClusterError::Config("store_path must not be empty".to_string()));
        }
        self.bind_socket()?;

        let durations = [
            ("tick_interval_ms", self.tick_interval_ms),
            ("call_timeout_ms", self.call_timeout_ms),
            ("refused_backoff_ms", self.refused_backoff_ms),
            ("registration_backoff_ms", self.registration_backoff_ms),
            ("heartbeat_backoff_ms", self.heartbeat_backoff_ms),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, ms)| *ms == 0) {
            return Err(ClusterError::Config(format!("{} must be positive", name)));
        }
        if self.max_concurrent_calls == 0 {
            return Err(ClusterError::Config(
                "max_concurrent_calls must be positive".to_string(),
            ));
        }

        let shortest_backoff = self
            .refused_backoff_ms
            .min(self.registration_backoff_ms)
            .min(self.heartbeat_backoff_ms);
        if self.call_timeout_ms > shortest_backoff {
            return Err(ClusterError::Config(format!(
                "call_timeout_ms ({}) exceeds the shortest backoff ({})",
                self.call_timeout_ms, shortest_backoff
            )));
        }

        self.tracing_level()?;
        Ok(())
    }

    /// The RPC address. IPv4 only, like every descriptor host.
    pub fn bind_socket(&self) -> Result<SocketAddr> {
        self.bind_addr
            .parse::<SocketAddrV4>()
            .map(SocketAddr::V4)
            .map_err(|_| {
                ClusterError::Config(format!("bind_addr '{}' is not an IPv4 ip:port", self.bind_addr))
            })
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn tracing_level(&self) -> Result<tracing::Level> {
        self.log_level
            .parse()
            .map_err(|_| ClusterError::Config(format!("unknown log_level '{}'", self.log_level)))
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            tick_interval: Duration::from_millis(self.tick_interval_ms),
            refused_backoff: Duration::from_millis(self.refused_backoff_ms),
            registration_backoff: Duration::from_millis(self.registration_backoff_ms),
            heartbeat_backoff: Duration::from_millis(self.heartbeat_backoff_ms),
            max_concurrent_calls: self.max_concurrent_calls,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn defaults_are_valid() {
        let config = NodeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.bind_socket().unwrap().port(), 5555);
        assert_eq!(config.scheduler_settings().tick_interval, Duration::from_secs(2));
        assert_eq!(config.call_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        std::fs::write(
            &path,
            "bind_addr = \"127.0.0.1:6001\"\nkey = \"secret\"\ntick_interval_ms = 500\n",
        )
        .unwrap();

        let config = NodeConfig::load(path.to_str()).unwrap();

        assert_eq!(config.bind_addr, "127.0.0.1:6001");
        assert_eq!(config.key, "secret");
        assert_eq!(config.tick_interval_ms, 500);
        assert_eq!(config.call_timeout_ms, 5000);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(matches!(
            NodeConfig::load(path.to_str()),
            Err(ClusterError::Config(_))
        ));
    }

    #[test]
    fn validate_rejects_bad_values() {
        let cases: Vec<Box<dyn Fn(&mut NodeConfig)>> = vec![
            Box::new(|c| c.key.clear()),
            Box::new(|c| c.store_path = PathBuf::new()),
            Box::new(|c| c.bind_addr = "localhost:5555".to_string()),
            Box::new(|c| c.tick_interval_ms = 0),
            Box::new(|c| c.max_concurrent_calls = 0),
            Box::new(|c| c.call_timeout_ms = 20_000),
            Box::new(|c| c.log_level = "loud".to_string()),
        ];

        for (i, mutate) in cases.iter().enumerate() {
            let mut config = NodeConfig::default();
            mutate(&mut config);
            assert!(config.validate().is_err(), "case {} should fail", i);
        }
    }

    #[test]
    fn cli_flags_parse_and_override() {
        let cli = CliArgs::parse(args(&["--bind", "127.0.0.1:7000", "--store", "/tmp/n.json"]))
            .unwrap();
        assert_eq!(cli.bind.as_deref(), Some("127.0.0.1:7000"));

        let config = NodeConfig::from_cli(&cli).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:7000");
        assert_eq!(config.store_path, PathBuf::from("/tmp/n.json"));
    }

    #[test]
    fn cli_rejects_unknown_or_incomplete_flags() {
        assert!(CliArgs::parse(args(&["--seed", "x"])).is_err());
        assert!(CliArgs::parse(args(&["--bind"])).is_err());
    }
}
