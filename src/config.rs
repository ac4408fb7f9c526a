use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::postgres::Lsn;
use crate::{Error, Result};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub postgres: PostgresConfig,
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub sink: SinkConfig,
}

#[derive(Clone, Deserialize, Serialize)]
pub struct PostgresConfig {
    /// Connection string; when set it takes precedence over the discrete fields.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl fmt::Debug for PostgresConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresConfig")
            .field("url", &self.url.as_ref().map(|_| "[REDACTED]"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReplicationConfig {
    pub slot_name: String,
    pub publication: String,
    #[serde(default = "default_output_plugin")]
    pub output_plugin: String,
    #[serde(default = "default_proto_version")]
    pub proto_version: u32,
    /// Starting position in `X/X` form; `0/0` lets the server pick the slot's
    /// confirmed position.
    #[serde(default)]
    pub start_lsn: Option<String>,
    #[serde(default = "default_true")]
    pub create_slot: bool,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_recv_timeout_secs")]
    pub recv_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SinkConfig {
    #[serde(default)]
    pub format: OutputFormat,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::default(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Json,
    Text,
}

/// Resolved connection parameters for the replication connection.
#[derive(Clone)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub database: String,
    pub application_name: String,
    pub connect_timeout: Duration,
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("database", &self.database)
            .field("application_name", &self.application_name)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Loads the file, then `PG_CAPTURE_*` environment overrides.
    ///
    /// The result is not validated, so command-line overrides can still
    /// replace bad values; call [`Config::validate`] once they are applied.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("PG_CAPTURE")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(contents, config::FileFormat::Toml))
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.replication.slot_name.trim().is_empty() {
            return Err(Error::Config("replication.slot_name must not be empty".to_string()));
        }
        if self.replication.publication.trim().is_empty() {
            return Err(Error::Config("replication.publication must not be empty".to_string()));
        }
        if self.replication.output_plugin.trim().is_empty() {
            return Err(Error::Config("replication.output_plugin must not be empty".to_string()));
        }
        if self.replication.heartbeat_interval_secs == 0 {
            return Err(Error::Config(
                "replication.heartbeat_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.replication.recv_timeout_secs == 0 {
            return Err(Error::Config(
                "replication.recv_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.sink.queue_capacity == 0 {
            return Err(Error::Config("sink.queue_capacity must be greater than zero".to_string()));
        }
        self.start_lsn()?;
        Ok(())
    }

    pub fn start_lsn(&self) -> Result<Lsn> {
        match &self.replication.start_lsn {
            Some(text) => text
                .parse::<Lsn>()
                .map_err(|e| Error::Config(format!("replication.start_lsn: {}", e))),
            None => Ok(Lsn::ZERO),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.replication.heartbeat_interval_secs)
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_secs(self.replication.recv_timeout_secs)
    }

    /// Output plugin options passed to START_REPLICATION.
    pub fn plugin_args(&self) -> Vec<(String, String)> {
        vec![
            (
                "proto_version".to_string(),
                self.replication.proto_version.to_string(),
            ),
            (
                "publication_names".to_string(),
                self.replication.publication.clone(),
            ),
        ]
    }

    pub fn connection_params(&self) -> Result<ConnectionParams> {
        let pg = &self.postgres;
        let mut params = ConnectionParams {
            host: pg.host.clone(),
            port: pg.port,
            user: pg.username.clone(),
            password: pg.password.clone(),
            database: pg.database.clone(),
            application_name: "pg-capture".to_string(),
            connect_timeout: Duration::from_secs(pg.connect_timeout_secs),
        };

        let Some(url) = &pg.url else {
            return Ok(params);
        };

        let parsed = url.parse::<tokio_postgres::Config>()?;

        match parsed.get_hosts().first() {
            Some(tokio_postgres::config::Host::Tcp(host)) => params.host = host.clone(),
            Some(_) => {
                return Err(Error::Config(
                    "unix socket hosts are not supported for replication".to_string(),
                ))
            }
            None => {}
        }
        if let Some(port) = parsed.get_ports().first() {
            params.port = *port;
        }
        if let Some(user) = parsed.get_user() {
            params.user = user.to_string();
        }
        if let Some(password) = parsed.get_password() {
            params.password = Some(String::from_utf8_lossy(password).into_owned());
        }
        if let Some(dbname) = parsed.get_dbname() {
            params.database = dbname.to_string();
        }
        if let Some(name) = parsed.get_application_name() {
            params.application_name = name.to_string();
        }
        if let Some(timeout) = parsed.get_connect_timeout() {
            params.connect_timeout = *timeout;
        }

        Ok(params)
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_database() -> String {
    "postgres".to_string()
}

fn default_username() -> String {
    "postgres".to_string()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_output_plugin() -> String {
    "pgoutput".to_string()
}

fn default_proto_version() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_heartbeat_interval_secs() -> u64 {
    10
}

fn default_recv_timeout_secs() -> u64 {
    10
}

fn default_queue_capacity() -> usize {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [postgres]
        host = "db.internal"
        database = "mydb"
        username = "replicator"
        password = "secret"

        [replication]
        slot_name = "mydb_slot"
        publication = "mydb_pub"
    "#;

    #[test]
    fn test_defaults_are_applied() {
        let config = Config::from_toml_str(MINIMAL).unwrap();

        assert_eq!(config.postgres.port, 5432);
        assert_eq!(config.replication.output_plugin, "pgoutput");
        assert_eq!(config.replication.proto_version, 1);
        assert!(config.replication.create_slot);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(10));
        assert_eq!(config.recv_timeout(), Duration::from_secs(10));
        assert_eq!(config.sink.format, OutputFormat::Json);
        assert_eq!(config.sink.queue_capacity, 1000);
        assert_eq!(config.start_lsn().unwrap(), Lsn::ZERO);
    }

    #[test]
    fn test_plugin_args() {
        let config = Config::from_toml_str(MINIMAL).unwrap();
        let args = config.plugin_args();

        assert_eq!(args[0], ("proto_version".to_string(), "1".to_string()));
        assert_eq!(args[1], ("publication_names".to_string(), "mydb_pub".to_string()));
    }

    #[test]
    fn test_url_overrides_discrete_fields() {
        let mut config = Config::from_toml_str(MINIMAL).unwrap();
        config.postgres.url =
            Some("postgres://alice:pw@10.0.0.5:6543/orders?application_name=cdc".to_string());

        let params = config.connection_params().unwrap();
        assert_eq!(params.host, "10.0.0.5");
        assert_eq!(params.port, 6543);
        assert_eq!(params.user, "alice");
        assert_eq!(params.password.as_deref(), Some("pw"));
        assert_eq!(params.database, "orders");
        assert_eq!(params.application_name, "cdc");
    }

    #[test]
    fn test_discrete_fields_without_url() {
        let config = Config::from_toml_str(MINIMAL).unwrap();
        let params = config.connection_params().unwrap();

        assert_eq!(params.host, "db.internal");
        assert_eq!(params.user, "replicator");
        assert_eq!(params.password.as_deref(), Some("secret"));
        assert_eq!(params.connect_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_rejects_empty_slot_name() {
        let toml = MINIMAL.replace("mydb_slot", "");
        assert!(matches!(Config::from_toml_str(&toml), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_invalid_start_lsn() {
        let toml = format!("{}\nstart_lsn = \"not-an-lsn\"\n", MINIMAL);
        assert!(matches!(Config::from_toml_str(&toml), Err(Error::Config(_))));
    }

    #[test]
    fn test_parses_start_lsn() {
        let toml = format!("{}\nstart_lsn = \"16/B374D848\"\n", MINIMAL);
        let config = Config::from_toml_str(&toml).unwrap();
        assert_eq!(config.start_lsn().unwrap(), Lsn::new(0x16_B374_D848));
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = Config::from_toml_str(MINIMAL).unwrap();
        let rendered = format!("{:?}", config.postgres);
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("[REDACTED]"));
    }
}
