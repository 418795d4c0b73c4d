//! Purpose: Load relay settings from a YAML file into explicit `RelaySettings`.
//! Exports: `load_settings`, `parse_settings`, `expand_env_vars`.
//! Role: Settings collaborator for the CLI; the core only sees typed values.
//! Invariants: `${VAR}` / `${VAR:-default}` are expanded before YAML parsing.
//! Invariants: Every settings problem surfaces as `ErrorKind::Usage` with a hint.
//! Invariants: The configured broker host is used as given.

use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use regex::{Captures, Regex};
use serde::Deserialize;

use crate::broker::{DEFAULT_AMQP_PORT, DEFAULT_BROKER_USER, DEFAULT_VHOST, QueueOptions, QueueTarget};
use crate::core::error::{Error, ErrorKind};
use crate::core::guard::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_PUBLISH_TIMEOUT, DEFAULT_QUERY_TIMEOUT, Timeouts,
};
use crate::core::payload::PayloadFormat;
use crate::relay::{DEFAULT_QUERY, RelaySettings};
use crate::source::SourceEndpoint;

static ENV_VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("env var pattern is valid")
});

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsFile {
    postgres_config: PostgresSection,
    rabbit_config: RabbitSection,
    #[serde(default)]
    relay: RelaySection,
}

#[derive(Debug, Deserialize)]
struct PostgresSection {
    host: String,
    port: u16,
    database: String,
    user: String,
    #[serde(default)]
    password: String,
    #[serde(default = "default_query")]
    query: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RabbitSection {
    host: String,
    #[serde(default = "default_amqp_port")]
    port: u16,
    #[serde(default = "default_vhost")]
    vhost: String,
    #[serde(default = "default_broker_user")]
    user: String,
    #[serde(default = "default_broker_user")]
    password: String,
    queue_name: String,
    #[serde(default)]
    durable: bool,
    #[serde(default)]
    exclusive: bool,
    #[serde(default)]
    auto_delete: bool,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RelaySection {
    format: PayloadFormat,
    connect_timeout_ms: u64,
    query_timeout_ms: u64,
    publish_timeout_ms: u64,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            format: PayloadFormat::default(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
            query_timeout_ms: DEFAULT_QUERY_TIMEOUT.as_millis() as u64,
            publish_timeout_ms: DEFAULT_PUBLISH_TIMEOUT.as_millis() as u64,
        }
    }
}

fn default_query() -> String {
    DEFAULT_QUERY.to_string()
}

fn default_amqp_port() -> u16 {
    DEFAULT_AMQP_PORT
}

fn default_vhost() -> String {
    DEFAULT_VHOST.to_string()
}

fn default_broker_user() -> String {
    DEFAULT_BROKER_USER.to_string()
}

pub fn load_settings(path: &Path) -> Result<RelaySettings, Error> {
    let text = std::fs::read_to_string(path).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message(format!("failed to read settings file {}", path.display()))
            .with_hint("Pass an existing YAML file with --config.")
            .with_source(err)
    })?;
    parse_settings(&expand_env_vars(&text, |name| std::env::var(name).ok()))
}

pub fn parse_settings(text: &str) -> Result<RelaySettings, Error> {
    let file: SettingsFile = serde_yaml::from_str(text).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message(format!("invalid settings: {err}"))
            .with_hint("Settings need postgres_config (host, port, database, user) and rabbit_config (host, queueName).")
            .with_source(err)
    })?;
    let settings = file.into_settings();
    validate(&settings)?;
    Ok(settings)
}

/// Replaces `${VAR}` and `${VAR:-default}`; unset variables without a default become "".
pub fn expand_env_vars<F>(text: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    ENV_VAR
        .replace_all(text, |caps: &Captures| {
            let fallback = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            lookup(&caps[1]).unwrap_or_else(|| fallback.to_string())
        })
        .into_owned()
}

impl SettingsFile {
    fn into_settings(self) -> RelaySettings {
        let pg = self.postgres_config;
        let rabbit = self.rabbit_config;
        let relay = self.relay;

        let target = QueueTarget {
            host: rabbit.host,
            port: rabbit.port,
            vhost: rabbit.vhost,
            user: rabbit.user,
            password: rabbit.password,
            queue: rabbit.queue_name,
            options: QueueOptions {
                durable: rabbit.durable,
                exclusive: rabbit.exclusive,
                auto_delete: rabbit.auto_delete,
            },
        };

        RelaySettings {
            source: SourceEndpoint::new(pg.host, pg.port, pg.database, pg.user, pg.password),
            query: pg.query,
            target,
            format: relay.format,
            timeouts: Timeouts {
                connect: Duration::from_millis(relay.connect_timeout_ms),
                query: Duration::from_millis(relay.query_timeout_ms),
                publish: Duration::from_millis(relay.publish_timeout_ms),
            },
        }
    }
}

pub fn validate(settings: &RelaySettings) -> Result<(), Error> {
    let required = [
        ("postgres_config.host", settings.source.host.as_str()),
        ("postgres_config.database", settings.source.database.as_str()),
        ("postgres_config.user", settings.source.user.as_str()),
        ("postgres_config.query", settings.query.as_str()),
        ("rabbit_config.host", settings.target.host.as_str()),
        ("rabbit_config.queueName", settings.target.queue.as_str()),
    ];
    for (field, value) in required {
        if value.trim().is_empty() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("{field} must not be empty")));
        }
    }

    let timeouts = [
        ("connect", settings.timeouts.connect),
        ("query", settings.timeouts.query),
        ("publish", settings.timeouts.publish),
    ];
    for (name, value) in timeouts {
        if value.is_zero() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("{name} timeout must be greater than zero"))
                .with_hint("Use a positive millisecond value like 30000."));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{expand_env_vars, load_settings, parse_settings};
    use crate::core::error::ErrorKind;
    use crate::core::payload::PayloadFormat;
    use std::time::Duration;

    const MINIMAL: &str = r#"
postgres_config:
  host: db.internal
  port: 5432
  database: school
  user: relay
  password: secret
rabbit_config:
  host: mq.internal
  queueName: students
"#;

    #[test]
    fn minimal_file_fills_defaults() {
        let settings = parse_settings(MINIMAL).expect("settings");
        assert_eq!(settings.source.host, "db.internal");
        assert_eq!(settings.source.port, 5432);
        assert_eq!(settings.query, "SELECT * FROM student");
        assert_eq!(settings.target.port, 5672);
        assert_eq!(settings.target.vhost, "/");
        assert_eq!(settings.target.user, "guest");
        assert!(!settings.target.options.durable);
        assert!(!settings.target.options.exclusive);
        assert!(!settings.target.options.auto_delete);
        assert_eq!(settings.format, PayloadFormat::Frame);
        assert_eq!(settings.timeouts.connect, Duration::from_secs(10));
    }

    #[test]
    fn configured_broker_host_is_kept() {
        let settings = parse_settings(MINIMAL).expect("settings");
        assert_eq!(settings.target.host, "mq.internal");
        assert_ne!(settings.target.host, "localhost");
    }

    #[test]
    fn full_file_overrides_everything() {
        let text = r#"
postgres_config:
  host: db
  port: 6543
  database: school
  user: relay
  password: secret
  query: SELECT id, name FROM student ORDER BY id
rabbit_config:
  host: mq
  port: 5673
  vhost: reports
  user: relay
  password: pw
  queueName: students
  durable: true
  autoDelete: true
relay:
  format: json
  connect_timeout_ms: 500
  query_timeout_ms: 1500
  publish_timeout_ms: 2500
"#;
        let settings = parse_settings(text).expect("settings");
        assert_eq!(settings.query, "SELECT id, name FROM student ORDER BY id");
        assert_eq!(settings.target.vhost, "reports");
        assert!(settings.target.options.durable);
        assert!(settings.target.options.auto_delete);
        assert!(!settings.target.options.exclusive);
        assert_eq!(settings.format, PayloadFormat::Json);
        assert_eq!(settings.timeouts.query, Duration::from_millis(1500));
        assert_eq!(settings.timeouts.publish, Duration::from_millis(2500));
    }

    #[test]
    fn missing_queue_name_is_usage_error() {
        let text = MINIMAL.replace("  queueName: students\n", "");
        let err = parse_settings(&text).expect_err("missing queue");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn blank_host_is_usage_error() {
        let text = MINIMAL.replace("host: db.internal", "host: \"\"");
        let err = parse_settings(&text).expect_err("blank host");
        assert_eq!(err.message(), Some("postgres_config.host must not be empty"));
    }

    #[test]
    fn zero_timeout_is_usage_error() {
        let text = format!("{MINIMAL}relay:\n  query_timeout_ms: 0\n");
        let err = parse_settings(&text).expect_err("zero timeout");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn unknown_format_is_usage_error() {
        let text = format!("{MINIMAL}relay:\n  format: avro\n");
        let err = parse_settings(&text).expect_err("bad format");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn env_vars_expand_with_defaults() {
        let lookup = |name: &str| (name == "PG_PASSWORD").then(|| "s3cret".to_string());
        let text = "password: ${PG_PASSWORD}\nhost: ${MQ_HOST:-localhost}\nuser: ${UNSET}\n";
        let expanded = expand_env_vars(text, lookup);
        assert_eq!(expanded, "password: s3cret\nhost: localhost\nuser: \n");
    }

    #[test]
    fn missing_file_is_usage_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = load_settings(&temp.path().join("absent.yml")).expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }
}
