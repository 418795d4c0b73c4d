//! Purpose: Materialize one query's result into a text-normalized `ResultSet`.
//! Exports: `SourceEndpoint`, `SourceConnector`, `SourceSession`, `materialize`.
//! Role: First relay stage; backends plug in through the connector/session traits.
//! Invariants: A session that connected is closed exactly once, on every exit path.
//! Invariants: Partial results are dropped on failure, never returned.
//! Invariants: The data source is only read from.

pub mod postgres;

use std::fmt;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::core::error::{Error, ErrorKind};
use crate::core::guard::StepGuard;
use crate::core::row::{ResultSet, Row};

pub const DEFAULT_APPLICATION_NAME: &str = "rowrelay";

#[derive(Clone, Eq, PartialEq)]
pub struct SourceEndpoint {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub application_name: String,
}

impl SourceEndpoint {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        database: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            database: database.into(),
            user: user.into(),
            password: password.into(),
            application_name: DEFAULT_APPLICATION_NAME.to_string(),
        }
    }

    pub fn describe(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }
}

impl fmt::Debug for SourceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"***")
            .field("application_name", &self.application_name)
            .finish()
    }
}

/// Opens sessions against a relational data source.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    async fn connect(&self, endpoint: &SourceEndpoint) -> Result<Box<dyn SourceSession>, Error>;
}

/// One open connection. Rows are pulled after `execute` until `next_row` yields `None`.
#[async_trait]
pub trait SourceSession: Send {
    /// Runs `query` and returns its column names in result order.
    async fn execute(&mut self, query: &str) -> Result<Vec<String>, Error>;

    async fn next_row(&mut self) -> Result<Option<Row>, Error>;

    /// Releases the connection and any server-side state tied to it.
    async fn close(self: Box<Self>) -> Result<(), Error>;
}

pub async fn materialize(
    connector: &dyn SourceConnector,
    endpoint: &SourceEndpoint,
    query: &str,
    guard: &StepGuard,
) -> Result<ResultSet, Error> {
    if query.trim().is_empty() {
        return Err(Error::new(ErrorKind::Query)
            .with_message("query is empty")
            .with_hint("Set postgres_config.query or pass --query."));
    }

    let timeouts = guard.timeouts();
    debug!(source = %endpoint.describe(), "connecting to data source");
    let mut session = guard
        .run("connect", timeouts.connect, connector.connect(endpoint))
        .await?;

    let outcome = guard
        .run("query", timeouts.query, read_all(session.as_mut(), query))
        .await;

    // Close is bounded but not cancellable so the connection is always released.
    match tokio::time::timeout(timeouts.connect, session.close()).await {
        Ok(Ok(())) => debug!("data source session closed"),
        Ok(Err(err)) => warn!(error = %err, "failed to close data source session"),
        Err(_) => warn!("closing data source session timed out"),
    }

    let set = outcome?;
    info!(
        rows = set.row_count(),
        columns = set.column_count(),
        "materialized query result"
    );
    Ok(set)
}

async fn read_all(session: &mut dyn SourceSession, query: &str) -> Result<ResultSet, Error> {
    let columns = session.execute(query).await?;
    let mut set = ResultSet::new(columns);
    while let Some(row) = session.next_row().await? {
        set.push(row).map_err(|err| {
            Error::new(ErrorKind::Query)
                .with_message("row width disagrees with result metadata")
                .with_source(err)
        })?;
    }
    Ok(set)
}
