//! PostgreSQL source backed by `tokio-postgres`.
//!
//! Queries run over the simple (text) protocol, so every column arrives in the
//! server's own text rendering and no per-type decoding happens client side.
//! The session pins the settings that affect that rendering before each query,
//! and makes every transaction read-only so a query cannot write to the source.

use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, NoTls, SimpleQueryMessage};
use tracing::{debug, warn};

use super::{SourceConnector, SourceEndpoint, SourceSession};
use crate::core::error::{Error, ErrorKind};
use crate::core::row::{Cell, Row};

/// Makes timestamps, dates and intervals render identically for every run and
/// rejects writes (sqlstate 25006) in the relayed query.
pub const SESSION_SETTINGS: &str = "SET DateStyle = 'ISO, YMD'; SET TimeZone = 'UTC'; \
     SET IntervalStyle = 'postgres'; SET default_transaction_read_only = on";

#[derive(Clone, Copy, Debug, Default)]
pub struct PostgresConnector;

pub struct PostgresSession {
    client: Option<Client>,
    driver: Option<JoinHandle<()>>,
    pending: VecDeque<Row>,
    in_flight: bool,
}

#[async_trait]
impl SourceConnector for PostgresConnector {
    async fn connect(&self, endpoint: &SourceEndpoint) -> Result<Box<dyn SourceSession>, Error> {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&endpoint.host)
            .port(endpoint.port)
            .dbname(&endpoint.database)
            .user(&endpoint.user)
            .password(&endpoint.password)
            .application_name(&endpoint.application_name);

        let (client, connection) = config.connect(NoTls).await.map_err(|err| {
            query_error("failed to connect to data source", err)
                .with_hint("Check postgres_config host/port/user/password and that the server accepts TCP connections.")
        })?;

        let driver = tokio::spawn(async move {
            if let Err(err) = connection.await {
                warn!(error = %err, "data source connection ended with an error");
            }
        });

        debug!(source = %endpoint.describe(), "data source session opened");
        Ok(Box::new(PostgresSession {
            client: Some(client),
            driver: Some(driver),
            pending: VecDeque::new(),
            in_flight: false,
        }))
    }
}

impl PostgresSession {
    fn client(&self) -> Result<&Client, Error> {
        self.client
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::Internal).with_message("session already closed"))
    }
}

#[async_trait]
impl SourceSession for PostgresSession {
    async fn execute(&mut self, query: &str) -> Result<Vec<String>, Error> {
        self.in_flight = true;
        let outcome = run_text_query(self.client()?, query).await;
        // Reached only when the query finished; a dropped future leaves the flag set.
        self.in_flight = false;

        let (columns, rows) = collect_rows(outcome?)?;
        self.pending = rows.into();
        Ok(columns)
    }

    async fn next_row(&mut self) -> Result<Option<Row>, Error> {
        Ok(self.pending.pop_front())
    }

    async fn close(self: Box<Self>) -> Result<(), Error> {
        let mut this = self;
        this.pending.clear();
        if let Some(client) = this.client.take() {
            if this.in_flight {
                // The backend keeps working on an abandoned query until told otherwise.
                if let Err(err) = client.cancel_token().cancel_query(NoTls).await {
                    warn!(error = %err, "failed to cancel in-flight query");
                }
            }
            drop(client);
        }
        if let Some(driver) = this.driver.take() {
            driver.await.map_err(|err| {
                Error::new(ErrorKind::Query)
                    .with_message("data source connection task failed")
                    .with_source(err)
            })?;
        }
        Ok(())
    }
}

async fn run_text_query(client: &Client, query: &str) -> Result<Vec<SimpleQueryMessage>, Error> {
    client
        .batch_execute(SESSION_SETTINGS)
        .await
        .map_err(|err| query_error("failed to pin session settings", err))?;
    client.simple_query(query).await.map_err(|err| {
        let read_only = err.code() == Some(&SqlState::READ_ONLY_SQL_TRANSACTION);
        let err = query_error("query execution failed", err);
        if read_only {
            err.with_hint("The relay only reads from the data source; use a SELECT statement.")
        } else {
            err
        }
    })
}

/// Flattens simple-protocol messages into column names and text rows.
fn collect_rows(messages: Vec<SimpleQueryMessage>) -> Result<(Vec<String>, Vec<Row>), Error> {
    let mut columns: Option<Vec<String>> = None;
    let mut descriptions = 0usize;
    let mut rows = Vec::new();

    for message in messages {
        match message {
            SimpleQueryMessage::RowDescription(description) => {
                descriptions += 1;
                if descriptions > 1 {
                    return Err(Error::new(ErrorKind::Query)
                        .with_message("query returned more than one result set")
                        .with_hint("Relay a single SELECT statement per run."));
                }
                columns = Some(
                    description
                        .iter()
                        .map(|column| column.name().to_string())
                        .collect(),
                );
            }
            SimpleQueryMessage::Row(row) => {
                let width = columns
                    .get_or_insert_with(|| {
                        row.columns()
                            .iter()
                            .map(|column| column.name().to_string())
                            .collect()
                    })
                    .len();
                let mut cells = Vec::with_capacity(width);
                for idx in 0..row.len() {
                    let value = row
                        .try_get(idx)
                        .map_err(|err| query_error("failed to read column value", err))?;
                    cells.push(Cell::from(value));
                }
                rows.push(cells);
            }
            // CommandComplete and any future message kinds carry no row data.
            _ => {}
        }
    }

    Ok((columns.unwrap_or_default(), rows))
}

fn query_error(message: &str, err: tokio_postgres::Error) -> Error {
    let detail = match err.as_db_error() {
        Some(db) => format!("{message}: {} (sqlstate {})", db.message(), db.code().code()),
        None => message.to_string(),
    };
    Error::new(ErrorKind::Query)
        .with_message(detail)
        .with_source(err)
}

#[cfg(test)]
mod tests {
    use super::{SESSION_SETTINGS, collect_rows};

    #[test]
    fn no_messages_is_an_empty_result() {
        let (columns, rows) = collect_rows(Vec::new()).expect("collect");
        assert!(columns.is_empty());
        assert!(rows.is_empty());
    }

    #[test]
    fn session_settings_pin_iso_utc() {
        assert!(SESSION_SETTINGS.contains("DateStyle = 'ISO, YMD'"));
        assert!(SESSION_SETTINGS.contains("TimeZone = 'UTC'"));
    }

    #[test]
    fn session_settings_make_transactions_read_only() {
        assert!(SESSION_SETTINGS.ends_with("SET default_transaction_read_only = on"));
    }
}
