//! Purpose: Run the query → encode → publish chain once, in order.
//! Exports: `RelaySettings`, `Relay`, `RelayReport`.
//! Role: Orchestration used by the CLI; owns the cancel signal and per-step timeouts.
//! Invariants: The payload is fully built before any broker connection is opened.
//! Invariants: A failed stage stops the chain; nothing is retried or half-published.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, Instrument};

use crate::broker::{self, BrokerConnector, QueueTarget};
use crate::core::error::Error;
use crate::core::guard::{StepGuard, Timeouts};
use crate::core::payload::{self, PayloadFormat};
use crate::source::{self, SourceConnector, SourceEndpoint};

pub const DEFAULT_QUERY: &str = "SELECT * FROM student";

#[derive(Clone, Debug)]
pub struct RelaySettings {
    pub source: SourceEndpoint,
    pub query: String,
    pub target: QueueTarget,
    pub format: PayloadFormat,
    pub timeouts: Timeouts,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RelayReport {
    pub rows: usize,
    pub columns: usize,
    pub payload_bytes: usize,
    pub format: PayloadFormat,
    pub queue: String,
    pub elapsed: Duration,
}

pub struct Relay<S, B> {
    source: S,
    broker: B,
    settings: RelaySettings,
    cancel: CancellationToken,
}

impl<S, B> Relay<S, B>
where
    S: SourceConnector,
    B: BrokerConnector,
{
    pub fn new(source: S, broker: B, settings: RelaySettings) -> Self {
        Self {
            source,
            broker,
            settings,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    pub async fn run(&self) -> Result<RelayReport, Error> {
        let settings = &self.settings;
        let guard = StepGuard::new(settings.timeouts, self.cancel.clone());
        let started = Instant::now();

        let set = source::materialize(&self.source, &settings.source, &settings.query, &guard)
            .instrument(info_span!("materialize", source = %settings.source.describe()))
            .await?;

        let payload = payload::encode(&set, settings.format)?;
        info!(
            bytes = payload.len(),
            format = settings.format.as_str(),
            "encoded payload"
        );
        let (rows, columns) = (set.row_count(), set.column_count());
        drop(set);

        let delivery = broker::publish(&self.broker, &settings.target, &payload, &guard)
            .instrument(info_span!("publish", target = %settings.target.describe()))
            .await?;

        Ok(RelayReport {
            rows,
            columns,
            payload_bytes: delivery.bytes,
            format: delivery.format,
            queue: delivery.queue,
            elapsed: started.elapsed(),
        })
    }
}
