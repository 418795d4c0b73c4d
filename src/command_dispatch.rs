//! Purpose: Hold top-level CLI command dispatch for `rowrelay`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: `run` publishes at most once per process; signals cancel, never retry.

use std::io::Read;
use std::path::Path;
use std::time::Duration;

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use rowrelay::broker::amqp::AmqpConnector;
use rowrelay::config::{load_settings, validate};
use rowrelay::source::postgres::PostgresConnector;
use rowrelay::{Relay, RelayReport, RelaySettings, ResultSet};

use super::*;

pub(super) fn dispatch_command(command: Command) -> Result<RunOutcome, Error> {
    match command {
        Command::Run(args) => {
            let settings = settings_from_args(args)?;
            init_tracing();
            let report = run_relay(settings)?;
            emit_json(receipt_json(&report));
            Ok(RunOutcome::ok())
        }
        Command::Decode { input } => {
            let bytes = read_input(input.as_deref())?;
            let set = rowrelay::decode(&bytes)?;
            emit_json(result_set_json(&set));
            Ok(RunOutcome::ok())
        }
        Command::Version => {
            emit_json(json!({
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            }));
            Ok(RunOutcome::ok())
        }
    }
}

fn settings_from_args(args: RunArgs) -> Result<RelaySettings, Error> {
    let mut settings = load_settings(&args.config)?;
    if let Some(query) = args.query {
        settings.query = query;
    }
    if let Some(queue) = args.queue {
        settings.target.queue = queue;
    }
    if let Some(format) = args.format {
        settings.format = format.into();
    }
    if let Some(ms) = args.connect_timeout_ms {
        settings.timeouts.connect = Duration::from_millis(ms);
    }
    if let Some(ms) = args.query_timeout_ms {
        settings.timeouts.query = Duration::from_millis(ms);
    }
    if let Some(ms) = args.publish_timeout_ms {
        settings.timeouts.publish = Duration::from_millis(ms);
    }
    validate(&settings)?;
    Ok(settings)
}

fn run_relay(settings: RelaySettings) -> Result<RelayReport, Error> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to start runtime")
                .with_source(err)
        })?;

    runtime.block_on(async move {
        let cancel = CancellationToken::new();
        let watcher = tokio::spawn(cancel_on_signal(cancel.clone()));
        let relay = Relay::new(PostgresConnector, AmqpConnector, settings).with_cancellation(cancel);
        let result = relay.run().await;
        watcher.abort();
        result
    })
}

async fn cancel_on_signal(cancel: CancellationToken) {
    shutdown_signal().await;
    warn!("shutdown signal received, cancelling relay");
    cancel.cancel();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                ctrl_c.await;
            }
        }
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}

fn read_input(path: Option<&Path>) -> Result<Vec<u8>, Error> {
    match path {
        Some(path) => std::fs::read(path).map_err(|err| {
            let kind = match err.kind() {
                std::io::ErrorKind::NotFound => ErrorKind::Usage,
                _ => ErrorKind::Io,
            };
            Error::new(kind)
                .with_message(format!("failed to read payload file {}", path.display()))
                .with_source(err)
        }),
        None => {
            let mut buf = Vec::new();
            io::stdin().read_to_end(&mut buf).map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to read payload from stdin")
                    .with_source(err)
            })?;
            Ok(buf)
        }
    }
}

fn receipt_json(report: &RelayReport) -> Value {
    let time = OffsetDateTime::now_utc().format(&Rfc3339).ok();
    json!({
        "relay": {
            "queue": report.queue,
            "rows": report.rows,
            "columns": report.columns,
            "payload_bytes": report.payload_bytes,
            "format": report.format.as_str(),
            "elapsed_ms": report.elapsed.as_millis() as u64,
            "time": time,
        }
    })
}

fn result_set_json(set: &ResultSet) -> Value {
    let rows: Vec<Value> = set
        .rows()
        .iter()
        .map(|row| Value::Array(row.iter().map(|cell| json!(cell.as_str())).collect()))
        .collect();
    json!({
        "columns": set.columns(),
        "rows": rows,
    })
}
