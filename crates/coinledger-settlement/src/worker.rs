//! The periodic drain loop and its logging setup.
//!
//! A worker runs one [`DrainKind`] forever. It probes the wallets the kind
//! depends on once at startup and refuses to start without them; after that
//! every failure is logged and the next tick tries again.

use std::{future::Future, sync::Arc, time::Duration};

use chrono::Utc;
use coinledger_types::{CoinledgerError, Result};
use tokio::time::MissedTickBehavior;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::pipeline::{DrainKind, Pipeline};

/// Install the global subscriber. `RUST_LOG` overrides the default `info`.
pub fn init_tracing(json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    let installed = if json {
        registry.with(fmt::layer().json().with_target(true)).try_init()
    } else {
        registry.with(fmt::layer().with_target(false)).try_init()
    };
    installed.map_err(|e| CoinledgerError::Configuration(format!("tracing init failed: {e}")))
}

/// Run `kind` every `period` until the process exits.
pub async fn run(pipeline: Arc<Pipeline>, kind: DrainKind, period: Duration) -> Result<()> {
    run_until(pipeline, kind, period, std::future::pending::<()>()).await
}

/// Like [`run`], stopping cleanly once `shutdown` resolves.
///
/// # Errors
/// [`CoinledgerError::ExternalUnavailable`] when a wallet the kind needs
/// does not answer at startup. Nothing after startup is returned as an error.
pub async fn run_until(
    pipeline: Arc<Pipeline>,
    kind: DrainKind,
    period: Duration,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let probe = Arc::clone(&pipeline);
    tokio::task::spawn_blocking(move || probe.probe(kind))
        .await
        .map_err(|e| CoinledgerError::Internal(format!("probe task failed: {e}")))?
        .inspect_err(|e| tracing::error!(drain = %kind, error = %e, "required wallet missing, not starting"))?;
    tracing::info!(drain = %kind, period_ms = period.as_millis(), "worker started");

    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => {
                tracing::info!(drain = %kind, "worker stopping");
                return Ok(());
            }
            _ = ticker.tick() => {
                let cycle = Arc::clone(&pipeline);
                match tokio::task::spawn_blocking(move || cycle.run_drain(kind, Utc::now())).await {
                    Ok(Ok(report)) => {
                        if report.skipped {
                            tracing::debug!(drain = %kind, "cycle skipped");
                        }
                    }
                    Ok(Err(e)) if e.is_retryable() => {
                        tracing::warn!(drain = %kind, error = %e, "cycle failed, retrying next tick");
                    }
                    Ok(Err(e)) => {
                        tracing::error!(drain = %kind, error = %e, "cycle aborted");
                    }
                    Err(e) => {
                        tracing::error!(drain = %kind, error = %e, "drain task panicked");
                    }
                }
            }
        }
    }
}
