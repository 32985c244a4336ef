//! Cross-process event relay.
//!
//! Workers publish through [`PgNotifySink`](crate::PgNotifySink). Every
//! process that serves subscribers runs [`PgEventRelay::run`], which
//! `LISTEN`s on the notification channel and republishes each event on its
//! local [`EventBus`]. When the listener connection drops the relay
//! reconnects with exponential backoff until the cancellation token fires.

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::bus::{EventBus, JobEvent};
use crate::sink::NOTIFY_CHANNEL;

/// Tunable parameters for the listener reconnect backoff.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Next backoff delay, clamped to [`ReconnectConfig::max_delay`].
pub fn next_delay(current: Duration, config: &ReconnectConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}

/// Background service bridging Postgres notifications onto the local bus.
pub struct PgEventRelay;

impl PgEventRelay {
    /// Run until `cancel` fires.
    pub async fn run(
        pool: PgPool,
        bus: Arc<EventBus>,
        config: ReconnectConfig,
        cancel: CancellationToken,
    ) {
        let mut delay = config.initial_delay;

        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = Self::listen(&pool, &bus, &cancel) => result,
            };

            match result {
                // Only returned once cancelled.
                Ok(()) => break,
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Event relay listener failed, reconnecting",
                    );
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = next_delay(delay, &config);
        }

        tracing::info!("Event relay stopped");
    }

    async fn listen(
        pool: &PgPool,
        bus: &EventBus,
        cancel: &CancellationToken,
    ) -> Result<(), sqlx::Error> {
        let mut listener = PgListener::connect_with(pool).await?;
        listener.listen(NOTIFY_CHANNEL).await?;
        tracing::info!(channel = NOTIFY_CHANNEL, "Event relay listening");

        loop {
            let notification = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                notification = listener.recv() => notification?,
            };

            match serde_json::from_str::<JobEvent>(notification.payload()) {
                Ok(event) => bus.publish(event),
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping malformed job event notification");
                }
            }
        }
    }
}
