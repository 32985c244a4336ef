//! Event sinks: where the notifier sends committed transitions.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;

use crate::bus::{EventBus, JobEvent};
use crate::error::EventError;

/// Postgres notification channel carrying serialized [`JobEvent`]s.
pub const NOTIFY_CHANNEL: &str = "chunkflow_job_events";

/// Destination for job events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: &JobEvent) -> Result<(), EventError>;
}

/// Single-process deployments publish straight onto the local bus.
#[async_trait]
impl EventSink for EventBus {
    async fn emit(&self, event: &JobEvent) -> Result<(), EventError> {
        self.publish(event.clone());
        Ok(())
    }
}

#[async_trait]
impl<S: EventSink + ?Sized> EventSink for Arc<S> {
    async fn emit(&self, event: &JobEvent) -> Result<(), EventError> {
        (**self).emit(event).await
    }
}

/// Sends events through `pg_notify` so every process running a
/// [`PgEventRelay`](crate::PgEventRelay) sees them.
#[derive(Clone)]
pub struct PgNotifySink {
    pool: PgPool,
}

impl PgNotifySink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventSink for PgNotifySink {
    async fn emit(&self, event: &JobEvent) -> Result<(), EventError> {
        let payload = serde_json::to_string(event)?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(NOTIFY_CHANNEL)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
