//! Job event fan-out for the chunkflow engine.
//!
//! - [`JobEvent`]: the event envelope carried for every job and chunk
//!   transition.
//! - [`EventBus`]: in-process publish/subscribe hub backed by
//!   `tokio::sync::broadcast`.
//! - [`EventSink`]: where the notifier sends events: straight onto the
//!   local bus, or through Postgres `NOTIFY` via [`PgNotifySink`].
//! - [`PgEventRelay`]: background task that `LISTEN`s for notifications
//!   and republishes them on the local bus.
//! - [`Notifier`]: best-effort publishing plus ordered, de-duplicated
//!   per-job subscriptions that always start with a store snapshot.

pub mod bus;
pub mod error;
pub mod notifier;
pub mod relay;
pub mod sink;

pub use bus::{EventBus, JobEvent};
pub use error::EventError;
pub use notifier::{JobSubscription, Notifier};
pub use relay::{PgEventRelay, ReconnectConfig};
pub use sink::{EventSink, PgNotifySink, NOTIFY_CHANNEL};
