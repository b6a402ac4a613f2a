//! Reconq queue: turns raw watch notifications for one resource type into ordered, typed
//! lifecycle events for a single reconciling subscriber.
//!
//! Each [`EventQueue`] owns its own state cache, critical section, bounded channel and
//! delayed-dispatch registry; nothing is shared between queues of different types.

#![forbid(unsafe_code)]

pub mod backoff;
pub mod delayed;
mod queue;
pub mod settings;
mod source;

pub use backoff::Backoff;
pub use delayed::DelayedDispatch;
pub use queue::{EventQueue, QueueHandle, Subscriber};
pub use settings::QueueSettings;
pub use source::{channel_source, WatchStream};

pub use reconq_core::{EventKind, QueueError, QueueItem, WatchEvent, WatchEventType};
