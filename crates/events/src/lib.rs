//! Change-feed plumbing for the nearby engine.
//!
//! - [`FeedBus`]: in-process fan-out of row-level [`FeedRecord`]s backed by
//!   `tokio::sync::broadcast`. Transports publish into it; the engine
//!   subscribes.
//! - [`FeedSubscription`]: a table-filtered, cancellable stream of decoded
//!   changes. Dropping it cancels it.
//!
//! [`FeedRecord`]: nearby_core::feed::FeedRecord

pub mod bus;
pub mod subscription;

pub use bus::{FeedBus, FeedEvent};
pub use subscription::{FeedItem, FeedSubscription};
