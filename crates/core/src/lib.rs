//! Pure domain logic of the nearby presence and social-graph engine.
//!
//! No I/O lives here: the async engine in `nearby-sync` drives these types
//! from network reads, change-feed callbacks, device callbacks, and user
//! actions.

pub mod blocking;
pub mod error;
pub mod feed;
pub mod geo;
pub mod notifications;
pub mod optimistic;
pub mod profile;
pub mod relationship;
pub mod roster;
pub mod spiral;
pub mod types;

pub use error::CoreError;
