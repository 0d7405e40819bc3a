//! Asynchronous presence and social-graph sync engine.
//!
//! Wires the pure logic of `nearby-core` to three racing input channels:
//! the periodic full re-fetch ([`poller`]), the realtime change feed
//! ([`pump`]), and optimistic local actions ([`relationships`],
//! [`geo_tracker`]). [`engine::SyncEngine`] is the facade the UI shell uses.

pub mod backend;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod geo_tracker;
pub mod memory;
pub mod poller;
pub mod pump;
pub mod relationships;
pub mod state;
pub mod supervisor;

pub use config::SyncConfig;
pub use engine::{PlacedUser, SyncEngine};
pub use error::{Notice, NoticeKind, SyncError};
