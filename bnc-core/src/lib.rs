//! # bnc-core
//!
//! Relay, backlog and roster engine for a multi-network IRC bouncer.
//!
//! Upstream events from every configured network are normalized into one
//! canonical [`event::Event`] schema, cached per channel in a bounded backlog
//! that is primed from (and written through to) a durable store, folded into
//! live channel rosters, and fanned out to any number of attached sessions.
//!
//! Start-up order:
//!
//! 1. Load the [`config::ConfigDocument`].
//! 2. Connect every network into a [`supervisor::NetworkRegistry`].
//! 3. Hand the registry, the event streams, a [`store::EventStore`] and a
//!    [`broadcast::Broadcaster`] to [`relay::start`].

pub mod backlog;
pub mod broadcast;
pub mod config;
pub mod db;
pub mod error;
pub mod event;
pub mod identity;
pub mod normalize;
pub mod protocol;
pub mod relay;
pub mod roster;
pub mod store;
pub mod supervisor;
pub mod upstream;

pub use error::{BncError, Result};
