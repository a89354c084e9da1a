//! Clustered, JDBC-style persistent job store.
//!
//! This crate is the store underneath a Quartz-like scheduler façade: it
//! owns the persistent data model of jobs, triggers, calendars, the
//! fired-trigger ledger and scheduler-instance heartbeats; it implements the
//! trigger state machine that governs acquisition, firing, completion,
//! pausing and misfire recovery; and it provides cluster-safe recovery of
//! triggers orphaned by a crashed peer. The façade itself — job dispatch
//! onto a thread pool, listener callbacks, dynamic class loading — is out of
//! scope; see [`resolver::ClassResolver`] for the seam where that
//! collaborator plugs in.
//!
//! Every public operation is a plain `async fn` taking a `&mut PgConnection`
//! (so callers control the enclosing transaction) and returning
//! [`error::Result`]. A lost race on a conditional state-transition update
//! is never an `Err` — see [`state_machine::conditional_update_state`].

pub mod acquisition;
pub mod cluster;
pub mod codec;
pub mod config;
pub mod error;
pub mod gateway;
pub mod lock;
pub mod misfire;
pub mod model;
pub mod repository;
pub mod resolver;
pub mod schedule;
pub mod state_machine;

pub use config::JobStoreConfig;
pub use error::{Result, StoreError};
pub use gateway::Gateway;
