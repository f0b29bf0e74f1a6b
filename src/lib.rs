//! The stream coordinator.
//!
//! A replicated, deterministic state machine which coordinates the lifecycle of a set of
//! append-only stream queues across a cluster. For each stream the coordinator elects a
//! writer, places replicas on nodes, drives stopping & starting of per-node log processes
//! across epoch changes, and notifies interested listeners when leader or local-replica
//! endpoints change.
//!
//! The machine itself lives in [`core`] and is pure: it is driven by a Raft-style
//! consensus runtime which delivers commands in total order and executes the effects the
//! machine returns. All I/O lives in the [`aux`] executor (out-of-band actions against
//! the per-node log processes) and in the [`client`] layer (the thin request API in
//! front of the machine).

pub mod aux;
pub mod client;
#[cfg(test)]
mod client_test;
pub mod config;
pub mod core;
pub mod error;
#[cfg(test)]
mod fixtures;
pub mod models;
pub mod runtime;
