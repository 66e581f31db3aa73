//! fleetctl: provision, reconcile and drive fleets of compute instances
//!
//! The [`fleet`] module holds the core: record queries, node-range
//! expansion, the lifecycle state machine, reconciliation and the bounded
//! parallel executor. [`backend`] defines the capabilities a provider must
//! offer, with an in-memory and a docker implementation.

pub mod backend;
pub mod cli;
pub mod config;
pub mod fleet;
