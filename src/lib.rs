//! DNS forwarder that follows the endpoint slices of one service.
//!
//! Endpoint groups are watched in etcd and aggregated into a target list;
//! each new list hot-swaps the forwarder that DNS listeners dispatch to.

pub mod config;
pub mod core;
pub mod discovery;
pub mod metrics;
pub mod proxy;
pub mod service;
