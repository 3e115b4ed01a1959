//! Measures how long pausable ScyllaDB datacenters take to resume, and how much
//! of that is the database starting up.

pub mod attachment;
pub mod cluster;
pub mod config;
pub mod cql;
pub mod crd;
pub mod manifests;
pub mod naming;
pub mod predicates;
pub mod scenario;
pub mod startup_logs;
pub mod summary;
pub mod timing;
