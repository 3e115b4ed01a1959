//! `utils` is intended to be a place to put code that is shared
//! between other crates in this repository.

// common log initialisation routine
pub mod logging;

/// Polling a remote object until it reaches a desired state, or disappears.
pub mod wait;
