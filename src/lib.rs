//! # event-dispatcher
//!
//! Watches cluster events, drops the stale ones, coalesces bursts per event
//! UID in a dispatch queue, and fans each event out to pluggable sinks
//! (search index, console, discard) from a fixed worker pool.
//!
//! Optional leader election keeps exactly one replica dispatching.

pub mod config;
pub mod engine;
pub mod error;
pub mod feed;
pub mod leader;
pub mod model;
pub mod sink;
pub mod telemetry;
