//! Error types for event-dispatcher.

use std::time::Duration;

use thiserror::Error;

use crate::engine::Phase;
use crate::sink::SinkError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid controller transition: {from} -> {to}")]
    InvalidTransition { from: Phase, to: Phase },

    #[error("change feed failed before initial sync: {0}")]
    SyncFailed(String),

    #[error("change feed did not sync within {0:?}")]
    SyncTimeout(Duration),

    #[error("change feed error: {0}")]
    Feed(String),

    #[error("lease store error: {0}")]
    Lease(String),

    #[error("leadership lost: {0}")]
    LeadershipLost(String),

    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
