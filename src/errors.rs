use std::io;
use thiserror::Error;


/// Fault delivered through a [`TaskHandle`](crate::handle::TaskHandle).
#[derive(Debug, Error, PartialEq, PartialOrd, Eq, Ord, Clone)]
pub enum SpawnError {
    #[error("task panicked: {0}")]
    Panic(String),
    #[error("task was dropped before it ran")]
    ChannelClosed,
    #[error("timed out waiting for the task result")]
    Timeout,
    #[error("handle holds no result (rejected push or result already taken)")]
    Invalid,
}

/// Failure while bringing up a [`WorkerPool`](crate::pool::WorkerPool).
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to spawn worker thread #{index}: {source}")]
    Spawn {
        index: usize,
        #[source]
        source: io::Error,
    },
}
