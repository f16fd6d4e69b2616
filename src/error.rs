use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::memcached::{Command, Outcome};

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that stops a benchmark run.
///
/// Would-block on a non-blocking socket is not an error: the paths report it
/// as `Ok(false)` and the caller retries.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration: {0}")]
    Config(String),

    #[error("{path}:{line}: {msg}")]
    Sample {
        path: String,
        line: usize,
        msg: String,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("protocol: {0}")]
    Protocol(String),

    #[error("wrong GET hit: request {req_seed:08X}/{req_key}/{req_val}, response {resp_seed:08X}/{resp_key}/{resp_val}")]
    WrongHit {
        req_seed: u32,
        req_key: usize,
        req_val: usize,
        resp_seed: u32,
        resp_key: usize,
        resp_val: usize,
    },

    #[error("{outcome:?} response for {command:?} request")]
    WrongOutcome { command: Command, outcome: Outcome },

    #[error("UDP timeout too small: {0}")]
    UdpTimeoutTooSmall(String),

    #[error("latency <= 0.0: {0}")]
    NonPositiveLatency(f64),

    #[error("{name}: time went backwards: {new} < {old}")]
    TimeWentBackwards { name: String, new: f64, old: f64 },

    #[error("{name}: not enough samples: {have} < {need}")]
    NotEnoughSamples {
        name: String,
        have: usize,
        need: usize,
    },

    #[error("peer {0} closed the connection")]
    PeerClosed(String),

    #[error("receive thread of worker {0} is gone")]
    ReceiverGone(usize),

    #[error("unable to create output file {path:?}: {source}")]
    Dump {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }
}
