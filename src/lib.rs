//! Precision load generator for memcached.
//!
//! Virtual connections are spread over pinned send/receive thread pairs.
//! Each send thread schedules its connections earliest-deadline-first at a
//! ramped, jittered rate; each receive thread matches replies to the
//! requests outstanding on their connection and feeds the per-connection
//! counters and histograms.

pub mod affinity;
pub mod buffer;
pub mod clock;
pub mod config;
pub mod conn_work;
pub mod control;
pub mod distribution;
pub mod error;
pub mod histogram;
pub mod memcached;
pub mod memdb;
pub mod net;
pub mod report;
pub mod stats;
pub mod tcp;
pub mod transaction;
pub mod udp;
pub mod worker;
