//! Tessera target statistics
//!
//! A concurrent registry of typed metrics with a periodic roll-up task:
//! latency averaging, throughput derivation, coalesced logging, disk-stats
//! and capacity integration, node-state flags, soft-error monitoring, and
//! best-effort StatsD export.

pub mod export;
pub mod runner;
pub mod statsd;
pub mod tracker;

pub use export::{Node, NodeV1, Snode};
pub use runner::Trunner;
pub use statsd::{MetricClass, Statsd};
pub use tracker::{Kind, Tracker};
pub use tracker::{
    CLEANUP_STORE_COUNT, CLEANUP_STORE_SIZE, ERR_CKSUM_COUNT, ERR_CKSUM_SIZE, ERR_IO_COUNT,
    GET_COUNT, GET_LATENCY, GET_SIZE, GET_THROUGHPUT, LCACHE_EVICTED_COUNT,
    LCACHE_FLUSH_COLD_COUNT, LRU_EVICT_COUNT, LRU_EVICT_SIZE, PUT_COUNT, PUT_LATENCY,
    PUT_LATENCY_TOTAL, PUT_SIZE, PUT_THROUGHPUT, VER_CHANGE_COUNT, VER_CHANGE_SIZE,
};
