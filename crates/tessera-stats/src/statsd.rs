//! StatsD client
//!
//! Plain-text UDP datagrams, one metric per line:
//! `<namespace>.<metric>:<value>|<type>`. Delivery is best-effort; send
//! failures are counted and otherwise ignored.

use std::io;
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};

use tessera_common::config::StatsdConf;

use crate::tracker::Kind;

/// StatsD metric classes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetricClass {
    Counter,
    Gauge,
    Timer,
}

impl MetricClass {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Counter => "c",
            Self::Gauge => "g",
            Self::Timer => "ms",
        }
    }

    /// How a tracker kind maps onto the wire
    #[must_use]
    pub const fn from_kind(kind: Kind) -> Self {
        match kind {
            Kind::Counter | Kind::Size => Self::Counter,
            Kind::Latency | Kind::TotalLatency => Self::Timer,
            Kind::Throughput | Kind::ComputedThroughput | Kind::Gauge => Self::Gauge,
        }
    }
}

/// Connected UDP sender
#[derive(Debug)]
pub struct Statsd {
    socket: UdpSocket,
    prefix: String,
    dropped: AtomicU64,
}

impl Statsd {
    /// Resolve and connect; a dead resolver fails here, a dead sink does
    /// not
    pub fn new(conf: &StatsdConf) -> io::Result<Self> {
        let peer = conf
            .server
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no statsd address"))?;
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect(peer)?;
        Ok(Self {
            socket,
            prefix: conf.prefix.clone(),
            dropped: AtomicU64::new(0),
        })
    }

    /// Fire one metric; no retries
    pub fn send(&self, name: &str, value: i64, class: MetricClass) {
        let line = format!("{}.{}:{}|{}", self.prefix, name, value, class.as_str());
        if self.socket.send(line.as_bytes()).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
