//! Stats export schemas
//!
//! The current schema bundles the node identity, the metric snapshot, and
//! the capacity distribution. The legacy (prior major version) schema is
//! derivable from the same data for proxies that have not upgraded yet.

use std::collections::BTreeMap;

use serde::Serialize;
use uuid::Uuid;

use tessera_fs::TargetCdf;

/// Node identity
#[derive(Clone, Debug, Serialize)]
pub struct Snode {
    pub id: String,
    pub daemon_type: String,
}

impl Snode {
    #[must_use]
    pub fn target(id: Option<String>) -> Self {
        Self {
            id: id.unwrap_or_else(|| format!("t-{}", Uuid::new_v4().simple())),
            daemon_type: "target".to_owned(),
        }
    }
}

/// Current export schema
#[derive(Clone, Debug, Serialize)]
pub struct Node {
    pub snode: Snode,
    pub tracker: BTreeMap<String, i64>,
    pub cdf: TargetCdf,
}

/// Legacy per-mountpath capacity
#[derive(Clone, Debug, Serialize)]
pub struct MpathCapV1 {
    pub used: u64,
    pub avail: u64,
    pub pct_used: i32,
}

/// Legacy flattened capacity section
#[derive(Clone, Debug, Serialize)]
pub struct CapacityV1 {
    pub pct_max: i32,
    pub pct_avg: i32,
    pub pct_min: i32,
    pub mountpaths: BTreeMap<String, MpathCapV1>,
}

/// Legacy export schema (prior major version)
#[derive(Clone, Debug, Serialize)]
pub struct NodeV1 {
    pub snode: Snode,
    pub tracker: BTreeMap<String, i64>,
    pub capacity: CapacityV1,
}

impl From<&Node> for NodeV1 {
    fn from(node: &Node) -> Self {
        let mountpaths = node
            .cdf
            .mountpaths
            .iter()
            .map(|(mpath, cdf)| {
                (
                    mpath.clone(),
                    MpathCapV1 {
                        used: cdf.capacity.used,
                        avail: cdf.capacity.avail,
                        pct_used: cdf.capacity.pct_used,
                    },
                )
            })
            .collect();
        Self {
            snode: node.snode.clone(),
            tracker: node.tracker.clone(),
            capacity: CapacityV1 {
                pct_max: node.cdf.pct_max,
                pct_avg: node.cdf.pct_avg,
                pct_min: node.cdf.pct_min,
                mountpaths,
            },
        }
    }
}
