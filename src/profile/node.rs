use serde::{Deserialize, Serialize};

use super::options::SortMethod;

/// Outcome of benchmarking one link.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: usize,
    pub group: String,
    pub remarks: String,
    pub protocol: String,
    /// Milliseconds; 0 when the probe failed or was skipped.
    pub ping: i64,
    #[serde(rename = "avg_speed")]
    pub avg_speed: i64,
    #[serde(rename = "max_speed")]
    pub max_speed: i64,
    #[serde(rename = "isok")]
    pub is_ok: bool,
    pub traffic: i64,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub link: String,
}

/// Stable in-place sort; equal keys keep their relative order.
pub fn sort_nodes(nodes: &mut [Node], method: SortMethod) {
    match method {
        SortMethod::Speed => nodes.sort_by_key(|n| n.max_speed),
        SortMethod::RSpeed => nodes.sort_by(|a, b| b.max_speed.cmp(&a.max_speed)),
        SortMethod::Ping => nodes.sort_by_key(|n| n.ping),
        SortMethod::RPing => nodes.sort_by(|a, b| b.ping.cmp(&a.ping)),
        SortMethod::None => {}
    }
}
