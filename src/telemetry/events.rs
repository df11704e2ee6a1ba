use std::fmt;
use std::sync::Arc;

use crate::table::BlockMap;

#[cfg(feature = "telemetry-json")]
use serde_json::json;

/// Snapshot event emitted after each aggregation interval.
///
/// Carries the block table the interval just installed, so subscribers see
/// exactly what the hot path consults. The map is shared, not copied; holding
/// an update keeps that interval's snapshot alive but never blocks the
/// limiter.
#[derive(Debug, Clone)]
pub struct BlocksUpdate {
    /// Interval sequence number, starting at 1 for the first completed tick.
    pub tick: u64,
    /// The block table installed by this interval.
    pub blocks: Arc<BlockMap>,
    /// Cumulative count of swallowed DHT I/O errors.
    pub err_count: u64,
}

impl fmt::Display for BlocksUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Blocks(tick={}, blocked={}, errors={})",
            self.tick,
            self.blocks.len(),
            self.err_count
        )
    }
}

/// Convert a BlocksUpdate into a JSON value for sinks.
#[cfg(feature = "telemetry-json")]
pub fn update_to_json(update: &BlocksUpdate) -> serde_json::Value {
    let mut keys: Vec<serde_json::Value> = update
        .blocks
        .iter()
        .map(|(key, entry)| {
            json!({
                "key": String::from_utf8_lossy(key),
                "rate": entry.global_rate,
                "limits": entry.limits.iter().map(|(l, _)| l).collect::<Vec<_>>(),
            })
        })
        .collect();
    keys.sort_by(|a, b| a["key"].as_str().cmp(&b["key"].as_str()));
    json!({
        "kind": "blocks",
        "tick": update.tick,
        "blocked": update.blocks.len(),
        "errors": update.err_count,
        "keys": keys,
    })
}

#[cfg(all(test, feature = "telemetry-json"))]
mod json_tests {
    use super::*;
    use crate::table::{BlockEntry, Limits};

    #[test]
    fn update_json_lists_blocked_keys() {
        let mut blocks = BlockMap::new();
        let mut limits = Limits::new();
        limits.touch(5.0, 0);
        blocks.insert(b"client-a".to_vec(), BlockEntry { global_rate: 45.4, limits });

        let v = update_to_json(&BlocksUpdate { tick: 3, blocks: Arc::new(blocks), err_count: 1 });
        assert_eq!(v["kind"], "blocks");
        assert_eq!(v["tick"], 3);
        assert_eq!(v["blocked"], 1);
        assert_eq!(v["errors"], 1);
        assert_eq!(v["keys"][0]["key"], "client-a");
        assert_eq!(v["keys"][0]["limits"][0], 5.0);
    }

    #[test]
    fn empty_update_json() {
        let v = update_to_json(&BlocksUpdate {
            tick: 1,
            blocks: Arc::new(BlockMap::new()),
            err_count: 0,
        });
        assert_eq!(v["blocked"], 0);
        assert!(v["keys"].as_array().unwrap().is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{BlockEntry, Limits};

    #[test]
    fn update_display_summarizes_table() {
        let mut blocks = BlockMap::new();
        blocks.insert(b"k".to_vec(), BlockEntry { global_rate: 9.0, limits: Limits::new() });
        let update = BlocksUpdate { tick: 7, blocks: Arc::new(blocks), err_count: 2 };
        let text = update.to_string();
        assert!(text.contains("tick=7"));
        assert!(text.contains("blocked=1"));
        assert!(text.contains("errors=2"));
    }

    #[test]
    fn update_clone_shares_snapshot() {
        let update = BlocksUpdate { tick: 1, blocks: Arc::new(BlockMap::new()), err_count: 0 };
        let cloned = update.clone();
        assert!(Arc::ptr_eq(&update.blocks, &cloned.blocks));
    }
}
