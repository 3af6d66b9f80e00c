use std::fmt::Debug;

use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    storage::{
        chain::VersionView,
        ctx::{TxnState, Writer},
        scn::Scn,
        unit::{SingleUnit, StateUnit},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    Active,
    Prepared,
    Committed,
    Aborted,
}

/// Read-only projection of one version for introspection tables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub unit_id: u8,
    /// bincode-encoded key, empty for single-row units
    #[serde(with = "serde_bytes")]
    pub key: Vec<u8>,
    pub key_desc: String,
    pub writer: Writer,
    pub state: NodeState,
    pub scn: Option<Scn>,
    pub prepare_scn: Option<Scn>,
    pub seq: u64,
    pub is_remove: bool,
    pub payload_size: u64,
    /// Debug rendering of the value, at most `max_payload_summary` chars
    pub payload: String,
}

impl NodeInfo {
    fn build<K, V>(unit_id: u8, key: &K, node: &VersionView<'_, V>, max_payload: usize) -> Result<Self>
    where
        K: Serialize + Debug,
        V: Serialize + Debug,
    {
        let (state, scn, prepare_scn) = match node.state {
            TxnState::Active => (NodeState::Active, None, None),
            TxnState::Prepared(prepare) => (NodeState::Prepared, None, Some(prepare)),
            TxnState::Committed(scn) => (NodeState::Committed, Some(scn), None),
            TxnState::Aborted => (NodeState::Aborted, None, None),
        };
        Ok(Self {
            unit_id,
            key: bincode::serialize(key)?,
            key_desc: format!("{:?}", key),
            writer: node.writer,
            state,
            scn,
            prepare_scn,
            seq: node.seq,
            is_remove: node.is_remove,
            payload_size: bincode::serialized_size(node.value)?,
            payload: summarize(node.value, max_payload),
        })
    }
}

const ELLIPSIS: &str = "...";

/// Debug rendering cut to at most `max` chars, ellipsis included
fn summarize<V: Debug>(value: &V, max: usize) -> String {
    let full = format!("{:?}", value);
    if full.chars().count() <= max {
        return full;
    }
    if max <= ELLIPSIS.len() {
        return full.chars().take(max).collect();
    }
    let mut cut: String = full.chars().take(max - ELLIPSIS.len()).collect();
    cut.push_str(ELLIPSIS);
    cut
}

impl<K, V> StateUnit<K, V>
where
    K: Ord + Clone + Debug + Serialize,
    V: Serialize + Debug,
{
    /// Appends one record per stored version, rows in ascending key order.
    /// Holds the shared lock and changes nothing.
    pub fn fill_diagnostic_info(&self, sink: &mut Vec<NodeInfo>, unit_id: u8) -> Result<()> {
        let max_payload = self.config().max_payload_summary;
        self.for_each_node_on_row(|key, node| {
            sink.push(NodeInfo::build(unit_id, key, node, max_payload)?);
            Ok(())
        })
    }
}

impl<V: Serialize + Debug> SingleUnit<V> {
    pub fn fill_diagnostic_info(&self, sink: &mut Vec<NodeInfo>, unit_id: u8) -> Result<()> {
        self.unit().fill_diagnostic_info(sink, unit_id)
    }
}
