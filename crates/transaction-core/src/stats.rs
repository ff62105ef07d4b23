//! Read-only counters kept by the agent

use serde::Serialize;

/// Message and transaction counters
///
/// Counters only ever grow; the `*_table` fields are the live sizes of the
/// hash tables when the snapshot was taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AgentStats {
    pub recv_msg: u64,
    pub recv_request: u64,
    pub recv_response: u64,
    pub bad_message: u64,
    pub bad_request: u64,
    pub bad_response: u64,
    pub drop_request: u64,
    pub drop_response: u64,

    pub client_tr: u64,
    pub server_tr: u64,
    pub dialog_tr: u64,
    pub acked_tr: u64,
    pub canceled_tr: u64,
    pub trless_request: u64,
    pub trless_response: u64,
    pub merged_request: u64,

    pub sent_msg: u64,
    pub sent_request: u64,
    pub sent_response: u64,
    pub retry_request: u64,
    pub retry_response: u64,
    pub recv_retry: u64,
    pub tout_request: u64,
    pub tout_response: u64,

    pub incoming_table: usize,
    pub outgoing_table: usize,
    pub leg_table: usize,
}

impl AgentStats {
    /// Snapshot as a JSON object
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
