//! The unit of publication: all changes of one committed transaction.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use quill_types::{ProcessId, StreamSeq};

use crate::{CdcError, Change};

/// All row-level changes of one committed transaction, packaged for
/// shipping through the durable log.
///
/// `stream_seq` is out-of-band: the durable log assigns it on publish and
/// the subscriber populates it from delivery metadata. It is never part of
/// the wire payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Changeset {
    pub node: String,
    #[serde(default)]
    pub process_id: ProcessId,
    pub changes: Vec<Change>,
    #[serde(default)]
    pub timestamp_ns: i64,
    #[serde(skip)]
    pub stream_seq: Option<StreamSeq>,
}

impl Changeset {
    /// Packages drained changes at commit time, stamping the wall clock.
    ///
    /// The publisher stamps `process_id` before the record leaves the node.
    pub fn new(node: impl Into<String>, changes: Vec<Change>) -> Self {
        let timestamp_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or_default();
        Self {
            node: node.into(),
            process_id: ProcessId::default(),
            changes,
            timestamp_ns,
            stream_seq: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Serialises to the self-describing wire encoding.
    pub fn encode(&self) -> Result<Vec<u8>, CdcError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes a wire payload.
    pub fn decode(payload: &[u8]) -> Result<Self, CdcError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SqlValue;

    fn sample() -> Changeset {
        let mut cs = Changeset::new(
            "node-a",
            vec![Change::insert(
                "main",
                "users",
                vec!["id".into(), "name".into()],
                1,
                vec![SqlValue::Integer(1), SqlValue::Text("alice".into())],
            )],
        );
        cs.process_id = ProcessId::new(99);
        cs
    }

    #[test]
    fn wire_encoding_round_trips() {
        let cs = sample();
        let payload = cs.encode().unwrap();
        let back = Changeset::decode(&payload).unwrap();
        assert_eq!(back.node, cs.node);
        assert_eq!(back.process_id, cs.process_id);
        assert_eq!(back.changes, cs.changes);
        assert_eq!(back.timestamp_ns, cs.timestamp_ns);
        assert!(back.stream_seq.is_none());
    }

    #[test]
    fn wire_encoding_uses_the_documented_keys() {
        let payload = sample().encode().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(json["node"], "node-a");
        assert_eq!(json["process_id"], 99);
        assert_eq!(json["changes"][0]["operation"], "INSERT");
        assert_eq!(json["changes"][0]["table"], "users");
        assert_eq!(json["changes"][0]["new_values"][1], "alice");
        assert!(json["timestamp_ns"].as_i64().unwrap() > 0);
        assert!(json.get("stream_seq").is_none());
    }

    #[test]
    fn stream_seq_never_crosses_the_wire() {
        let mut cs = sample();
        cs.stream_seq = Some(StreamSeq::new(7));
        let back = Changeset::decode(&cs.encode().unwrap()).unwrap();
        assert!(back.stream_seq.is_none());
    }
}
