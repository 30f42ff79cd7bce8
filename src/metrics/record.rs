//! The one data item that crosses the node/aggregator boundary.

use serde::Serialize;
use uuid::Uuid;

/// One pull attempt's outcome. `attempt_id` is the aggregator's dedup key;
/// it is minted fresh per attempt, never derived from input, so at-least-once
/// submission composes with idempotent aggregation for free.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    pub attempt_id: String,
    pub image: String,
    pub started_at_epoch_sec: i64,
    pub duration_ms: u64,
    pub size_bytes: u64,
    pub error: String,
    pub node: String,
}

impl AttemptRecord {
    pub fn success(
        image: &str,
        started_at_epoch_sec: i64,
        duration_ms: u64,
        size_bytes: u64,
    ) -> Self {
        AttemptRecord {
            attempt_id: Uuid::new_v4().to_string(),
            image: image.to_string(),
            started_at_epoch_sec,
            duration_ms,
            size_bytes,
            error: String::new(),
            node: String::new(),
        }
    }

    pub fn failure(
        image: &str,
        started_at_epoch_sec: i64,
        duration_ms: u64,
        error: impl ToString,
    ) -> Self {
        AttemptRecord {
            attempt_id: Uuid::new_v4().to_string(),
            image: image.to_string(),
            started_at_epoch_sec,
            duration_ms,
            size_bytes: 0,
            error: error.to_string(),
            node: String::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_empty()
    }

    pub fn stamped_with_node(mut self, node: &str) -> Self {
        self.node = node.to_string();
        self
    }
}

pub mod proto {
    #![allow(clippy::derive_partial_eq_without_eq)]
    tonic::include_proto!("prefetcher.metrics");
}

impl From<AttemptRecord> for proto::AttemptRecord {
    fn from(record: AttemptRecord) -> Self {
        proto::AttemptRecord {
            attempt_id: record.attempt_id,
            image: record.image,
            started_at_epoch_sec: record.started_at_epoch_sec,
            duration_ms: record.duration_ms,
            size_bytes: record.size_bytes,
            error: record.error,
            node: record.node,
        }
    }
}

impl From<proto::AttemptRecord> for AttemptRecord {
    fn from(record: proto::AttemptRecord) -> Self {
        AttemptRecord {
            attempt_id: record.attempt_id,
            image: record.image,
            started_at_epoch_sec: record.started_at_epoch_sec,
            duration_ms: record.duration_ms,
            size_bytes: record.size_bytes,
            error: record.error,
            node: record.node,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_record_has_no_error_and_is_success() {
        let record = AttemptRecord::success("img:1", 100, 20, 4096);
        assert!(record.is_success());
        assert_eq!(record.size_bytes, 4096);
    }

    #[test]
    fn failure_record_carries_zero_size_and_the_error_text() {
        let record = AttemptRecord::failure("img:1", 100, 20, "unavailable");
        assert!(!record.is_success());
        assert_eq!(record.size_bytes, 0);
        assert_eq!(record.error, "unavailable");
    }

    #[test]
    fn attempt_ids_are_unique_per_record() {
        let a = AttemptRecord::success("img:1", 0, 0, 0);
        let b = AttemptRecord::success("img:1", 0, 0, 0);
        assert_ne!(a.attempt_id, b.attempt_id);
    }

    #[test]
    fn proto_round_trip_preserves_fields() {
        let record = AttemptRecord::success("img:1", 42, 7, 99).stamped_with_node("node-a");
        let proto: proto::AttemptRecord = record.clone().into();
        let back: AttemptRecord = proto.into();
        assert_eq!(record, back);
    }
}
