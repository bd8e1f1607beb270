//! Per-partition tracking of consumed progress and acknowledged commits.
//!
//! Every partition the member consumes gets an [`UncommitRecord`] holding two
//! offsets: `head`, one past the last record handed to the user (the offset
//! to resume from on rejoin), and `committed`, the last value the coordinator
//! acknowledged. The ledger is the single source of truth for what an
//! autocommit or "commit everything" call should send.

use crate::balance::AssignmentMap;
use kafka_protocol::messages::{OffsetCommitRequest, OffsetCommitResponse};
use std::collections::BTreeMap;
use tracing::{error, warn};

/// A record offset paired with the leader epoch the broker was at when the
/// record was written (KIP-320). Epoch `-1` means unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochOffset {
    pub epoch: i32,
    pub offset: i64,
}

impl EpochOffset {
    /// Sentinel for "nothing known": pre-commit, pre-consume.
    pub(crate) const UNKNOWN: EpochOffset = EpochOffset {
        epoch: -1,
        offset: -1,
    };

    /// Whether this offset supersedes `other`: a higher epoch always wins,
    /// and within an epoch the higher offset wins.
    pub fn later_than(&self, other: &EpochOffset) -> bool {
        self.epoch > other.epoch || (self.epoch == other.epoch && self.offset > other.offset)
    }
}

/// Offsets keyed by topic then partition, as exchanged with callers.
pub type OffsetMap = BTreeMap<String, BTreeMap<i32, EpochOffset>>;

/// A consumed record's coordinates, for [`commit_records`](crate::GroupConsumer::commit_records).
#[derive(Debug, Clone)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub leader_epoch: i32,
}

/// The tail of one batch of records handed to the user for one partition.
#[derive(Debug, Clone)]
pub struct PolledBatch {
    pub topic: String,
    pub partition: i32,
    /// Offset of the final record in the batch.
    pub final_offset: i64,
    /// Leader epoch of the final record, `-1` if unknown.
    pub final_leader_epoch: i32,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct UncommitRecord {
    pub(crate) head: EpochOffset,
    pub(crate) committed: EpochOffset,
}

/// topic -> partition -> consumed/committed progress.
#[derive(Debug, Default)]
pub(crate) struct UncommittedLedger {
    topics: BTreeMap<String, BTreeMap<i32, UncommitRecord>>,
}

impl UncommittedLedger {
    /// Advance heads past the final record of each polled batch. Creates
    /// entries as needed; never moves a head backwards.
    pub(crate) fn advance(&mut self, polled: &[PolledBatch]) {
        for batch in polled {
            let new_head = EpochOffset {
                epoch: batch.final_leader_epoch,
                offset: batch.final_offset + 1,
            };
            let entry = self
                .topics
                .entry(batch.topic.clone())
                .or_default()
                .entry(batch.partition)
                .or_insert(UncommitRecord {
                    head: EpochOffset::UNKNOWN,
                    committed: EpochOffset::UNKNOWN,
                });
            if new_head.later_than(&entry.head) {
                entry.head = new_head;
            }
        }
    }

    /// Seed a partition from a fetched committed offset: both head and
    /// committed start there.
    pub(crate) fn seed(&mut self, topic: &str, partition: i32, fetched: EpochOffset) {
        self.topics
            .entry(topic.to_string())
            .or_default()
            .insert(
                partition,
                UncommitRecord {
                    head: fetched,
                    committed: fetched,
                },
            );
    }

    /// Record a directly set offset. Returns true when the fetch pipeline
    /// must be repositioned: when the head already sits at the requested
    /// offset, only `committed` is updated and no reposition is needed.
    pub(crate) fn set_offset(&mut self, topic: &str, partition: i32, at: EpochOffset) -> bool {
        let entry = self.topics.entry(topic.to_string()).or_default();
        if let Some(current) = entry.get_mut(&partition) {
            if current.head == at {
                current.committed = at;
                return false;
            }
        }
        entry.insert(
            partition,
            UncommitRecord {
                head: at,
                committed: at,
            },
        );
        true
    }

    /// Apply a successful commit response, advancing `committed` for every
    /// partition that committed cleanly.
    ///
    /// Request and response are paired positionally after sorting both by
    /// topic then partition. Any structural mismatch between the two means we
    /// cannot trust the pairing, so the entire response is discarded rather
    /// than partially applied.
    pub(crate) fn apply_commit(&mut self, req: &mut OffsetCommitRequest, resp: &mut OffsetCommitResponse) {
        req.topics.sort_by(|a, b| a.name.as_str().cmp(b.name.as_str()));
        resp.topics.sort_by(|a, b| a.name.as_str().cmp(b.name.as_str()));
        for topic in req.topics.iter_mut() {
            topic
                .partitions
                .sort_by_key(|p| p.partition_index);
        }
        for topic in resp.topics.iter_mut() {
            topic
                .partitions
                .sort_by_key(|p| p.partition_index);
        }

        if let Err(mismatch) = Self::check_pairing(req, resp) {
            error!(
                mismatch = %mismatch,
                "commit response does not match its request, discarding the entire response"
            );
            return;
        }

        for (req_topic, resp_topic) in req.topics.iter().zip(resp.topics.iter()) {
            let Some(partitions) = self.topics.get_mut(req_topic.name.as_str()) else {
                continue;
            };
            for (req_part, resp_part) in req_topic.partitions.iter().zip(resp_topic.partitions.iter())
            {
                if resp_part.error_code != 0 {
                    warn!(
                        topic = %req_topic.name.as_str(),
                        partition = req_part.partition_index,
                        error_code = resp_part.error_code,
                        "unable to commit offset for topic partition"
                    );
                    continue;
                }
                if let Some(entry) = partitions.get_mut(&req_part.partition_index) {
                    entry.committed = EpochOffset {
                        epoch: req_part.committed_leader_epoch,
                        offset: req_part.committed_offset,
                    };
                }
            }
        }
    }

    fn check_pairing(
        req: &OffsetCommitRequest,
        resp: &OffsetCommitResponse,
    ) -> std::result::Result<(), String> {
        if req.topics.len() != resp.topics.len() {
            return Err(format!(
                "request has {} topics, response has {}",
                req.topics.len(),
                resp.topics.len()
            ));
        }
        for (req_topic, resp_topic) in req.topics.iter().zip(resp.topics.iter()) {
            if req_topic.name != resp_topic.name {
                return Err(format!(
                    "request topic {:?} paired with response topic {:?}",
                    req_topic.name.as_str(),
                    resp_topic.name.as_str()
                ));
            }
            if req_topic.partitions.len() != resp_topic.partitions.len() {
                return Err(format!(
                    "topic {:?} has {} partitions in request, {} in response",
                    req_topic.name.as_str(),
                    req_topic.partitions.len(),
                    resp_topic.partitions.len()
                ));
            }
            for (req_part, resp_part) in
                req_topic.partitions.iter().zip(resp_topic.partitions.iter())
            {
                if req_part.partition_index != resp_part.partition_index {
                    return Err(format!(
                        "topic {:?} partition {} paired with response partition {}",
                        req_topic.name.as_str(),
                        req_part.partition_index,
                        resp_part.partition_index
                    ));
                }
            }
        }
        Ok(())
    }

    /// Deep copy for callers: heads (what is consumable but uncommitted) or
    /// committeds. A head snapshot omits partitions with nothing new to
    /// commit.
    pub(crate) fn snapshot(&self, heads: bool) -> Option<OffsetMap> {
        let mut out = OffsetMap::new();
        for (topic, partitions) in &self.topics {
            let mut topic_out = BTreeMap::new();
            for (&partition, record) in partitions {
                if heads && record.head == record.committed {
                    continue;
                }
                topic_out.insert(
                    partition,
                    if heads { record.head } else { record.committed },
                );
            }
            if !topic_out.is_empty() {
                out.insert(topic.clone(), topic_out);
            }
        }
        (!out.is_empty()).then_some(out)
    }

    /// Erase entries for revoked partitions. Returns true when the ledger is
    /// now empty and should be dropped entirely.
    pub(crate) fn drop_partitions(&mut self, lost: &AssignmentMap) -> bool {
        for (topic, partitions) in lost {
            if let Some(entries) = self.topics.get_mut(topic) {
                for partition in partitions {
                    entries.remove(partition);
                }
                if entries.is_empty() {
                    self.topics.remove(topic);
                }
            }
        }
        self.topics.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kafka_protocol::messages::offset_commit_request::{
        OffsetCommitRequestPartition, OffsetCommitRequestTopic,
    };
    use kafka_protocol::messages::offset_commit_response::{
        OffsetCommitResponsePartition, OffsetCommitResponseTopic,
    };
    use kafka_protocol::messages::TopicName;
    use kafka_protocol::protocol::StrBytes;

    fn batch(topic: &str, partition: i32, final_offset: i64) -> PolledBatch {
        PolledBatch {
            topic: topic.to_string(),
            partition,
            final_offset,
            final_leader_epoch: 1,
        }
    }

    // Both helpers keep the given topic order so tests can exercise the
    // sort-then-pair logic with deliberately shuffled inputs.
    fn commit_req(entries: &[(&str, i32, i64)]) -> OffsetCommitRequest {
        let mut req = OffsetCommitRequest::default();
        for (topic, partition, offset) in entries {
            let part = OffsetCommitRequestPartition::default()
                .with_partition_index(*partition)
                .with_committed_offset(*offset)
                .with_committed_leader_epoch(1);
            match req.topics.iter_mut().find(|t| t.name.as_str() == *topic) {
                Some(existing) => existing.partitions.push(part),
                None => req.topics.push(
                    OffsetCommitRequestTopic::default()
                        .with_name(TopicName::from(StrBytes::from_string(topic.to_string())))
                        .with_partitions(vec![part]),
                ),
            }
        }
        req
    }

    fn commit_resp(entries: &[(&str, i32, i16)]) -> OffsetCommitResponse {
        let mut resp = OffsetCommitResponse::default();
        for (topic, partition, error_code) in entries {
            let part = OffsetCommitResponsePartition::default()
                .with_partition_index(*partition)
                .with_error_code(*error_code);
            match resp.topics.iter_mut().find(|t| t.name.as_str() == *topic) {
                Some(existing) => existing.partitions.push(part),
                None => resp.topics.push(
                    OffsetCommitResponseTopic::default()
                        .with_name(TopicName::from(StrBytes::from_string(topic.to_string())))
                        .with_partitions(vec![part]),
                ),
            }
        }
        resp
    }

    #[test]
    fn test_advance_sets_head_past_final_record() {
        let mut ledger = UncommittedLedger::default();
        ledger.advance(&[batch("t", 0, 41)]);
        let snap = ledger.snapshot(true).unwrap();
        assert_eq!(snap["t"][&0], EpochOffset { epoch: 1, offset: 42 });
    }

    #[test]
    fn test_advance_never_lowers_head() {
        let mut ledger = UncommittedLedger::default();
        ledger.advance(&[batch("t", 0, 100)]);
        ledger.advance(&[batch("t", 0, 50)]);
        assert_eq!(ledger.snapshot(true).unwrap()["t"][&0].offset, 101);
    }

    #[test]
    fn test_head_snapshot_omits_fully_committed() {
        let mut ledger = UncommittedLedger::default();
        ledger.seed("t", 0, EpochOffset { epoch: 1, offset: 10 });
        assert!(ledger.snapshot(true).is_none());
        assert_eq!(
            ledger.snapshot(false).unwrap()["t"][&0],
            EpochOffset { epoch: 1, offset: 10 }
        );

        ledger.advance(&[batch("t", 0, 12)]);
        assert_eq!(ledger.snapshot(true).unwrap()["t"][&0].offset, 13);
    }

    #[test]
    fn test_apply_commit_advances_committed() {
        let mut ledger = UncommittedLedger::default();
        ledger.advance(&[batch("t", 0, 9)]);
        let mut req = commit_req(&[("t", 0, 10)]);
        let mut resp = commit_resp(&[("t", 0, 0)]);
        ledger.apply_commit(&mut req, &mut resp);
        assert!(ledger.snapshot(true).is_none());
        assert_eq!(ledger.snapshot(false).unwrap()["t"][&0].offset, 10);
    }

    #[test]
    fn test_partition_error_leaves_committed_alone() {
        let mut ledger = UncommittedLedger::default();
        ledger.advance(&[batch("t", 0, 9), batch("t", 1, 9)]);
        let mut req = commit_req(&[("t", 0, 10), ("t", 1, 10)]);
        let mut resp = commit_resp(&[("t", 0, 0), ("t", 1, 25)]);
        ledger.apply_commit(&mut req, &mut resp);
        let committed = ledger.snapshot(false).unwrap();
        assert_eq!(committed["t"][&0].offset, 10);
        assert_eq!(committed["t"][&1], EpochOffset::UNKNOWN);
    }

    #[test]
    fn test_structural_mismatch_discards_whole_response() {
        let mut ledger = UncommittedLedger::default();
        ledger.advance(&[batch("t", 0, 9), batch("u", 0, 9)]);
        let mut req = commit_req(&[("t", 0, 10), ("u", 0, 10)]);
        // Response covers only one topic: nothing may be applied, not even
        // the topic that does appear.
        let mut resp = commit_resp(&[("t", 0, 0)]);
        ledger.apply_commit(&mut req, &mut resp);
        let committed = ledger.snapshot(false).unwrap();
        assert_eq!(committed["t"][&0], EpochOffset::UNKNOWN);
        assert_eq!(committed["u"][&0], EpochOffset::UNKNOWN);
    }

    #[test]
    fn test_pairing_is_order_insensitive() {
        let mut ledger = UncommittedLedger::default();
        ledger.advance(&[batch("a", 0, 9), batch("b", 0, 9)]);
        let mut req = commit_req(&[("b", 0, 10), ("a", 0, 7)]);
        let mut resp = commit_resp(&[("a", 0, 0), ("b", 0, 0)]);
        ledger.apply_commit(&mut req, &mut resp);
        let committed = ledger.snapshot(false).unwrap();
        assert_eq!(committed["a"][&0].offset, 7);
        assert_eq!(committed["b"][&0].offset, 10);
    }

    #[test]
    fn test_drop_partitions_prunes_and_reports_empty() {
        let mut ledger = UncommittedLedger::default();
        ledger.advance(&[batch("t", 0, 9), batch("t", 1, 9)]);
        let mut lost = AssignmentMap::new();
        lost.insert("t".to_string(), vec![0]);
        assert!(!ledger.drop_partitions(&lost));
        lost.insert("t".to_string(), vec![1]);
        assert!(ledger.drop_partitions(&lost));
    }

    #[test]
    fn test_set_offset_skips_reposition_when_head_matches() {
        let mut ledger = UncommittedLedger::default();
        let at = EpochOffset { epoch: 1, offset: 5 };
        ledger.seed("t", 0, at);
        assert!(!ledger.set_offset("t", 0, at));
        assert!(ledger.set_offset("t", 0, EpochOffset { epoch: 1, offset: 9 }));
    }

    #[test]
    fn test_later_than_prefers_epoch_then_offset() {
        let low = EpochOffset { epoch: 1, offset: 100 };
        let high_epoch = EpochOffset { epoch: 2, offset: 5 };
        let high_offset = EpochOffset { epoch: 1, offset: 101 };
        assert!(high_epoch.later_than(&low));
        assert!(high_offset.later_than(&low));
        assert!(!low.later_than(&low));
    }
}
