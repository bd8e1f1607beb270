//! Range assignment strategy.

use crate::balance::{protocol, AssignmentMap, GroupBalancer, JoinMember};
use crate::error::Result;
use bytes::Bytes;
use std::collections::BTreeMap;

/// Assigns partitions on a per-topic basis: for each topic, the subscribed
/// members are sorted and each receives a contiguous range, with the first
/// `count % members` members receiving one extra partition.
///
/// This is the eager protocol: every rebalance revokes everything first.
#[derive(Debug, Default)]
pub struct RangeBalancer;

impl GroupBalancer for RangeBalancer {
    fn protocol_name(&self) -> &'static str {
        "range"
    }

    fn is_cooperative(&self) -> bool {
        false
    }

    fn join_metadata(&self, topics: &[String], _current: &AssignmentMap, _generation: i32) -> Bytes {
        protocol::encode_subscription(0, topics, None, &AssignmentMap::new())
    }

    fn balance(
        &self,
        members: &[JoinMember],
        partitions: &BTreeMap<String, i32>,
    ) -> Result<BTreeMap<String, AssignmentMap>> {
        let mut plan: BTreeMap<String, AssignmentMap> = members
            .iter()
            .map(|m| (m.member_id.clone(), AssignmentMap::new()))
            .collect();

        // topic -> sorted member ids subscribed to it
        let mut subscribers: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for member in members {
            let sub = protocol::parse_subscription(&member.metadata)?;
            for topic in sub.topics {
                subscribers
                    .entry(topic)
                    .or_default()
                    .push(member.member_id.clone());
            }
        }

        for (topic, mut subscribed) in subscribers {
            let Some(&count) = partitions.get(&topic) else {
                continue;
            };
            subscribed.sort_unstable();
            let num_members = subscribed.len() as i32;
            let per_member = count / num_members;
            let extra = count % num_members;

            let mut partition = 0;
            for (i, member_id) in subscribed.iter().enumerate() {
                let take = per_member + i32::from((i as i32) < extra);
                if take == 0 {
                    continue;
                }
                let assigned = (partition..partition + take).collect();
                partition += take;
                plan.get_mut(member_id)
                    .expect("member was seeded above")
                    .insert(topic.clone(), assigned);
            }
        }

        Ok(plan)
    }

    fn parse_sync_assignment(&self, data: &Bytes) -> Result<AssignmentMap> {
        protocol::parse_assignment(data)
    }
}
