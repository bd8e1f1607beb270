//! Cooperative sticky assignment strategy.
//!
//! Partitions stay with their prior owner wherever possible. A partition whose
//! owner must change is withheld from the new owner for one generation: the
//! old owner's next assignment simply lacks it, the old owner revokes it
//! incrementally and rejoins, and the follow-up rebalance hands it out. That
//! deferral is what makes the protocol cooperative instead of stop-the-world.

use crate::balance::{protocol, AssignmentMap, GroupBalancer, JoinMember};
use crate::error::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Prior-assignment record carried in the subscription user data, so that
/// stickiness survives members that rejoined with a fresh subscription
/// payload version.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StickyUserData {
    /// (topic, partition) pairs the member owned when it last synced.
    pub owned_partitions: Vec<(String, i32)>,
    /// Generation the ownership was recorded in.
    pub generation: i32,
}

impl StickyUserData {
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.is_empty() {
            return None;
        }
        serde_json::from_slice(data).ok()
    }
}

/// Sticky assignor speaking the cooperative rebalance protocol.
#[derive(Debug, Default)]
pub struct CooperativeStickyBalancer;

impl GroupBalancer for CooperativeStickyBalancer {
    fn protocol_name(&self) -> &'static str {
        "cooperative-sticky"
    }

    fn is_cooperative(&self) -> bool {
        true
    }

    fn join_metadata(&self, topics: &[String], current: &AssignmentMap, generation: i32) -> Bytes {
        let owned_partitions = current
            .iter()
            .flat_map(|(t, ps)| ps.iter().map(move |p| (t.clone(), *p)))
            .collect();
        let user_data = StickyUserData {
            owned_partitions,
            generation,
        }
        .encode();
        protocol::encode_subscription(1, topics, Some(&user_data), current)
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

        // Per-member subscriptions and prior ownership.
        let mut subscribed: BTreeMap<String, Vec<String>> = BTreeMap::new(); // member -> topics
        let mut owner: BTreeMap<(String, i32), String> = BTreeMap::new();
        for member in members {
            let sub = protocol::parse_subscription(&member.metadata)?;
            let mut owned: Vec<(String, i32)> = sub
                .owned
                .iter()
                .flat_map(|(t, ps)| ps.iter().map(move |p| (t.clone(), *p)))
                .collect();
            if owned.is_empty() {
                if let Some(data) = sub.user_data.as_deref().and_then(StickyUserData::decode) {
                    owned = data.owned_partitions;
                }
            }
            for tp in owned {
                owner.insert(tp, member.member_id.clone());
            }
            subscribed.insert(member.member_id.clone(), sub.topics);
        }

        let still_wants = |member: &str, topic: &str| {
            subscribed
                .get(member)
                .is_some_and(|topics| topics.iter().any(|t| t == topic))
        };

        // First pass: prior owners keep what they still subscribe to. A
        // partition whose live owner no longer wants it is withheld entirely
        // this generation; it becomes free once the owner revokes and rejoins.
        let mut load: BTreeMap<String, usize> =
            members.iter().map(|m| (m.member_id.clone(), 0)).collect();
        let mut free: Vec<(String, i32)> = Vec::new();
        for (topic, &count) in partitions {
            for partition in 0..count {
                match owner.get(&(topic.clone(), partition)) {
                    Some(prior) if still_wants(prior, topic) => {
                        plan.get_mut(prior)
                            .expect("member was seeded above")
                            .entry(topic.clone())
                            .or_default()
                            .push(partition);
                        *load.get_mut(prior).expect("member was seeded above") += 1;
                    }
                    Some(_) => {} // withheld: owner must revoke it first
                    None => free.push((topic.clone(), partition)),
                }
            }
        }

        // Second pass: hand free partitions to the least-loaded subscriber.
        for (topic, partition) in free {
            let target = subscribed
                .iter()
                .filter(|(_, topics)| topics.iter().any(|t| t == &topic))
                .map(|(member, _)| member.clone())
                .min_by_key(|member| (load[member], member.clone()));
            let Some(target) = target else { continue };
            plan.get_mut(&target)
                .expect("member was seeded above")
                .entry(topic.clone())
                .or_default()
                .push(partition);
            *load.get_mut(&target).expect("member was seeded above") += 1;
        }

        for assignment in plan.values_mut() {
            for partitions in assignment.values_mut() {
                partitions.sort_unstable();
            }
        }
        Ok(plan)
    }

    fn parse_sync_assignment(&self, data: &Bytes) -> Result<AssignmentMap> {
        protocol::parse_assignment(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: &str, topics: &[&str], owned: &[(&str, i32)]) -> JoinMember {
        let topics: Vec<String> = topics.iter().map(|t| t.to_string()).collect();
        let mut owned_map = AssignmentMap::new();
        for (t, p) in owned {
            owned_map.entry(t.to_string()).or_default().push(*p);
        }
        JoinMember {
            member_id: id.to_string(),
            instance_id: None,
            metadata: CooperativeStickyBalancer.join_metadata(&topics, &owned_map, 1),
        }
    }

    #[test]
    fn test_fresh_group_distributes_evenly() {
        let members = [member("a", &["t"], &[]), member("b", &["t"], &[])];
        let partitions = BTreeMap::from([("t".to_string(), 4)]);
        let plan = CooperativeStickyBalancer.balance(&members, &partitions).unwrap();
        assert_eq!(plan["a"]["t"].len() + plan["b"]["t"].len(), 4);
        assert_eq!(plan["a"]["t"].len(), 2);
    }

    #[test]
    fn test_prior_owner_keeps_partitions() {
        let members = [
            member("a", &["t"], &[("t", 0), ("t", 1), ("t", 2), ("t", 3)]),
            member("a2", &["t"], &[]),
        ];
        let partitions = BTreeMap::from([("t".to_string(), 4)]);
        let plan = CooperativeStickyBalancer.balance(&members, &partitions).unwrap();
        // All four stay with their owner this generation; nothing moves until
        // the owner revokes.
        assert_eq!(plan["a"]["t"], vec![0, 1, 2, 3]);
        assert!(plan["a2"].is_empty());
    }

    #[test]
    fn test_moving_partition_withheld_for_one_generation() {
        // "a" dropped partition 3 from its owned set (it revoked it), so the
        // next balance may hand it to "b" immediately.
        let members = [
            member("a", &["t"], &[("t", 0), ("t", 1), ("t", 2)]),
            member("b", &["t"], &[]),
        ];
        let partitions = BTreeMap::from([("t".to_string(), 4)]);
        let plan = CooperativeStickyBalancer.balance(&members, &partitions).unwrap();
        assert_eq!(plan["a"]["t"], vec![0, 1, 2]);
        assert_eq!(plan["b"]["t"], vec![3]);
    }

    #[test]
    fn test_departed_owner_frees_partitions() {
        let members = [member("b", &["t"], &[])];
        let partitions = BTreeMap::from([("t".to_string(), 2)]);
        let plan = CooperativeStickyBalancer.balance(&members, &partitions).unwrap();
        assert_eq!(plan["b"]["t"], vec![0, 1]);
    }
}
