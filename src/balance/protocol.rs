//! Byte codec for the consumer protocol payloads embedded in JoinGroup and
//! SyncGroup.
//!
//! Subscription (JoinGroup metadata):
//! version `i16`, topics `i32`-counted array of `i16`-length strings,
//! user data as `i32`-length bytes (-1 for null), and from version 1 the
//! owned partitions array used by cooperative strategies.
//!
//! Assignment (SyncGroup member assignment):
//! version `i16`, topic/partitions array, user data bytes.
//!
//! All counts are validated before allocation; a malformed payload yields a
//! `BadResponse` error rather than a partial parse.

use crate::balance::AssignmentMap;
use crate::error::{GroupError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

const MAX_TOPICS: i32 = 10_000;
const MAX_PARTITIONS_PER_TOPIC: i32 = 100_000;

/// A parsed consumer-protocol subscription.
#[derive(Debug, Clone, Default)]
pub(crate) struct Subscription {
    pub version: i16,
    pub topics: Vec<String>,
    pub user_data: Option<Bytes>,
    /// Partitions the member currently owns; empty below version 1.
    pub owned: AssignmentMap,
}

pub(crate) fn encode_subscription(
    version: i16,
    topics: &[String],
    user_data: Option<&[u8]>,
    owned: &AssignmentMap,
) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_i16(version);
    buf.put_i32(topics.len() as i32);
    for topic in topics {
        put_string(&mut buf, topic);
    }
    match user_data {
        Some(data) => {
            buf.put_i32(data.len() as i32);
            buf.put_slice(data);
        }
        None => buf.put_i32(-1),
    }
    if version >= 1 {
        put_assignment_map(&mut buf, owned);
    }
    buf.freeze()
}

pub(crate) fn parse_subscription(data: &Bytes) -> Result<Subscription> {
    let mut buf = data.clone();
    let version = get_i16(&mut buf)?;

    let topic_count = bounded_count(get_i32(&mut buf)?, MAX_TOPICS, "subscription topics")?;
    let mut topics = Vec::with_capacity(topic_count as usize);
    for _ in 0..topic_count {
        topics.push(get_string(&mut buf)?);
    }

    let user_len = get_i32(&mut buf)?;
    let user_data = if user_len < 0 {
        None
    } else {
        Some(get_bytes(&mut buf, user_len as usize)?)
    };

    let mut owned = AssignmentMap::new();
    if version >= 1 && buf.remaining() > 0 {
        owned = get_assignment_map(&mut buf)?;
    }

    Ok(Subscription {
        version,
        topics,
        user_data,
        owned,
    })
}

pub(crate) fn encode_assignment(assigned: &AssignmentMap) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_i16(0);
    put_assignment_map(&mut buf, assigned);
    buf.put_i32(-1); // no user data
    buf.freeze()
}

pub(crate) fn parse_assignment(data: &Bytes) -> Result<AssignmentMap> {
    let mut buf = data.clone();
    let _version = get_i16(&mut buf)?;
    get_assignment_map(&mut buf)
}

fn put_assignment_map(buf: &mut BytesMut, map: &AssignmentMap) {
    buf.put_i32(map.len() as i32);
    for (topic, partitions) in map {
        put_string(buf, topic);
        buf.put_i32(partitions.len() as i32);
        for partition in partitions {
            buf.put_i32(*partition);
        }
    }
}

fn get_assignment_map(buf: &mut Bytes) -> Result<AssignmentMap> {
    let topic_count = bounded_count(get_i32(buf)?, MAX_TOPICS, "assignment topics")?;
    let mut map = AssignmentMap::new();
    for _ in 0..topic_count {
        let topic = get_string(buf)?;
        let partition_count = bounded_count(
            get_i32(buf)?,
            MAX_PARTITIONS_PER_TOPIC,
            "assignment partitions",
        )?;
        let mut partitions = Vec::with_capacity(partition_count as usize);
        for _ in 0..partition_count {
            partitions.push(get_i32(buf)?);
        }
        partitions.sort_unstable();
        map.insert(topic, partitions);
    }
    Ok(map)
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_i16(s.len() as i16);
    buf.put_slice(s.as_bytes());
}

fn get_string(buf: &mut Bytes) -> Result<String> {
    let len = get_i16(buf)?;
    if len < 0 {
        return Err(GroupError::BadResponse("negative string length".into()));
    }
    let raw = get_bytes(buf, len as usize)?;
    String::from_utf8(raw.to_vec())
        .map_err(|_| GroupError::BadResponse("non-utf8 string".into()))
}

fn get_i16(buf: &mut Bytes) -> Result<i16> {
    if buf.remaining() < 2 {
        return Err(GroupError::BadResponse("truncated payload".into()));
    }
    Ok(buf.get_i16())
}

fn get_i32(buf: &mut Bytes) -> Result<i32> {
    if buf.remaining() < 4 {
        return Err(GroupError::BadResponse("truncated payload".into()));
    }
    Ok(buf.get_i32())
}

fn get_bytes(buf: &mut Bytes, len: usize) -> Result<Bytes> {
    if buf.remaining() < len {
        return Err(GroupError::BadResponse("truncated payload".into()));
    }
    Ok(buf.split_to(len))
}

fn bounded_count(count: i32, max: i32, what: &str) -> Result<i32> {
    if count < 0 || count > max {
        return Err(GroupError::BadResponse(format!(
            "{what} count {count} out of range"
        )));
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment(entries: &[(&str, &[i32])]) -> AssignmentMap {
        entries
            .iter()
            .map(|(t, ps)| (t.to_string(), ps.to_vec()))
            .collect()
    }

    #[test]
    fn test_subscription_v0() {
        let encoded = encode_subscription(
            0,
            &["orders".to_string(), "payments".to_string()],
            None,
            &AssignmentMap::new(),
        );
        let sub = parse_subscription(&encoded).unwrap();
        assert_eq!(sub.version, 0);
        assert_eq!(sub.topics, vec!["orders", "payments"]);
        assert!(sub.user_data.is_none());
        assert!(sub.owned.is_empty());
    }

    #[test]
    fn test_subscription_v1_carries_owned_partitions() {
        let owned = assignment(&[("orders", &[0, 2])]);
        let encoded = encode_subscription(1, &["orders".to_string()], Some(b"ud"), &owned);
        let sub = parse_subscription(&encoded).unwrap();
        assert_eq!(sub.version, 1);
        assert_eq!(sub.user_data.as_deref(), Some(b"ud".as_slice()));
        assert_eq!(sub.owned, owned);
    }

    #[test]
    fn test_assignment_partitions_are_sorted_on_parse() {
        let mut buf = BytesMut::new();
        buf.put_i16(0);
        buf.put_i32(1);
        buf.put_i16(6);
        buf.put_slice(b"orders");
        buf.put_i32(3);
        buf.put_i32(2);
        buf.put_i32(0);
        buf.put_i32(1);
        buf.put_i32(-1);

        let parsed = parse_assignment(&buf.freeze()).unwrap();
        assert_eq!(parsed, assignment(&[("orders", &[0, 1, 2])]));
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let encoded = encode_assignment(&assignment(&[("orders", &[0, 1])]));
        let truncated = encoded.slice(0..encoded.len() - 3);
        assert!(parse_assignment(&truncated).is_err());
    }

    #[test]
    fn test_hostile_counts_rejected() {
        let mut buf = BytesMut::new();
        buf.put_i16(0);
        buf.put_i32(i32::MAX);
        assert!(parse_assignment(&buf.freeze()).is_err());
    }
}
