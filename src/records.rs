//! Binary codec for coordinator log records
//!
//! Two record families share the group metadata topic, discriminated by the
//! key's version field exactly as Kafka does it: versions 0 and 1 are offset
//! commit keys, version 2 is a group metadata key. The transaction topic
//! carries a single family with its own key version. Values are versioned
//! independently; a record with an empty value is a tombstone for its key.
//!
//! All integers are big-endian. Strings are an `i16` length followed by UTF-8
//! bytes, with length `-1` meaning null; byte blobs are an `i32` length
//! followed by the raw bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::{HashMap, HashSet};

use crate::error::{CoordinatorError, Result};
use crate::group::metadata::{GroupMetadata, MemberMetadata};
use crate::txn::metadata::{TransactionMetadata, TxnState, TxnTransitMetadata};
use crate::types::{GroupTopicPartition, OffsetAndMetadata, TopicPartition};

/// Key versions 0..=1 carry offset commit keys.
const CURRENT_OFFSET_KEY_SCHEMA_VERSION: i16 = 1;
/// Key version 2 carries group metadata keys.
const GROUP_METADATA_KEY_SCHEMA_VERSION: i16 = 2;

/// Version written for group metadata values.
pub const CURRENT_GROUP_VALUE_SCHEMA_VERSION: i16 = 1;
/// Version written for offset commit values.
const CURRENT_OFFSET_VALUE_SCHEMA_VERSION: i16 = 1;

/// Key and value versions written for transaction log records.
const TRANSACTION_LOG_KEY_SCHEMA_VERSION: i16 = 0;
const TRANSACTION_LOG_VALUE_SCHEMA_VERSION: i16 = 0;

/// A decoded key from the group metadata topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseKey {
    /// An offset commit record for one group topic partition.
    Offset(GroupTopicPartition),
    /// A group metadata record.
    GroupMetadata(String),
}

// ---------------------------------------------------------------------------
// group metadata topic: keys
// ---------------------------------------------------------------------------

/// Encode the key indexing a group metadata record.
pub fn group_metadata_key(group_id: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + 2 + group_id.len());
    buf.put_i16(GROUP_METADATA_KEY_SCHEMA_VERSION);
    put_string(&mut buf, group_id);
    buf.freeze()
}

/// Encode the key indexing an offset commit record.
pub fn offset_commit_key(group_id: &str, partition: &TopicPartition) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + 2 + group_id.len() + 2 + partition.topic.len() + 4);
    buf.put_i16(CURRENT_OFFSET_KEY_SCHEMA_VERSION);
    put_string(&mut buf, group_id);
    put_string(&mut buf, &partition.topic);
    buf.put_i32(partition.partition);
    buf.freeze()
}

/// Decode a key from the group metadata topic. An unknown key version is a
/// fatal load error.
pub fn read_message_key(mut buf: Bytes) -> Result<BaseKey> {
    let version = get_i16(&mut buf)?;
    match version {
        0 | 1 => {
            let group = get_string(&mut buf)?;
            let topic = get_string(&mut buf)?;
            let partition = get_i32(&mut buf)?;
            Ok(BaseKey::Offset(GroupTopicPartition::new(group, topic, partition)))
        }
        GROUP_METADATA_KEY_SCHEMA_VERSION => Ok(BaseKey::GroupMetadata(get_string(&mut buf)?)),
        other => Err(CoordinatorError::CorruptRecord(format!(
            "unexpected group metadata key version {other}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// group metadata topic: values
// ---------------------------------------------------------------------------

/// Encode a group snapshot with the given member assignments.
pub fn group_metadata_value(
    group: &GroupMetadata,
    assignments: &HashMap<String, Bytes>,
    version: i16,
) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_i16(version);
    group.in_lock(|g| {
        put_nullable_string(&mut buf, g.protocol_type.as_deref());
        buf.put_i32(g.generation_id);
        put_nullable_string(&mut buf, g.protocol.as_deref());
        put_nullable_string(&mut buf, g.leader.as_deref());
        buf.put_i32(g.members.len() as i32);
        for member in g.members.values() {
            put_string(&mut buf, &member.member_id);
            put_string(&mut buf, &member.client_id);
            put_string(&mut buf, &member.client_host);
            if version >= 1 {
                buf.put_i32(member.rebalance_timeout_ms);
            }
            buf.put_i32(member.session_timeout_ms);
            put_bytes(&mut buf, &member.subscription);
            let assignment = assignments
                .get(&member.member_id)
                .cloned()
                .unwrap_or_else(|| member.assignment.clone());
            put_bytes(&mut buf, &assignment);
        }
    });
    buf.freeze()
}

/// Decode a group metadata value. `Ok(None)` means the value is a tombstone.
pub fn read_group_message_value(group_id: &str, mut buf: Bytes) -> Result<Option<GroupMetadata>> {
    if buf.is_empty() {
        return Ok(None);
    }
    let version = get_i16(&mut buf)?;
    if !(0..=CURRENT_GROUP_VALUE_SCHEMA_VERSION).contains(&version) {
        return Err(CoordinatorError::CorruptRecord(format!(
            "unreadable group metadata value version {version} for group {group_id}"
        )));
    }

    let protocol_type = get_nullable_string(&mut buf)?;
    let generation_id = get_i32(&mut buf)?;
    let protocol = get_nullable_string(&mut buf)?;
    let leader = get_nullable_string(&mut buf)?;
    let member_count = get_i32(&mut buf)?;
    if member_count < 0 {
        return Err(CoordinatorError::CorruptRecord(format!(
            "negative member count {member_count} for group {group_id}"
        )));
    }

    let mut members = Vec::with_capacity(member_count as usize);
    for _ in 0..member_count {
        let member_id = get_string(&mut buf)?;
        let client_id = get_string(&mut buf)?;
        let client_host = get_string(&mut buf)?;
        let rebalance_timeout_ms = if version >= 1 { get_i32(&mut buf)? } else { -1 };
        let session_timeout_ms = get_i32(&mut buf)?;
        let subscription = get_bytes(&mut buf)?;
        let assignment = get_bytes(&mut buf)?;
        members.push(MemberMetadata {
            member_id,
            client_id,
            client_host,
            rebalance_timeout_ms,
            session_timeout_ms,
            subscription,
            assignment,
        });
    }

    Ok(Some(GroupMetadata::loaded(
        group_id,
        generation_id,
        protocol_type,
        protocol,
        leader,
        members,
    )))
}

/// Encode an offset commit value.
pub fn offset_commit_value(offset: &OffsetAndMetadata) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_i16(CURRENT_OFFSET_VALUE_SCHEMA_VERSION);
    buf.put_i64(offset.offset);
    put_string(&mut buf, &offset.metadata);
    buf.put_i64(offset.commit_timestamp);
    buf.put_i64(offset.expire_timestamp);
    buf.freeze()
}

/// Decode an offset commit value. `Ok(None)` means the value is a tombstone.
pub fn read_offset_message_value(mut buf: Bytes) -> Result<Option<OffsetAndMetadata>> {
    if buf.is_empty() {
        return Ok(None);
    }
    let version = get_i16(&mut buf)?;
    if !(0..=CURRENT_OFFSET_VALUE_SCHEMA_VERSION).contains(&version) {
        return Err(CoordinatorError::CorruptRecord(format!(
            "unreadable offset value version {version}"
        )));
    }
    let offset = get_i64(&mut buf)?;
    let metadata = get_string(&mut buf)?;
    let commit_timestamp = get_i64(&mut buf)?;
    let expire_timestamp = if version >= 1 { get_i64(&mut buf)? } else { -1 };
    Ok(Some(OffsetAndMetadata {
        offset,
        metadata,
        commit_timestamp,
        expire_timestamp,
    }))
}

// ---------------------------------------------------------------------------
// transaction metadata topic
// ---------------------------------------------------------------------------

/// Encode the key indexing a transaction log record.
pub fn transaction_log_key(transactional_id: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + 2 + transactional_id.len());
    buf.put_i16(TRANSACTION_LOG_KEY_SCHEMA_VERSION);
    put_string(&mut buf, transactional_id);
    buf.freeze()
}

/// Decode a transaction log key. An unknown key version is a fatal load
/// error.
pub fn read_transaction_log_key(mut buf: Bytes) -> Result<String> {
    let version = get_i16(&mut buf)?;
    if version != TRANSACTION_LOG_KEY_SCHEMA_VERSION {
        return Err(CoordinatorError::CorruptRecord(format!(
            "unexpected transaction log key version {version}"
        )));
    }
    get_string(&mut buf)
}

/// Encode a staged transaction transition as a log value.
pub fn transaction_log_value(transit: &TxnTransitMetadata) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_i16(TRANSACTION_LOG_VALUE_SCHEMA_VERSION);
    buf.put_i64(transit.producer_id);
    buf.put_i16(transit.producer_epoch);
    buf.put_i32(transit.txn_timeout_ms);
    buf.put_i8(transit.txn_state.byte());

    // partitions grouped by topic
    let mut by_topic: HashMap<&str, Vec<i32>> = HashMap::new();
    for tp in &transit.topic_partitions {
        by_topic.entry(&tp.topic).or_default().push(tp.partition);
    }
    buf.put_i32(by_topic.len() as i32);
    let mut topics: Vec<_> = by_topic.into_iter().collect();
    topics.sort_by(|a, b| a.0.cmp(b.0));
    for (topic, mut partitions) in topics {
        put_string(&mut buf, topic);
        partitions.sort_unstable();
        buf.put_i32(partitions.len() as i32);
        for partition in partitions {
            buf.put_i32(partition);
        }
    }

    buf.put_i64(transit.txn_start_timestamp);
    buf.put_i64(transit.txn_last_update_timestamp);
    buf.freeze()
}

/// Decode a transaction log value into a fresh cache entry. `Ok(None)` means
/// the value is a tombstone.
pub fn read_transaction_log_value(
    transactional_id: &str,
    mut buf: Bytes,
) -> Result<Option<TransactionMetadata>> {
    if buf.is_empty() {
        return Ok(None);
    }
    let version = get_i16(&mut buf)?;
    if version != TRANSACTION_LOG_VALUE_SCHEMA_VERSION {
        return Err(CoordinatorError::CorruptRecord(format!(
            "unreadable transaction log value version {version} for {transactional_id}"
        )));
    }
    let producer_id = get_i64(&mut buf)?;
    let producer_epoch = get_i16(&mut buf)?;
    let txn_timeout_ms = get_i32(&mut buf)?;
    let state_byte = get_i8(&mut buf)?;
    let state = TxnState::from_byte(state_byte).ok_or_else(|| {
        CoordinatorError::CorruptRecord(format!(
            "unknown transaction state byte {state_byte} for {transactional_id}"
        ))
    })?;

    let topic_count = get_i32(&mut buf)?;
    if topic_count < 0 {
        return Err(CoordinatorError::CorruptRecord(format!(
            "negative topic count {topic_count} for {transactional_id}"
        )));
    }
    let mut topic_partitions = HashSet::new();
    for _ in 0..topic_count {
        let topic = get_string(&mut buf)?;
        let partition_count = get_i32(&mut buf)?;
        if partition_count < 0 {
            return Err(CoordinatorError::CorruptRecord(format!(
                "negative partition count {partition_count} for {transactional_id}"
            )));
        }
        for _ in 0..partition_count {
            let partition = get_i32(&mut buf)?;
            topic_partitions.insert(TopicPartition::new(topic.clone(), partition));
        }
    }

    let txn_start_timestamp = get_i64(&mut buf)?;
    let txn_last_update_timestamp = get_i64(&mut buf)?;

    Ok(Some(TransactionMetadata::loaded(
        transactional_id,
        producer_id,
        producer_epoch,
        txn_timeout_ms,
        state,
        topic_partitions,
        txn_start_timestamp,
        txn_last_update_timestamp,
    )))
}

// ---------------------------------------------------------------------------
// wire primitives
// ---------------------------------------------------------------------------

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_i16(s.len() as i16);
    buf.put_slice(s.as_bytes());
}

fn put_nullable_string(buf: &mut BytesMut, s: Option<&str>) {
    match s {
        Some(s) => put_string(buf, s),
        None => buf.put_i16(-1),
    }
}

fn put_bytes(buf: &mut BytesMut, b: &Bytes) {
    buf.put_i32(b.len() as i32);
    buf.put_slice(b);
}

fn get_i8(buf: &mut Bytes) -> Result<i8> {
    ensure(buf, 1)?;
    Ok(buf.get_i8())
}

fn get_i16(buf: &mut Bytes) -> Result<i16> {
    ensure(buf, 2)?;
    Ok(buf.get_i16())
}

fn get_i32(buf: &mut Bytes) -> Result<i32> {
    ensure(buf, 4)?;
    Ok(buf.get_i32())
}

fn get_i64(buf: &mut Bytes) -> Result<i64> {
    ensure(buf, 8)?;
    Ok(buf.get_i64())
}

fn get_string(buf: &mut Bytes) -> Result<String> {
    get_nullable_string(buf)?
        .ok_or_else(|| CoordinatorError::CorruptRecord("unexpected null string".to_string()))
}

fn get_nullable_string(buf: &mut Bytes) -> Result<Option<String>> {
    let len = get_i16(buf)?;
    if len < 0 {
        return Ok(None);
    }
    ensure(buf, len as usize)?;
    let raw = buf.split_to(len as usize);
    String::from_utf8(raw.to_vec())
        .map(Some)
        .map_err(|_| CoordinatorError::CorruptRecord("invalid UTF-8 in string".to_string()))
}

fn get_bytes(buf: &mut Bytes) -> Result<Bytes> {
    let len = get_i32(buf)?;
    if len < 0 {
        return Ok(Bytes::new());
    }
    ensure(buf, len as usize)?;
    Ok(buf.split_to(len as usize))
}

fn ensure(buf: &Bytes, needed: usize) -> Result<()> {
    if buf.remaining() < needed {
        return Err(CoordinatorError::CorruptRecord(format!(
            "record truncated: needed {needed} bytes, {} left",
            buf.remaining()
        )));
    }
    Ok(())
}
