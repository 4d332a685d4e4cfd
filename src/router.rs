//! Stable hash routing from id to metadata partition
//!
//! Any replica must be able to route a group id or transactional id to the
//! metadata partition that owns it, so both hashes are pinned bit-for-bit to
//! the values Kafka clients already observe:
//!
//! - group ids: 32-bit MurmurHash3 of the UTF-8 bytes with the BookKeeper
//!   default seed, folded through a sign-safe modulo;
//! - transactional ids: the JVM `String.hashCode` over UTF-16 code units,
//!   masked to non-negative, modulo the partition count.
//!
//! The mask keeps the `i32::MIN` hash on the boundary non-negative, which a
//! plain `abs` would not.

/// Seed used by the group-id hash. Matches BookKeeper's `Murmur3.DEFAULT_SEED`.
const MURMUR3_SEED: u32 = 104_729;

/// Route a group id to its metadata partition.
pub fn partition_for_group(group_id: &str, num_partitions: i32) -> i32 {
    sign_safe_mod(murmur3_32(group_id.as_bytes(), MURMUR3_SEED), num_partitions)
}

/// Route a transactional id to its metadata partition.
pub fn partition_for_transaction(transactional_id: &str, num_partitions: i32) -> i32 {
    (java_string_hash(transactional_id) & 0x7fff_ffff) % num_partitions
}

/// `value mod divisor`, always in `[0, divisor)` for positive divisors.
fn sign_safe_mod(value: i32, divisor: i32) -> i32 {
    let m = value % divisor;
    if m < 0 {
        m + divisor
    } else {
        m
    }
}

/// MurmurHash3, x86 32-bit variant.
fn murmur3_32(data: &[u8], seed: u32) -> i32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h = seed;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h = (h ^ k).rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k: u32 = 0;
        for (i, b) in tail.iter().enumerate() {
            k ^= (*b as u32) << (8 * i);
        }
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h ^= k;
    }

    h ^= data.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h as i32
}

/// The JVM `String.hashCode`, computed over UTF-16 code units.
fn java_string_hash(s: &str) -> i32 {
    let mut h: i32 = 0;
    for unit in s.encode_utf16() {
        h = h.wrapping_mul(31).wrapping_add(unit as i32);
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    // Pinned values: any change here breaks wire compatibility with clients
    // that already routed these ids.
    #[test]
    fn group_routing_is_pinned() {
        assert_eq!(partition_for_group("orders", 50), 42);
        assert_eq!(partition_for_group("g1", 50), 18);
        assert_eq!(partition_for_group("g2", 50), 19);
        assert_eq!(partition_for_group("payments", 50), 38);
    }

    #[test]
    fn transaction_routing_is_pinned() {
        assert_eq!(partition_for_transaction("orders", 50), 17);
        assert_eq!(partition_for_transaction("t1", 50), 45);
        assert_eq!(partition_for_transaction("t3", 50), 47);
        assert_eq!(partition_for_transaction("payments", 50), 13);
    }

    #[test]
    fn routing_is_deterministic() {
        for id in ["a", "some-group", "ünïcode-id", ""] {
            let first = partition_for_group(id, 50);
            for _ in 0..3 {
                assert_eq!(partition_for_group(id, 50), first);
            }
            assert!((0..50).contains(&first));

            let first = partition_for_transaction(id, 50);
            for _ in 0..3 {
                assert_eq!(partition_for_transaction(id, 50), first);
            }
            assert!((0..50).contains(&first));
        }
    }

    #[test]
    fn java_hash_matches_reference_values() {
        // "orders".hashCode() on the JVM
        assert_eq!(java_string_hash("orders"), -1008770331);
        assert_eq!(java_string_hash(""), 0);
        assert_eq!(java_string_hash("a"), 97);
    }

    #[test]
    fn negative_hash_stays_in_range() {
        // "g2" murmurs to a negative i32; the sign-safe modulo folds it back.
        assert_eq!(murmur3_32("g2".as_bytes(), MURMUR3_SEED), -312104381);
        assert_eq!(sign_safe_mod(-312104381, 50), 19);
        assert_eq!(sign_safe_mod(i32::MIN, 50), (i32::MIN % 50) + 50);
    }
}
