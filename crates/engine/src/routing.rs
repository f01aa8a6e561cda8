//! Key to shard routing
//!
//! The hash adds up every `ceil(len / 10)`-th byte of the key and keeps the
//! low byte, so at most ten bytes are read whatever the key length. The shard
//! is `hash * shard_number >> 8`. Routing is part of the on-disk contract:
//! a key must land on the same shard every time the store is opened.

/// Routing hash of `key`, one byte wide.
pub fn key_hash(key: &[u8]) -> u8 {
    let step = (key.len() + 9) / 10;
    if step == 0 {
        return 0;
    }
    let sum = key
        .iter()
        .step_by(step)
        .fold(0u32, |sum, &byte| sum.wrapping_add(u32::from(byte)));
    (sum & 0xff) as u8
}

/// Shard owning `key` in a container of `shard_number` shards.
pub fn shard_for_key(key: &[u8], shard_number: u32) -> usize {
    ((u64::from(key_hash(key)) * u64::from(shard_number)) >> 8) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_short_keys_sum_every_byte() {
        assert_eq!(key_hash(b"a"), b'a');
        assert_eq!(key_hash(b"key1"), ((b'k' as u32 + b'e' as u32 + b'y' as u32 + b'1' as u32) & 0xff) as u8);
        assert_eq!(key_hash(b""), 0);
    }

    #[test]
    fn test_long_keys_sample_ten_bytes() {
        // 25 bytes: step 3, bytes 0, 3, ..., 24
        let key: Vec<u8> = (0u8..25).collect();
        let expected: u32 = (0u32..25).step_by(3).sum();
        assert_eq!(u32::from(key_hash(&key)), expected & 0xff);

        // only sampled positions matter
        let mut changed = key.clone();
        changed[1] = 200;
        assert_eq!(key_hash(&key), key_hash(&changed));
    }

    #[test]
    fn test_single_shard_takes_everything() {
        assert_eq!(shard_for_key(b"anything", 1), 0);
        assert_eq!(shard_for_key(&[0xff], 1), 0);
    }

    #[test]
    fn test_scaling() {
        assert_eq!(shard_for_key(&[0x80], 2), 1);
        assert_eq!(shard_for_key(&[0x7f], 2), 0);
        assert_eq!(shard_for_key(&[0xff], 10), 9);
    }

    proptest! {
        #[test]
        fn prop_shard_in_range(key in proptest::collection::vec(any::<u8>(), 0..300), shards in 1u32..=256) {
            prop_assert!(shard_for_key(&key, shards) < shards as usize);
        }

        #[test]
        fn prop_routing_is_deterministic(key in proptest::collection::vec(any::<u8>(), 1..64)) {
            prop_assert_eq!(shard_for_key(&key, 10), shard_for_key(&key.clone(), 10));
        }
    }
}
