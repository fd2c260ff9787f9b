//! FNV-1a hashing used to place keys on the consistent-hash wheel.
//!
//! Every node must map a key to the same segment, so the hash is a fixed,
//! dependency-free function of the key's UTF-8 bytes.

/// FNV-1a offset basis (32-bit).
const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;

/// FNV-1a prime (32-bit).
const FNV_PRIME: u32 = 0x0100_0193;

/// Computes a 32-bit FNV-1a hash over the UTF-8 bytes of a key.
///
/// # Examples
///
/// ```
/// use gridcache_core::hash::fnv1a_hash;
///
/// assert_eq!(fnv1a_hash("hello"), 1_335_831_723);
/// assert_eq!(fnv1a_hash(""), 2_166_136_261); // FNV offset basis
/// ```
#[must_use]
pub fn fnv1a_hash(key: &str) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in key.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Maps a key to one of `segment_count` hash-wheel segments.
///
/// The raw FNV-1a value is passed through a final avalanche step so that keys
/// differing only in their last character still spread across segments.
///
/// # Panics
///
/// Panics if `segment_count` is zero.
#[must_use]
pub fn segment_of(key: &str, segment_count: u32) -> u32 {
    assert!(segment_count > 0, "segment_count must be positive");
    spread(fnv1a_hash(key)) % segment_count
}

/// Murmur3 32-bit finalizer.
fn spread(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    // ---- Known FNV-1a vectors ----

    #[test]
    fn fnv1a_hash_hello() {
        assert_eq!(fnv1a_hash("hello"), 1_335_831_723);
    }

    #[test]
    fn fnv1a_hash_key1() {
        assert_eq!(fnv1a_hash("key1"), 927_623_783);
    }

    #[test]
    fn fnv1a_hash_empty() {
        assert_eq!(fnv1a_hash(""), 2_166_136_261); // 0x811c9dc5
    }

    #[test]
    fn fnv1a_hash_deterministic() {
        let h1 = fnv1a_hash("consistent-string");
        let h2 = fnv1a_hash("consistent-string");
        assert_eq!(h1, h2);
    }

    #[test]
    fn fnv1a_hash_case_sensitive() {
        assert_ne!(fnv1a_hash("Hello"), fnv1a_hash("hello"));
    }

    #[test]
    fn fnv1a_hash_distribution_1000_unique() {
        let mut set = std::collections::HashSet::new();
        for i in 0..1000 {
            set.insert(fnv1a_hash(&format!("item-{i}")));
        }
        assert_eq!(set.len(), 1000);
    }

    // ---- segment_of ----

    #[test]
    fn segment_in_range() {
        for i in 0..500 {
            assert!(segment_of(&format!("k{i}"), 17) < 17);
        }
    }

    #[test]
    fn single_segment_maps_everything_to_zero() {
        assert_eq!(segment_of("anything", 1), 0);
        assert_eq!(segment_of("", 1), 0);
    }

    #[test]
    fn segments_are_all_used() {
        let mut seen = std::collections::HashSet::new();
        for i in 0..2000 {
            seen.insert(segment_of(&format!("key-{i}"), 16));
        }
        assert_eq!(seen.len(), 16);
    }

    #[test]
    #[should_panic(expected = "segment_count must be positive")]
    fn zero_segments_panics() {
        let _ = segment_of("k", 0);
    }
}
