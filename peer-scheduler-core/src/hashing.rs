use fnv::FnvHasher;
use std::hash::Hasher;

/// FNV-1a over the UTF-8 bytes of `key`, truncated to 32 bits.
///
/// Must produce the exact same value on every peer for the same key —
/// `target_for_scoring` relies on that to agree cluster-wide without a
/// round trip.
pub fn fnv1a_32(key: &str) -> u32 {
    let mut hasher = FnvHasher::default();
    hasher.write(key.as_bytes());
    hasher.finish() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_across_calls() {
        let a = fnv1a_32("default/web-0");
        let b = fnv1a_32("default/web-0");
        assert_eq!(a, b);
    }

    #[test]
    fn distinguishes_similar_keys() {
        assert_ne!(fnv1a_32("default/web-0"), fnv1a_32("default/web-1"));
    }
}
