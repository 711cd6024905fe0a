use xxhash_rust::xxh64::Xxh64;

/// Address sentinel meaning "match any address" in log queries. `short48`
/// always clears the top 16 bits of its output, so this value can never be
/// produced as a real hash.
pub const MATCH_ANY_ADDR: u64 = 1 << 63;

/// Seeded 48-bit content hash used as an in-memory index key.
///
/// Feeds the 8-byte seed into an xxhash64 state, then the key, and clears
/// the top 16 bits of the digest. The seed is fixed at database creation and
/// must never change afterwards; collisions are resolved by the caller
/// re-checking candidates against the full key.
pub fn short48(seed: &[u8; 8], key: &[u8]) -> u64 {
    let mut digest = Xxh64::new(0);
    digest.update(seed);
    digest.update(key);
    (digest.digest() << 16) >> 16
}

/// Packs a block height and an intra-block transaction index into the 56-bit
/// transaction id `(height << 24) | index`.
pub fn id56(height: u32, index: u32) -> u64 {
    ((height as u64) << 24) | index as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: [u8; 8] = [1, 2, 3, 4, 5, 6, 7, 8];

    #[test]
    fn test_short48_fits_48_bits() {
        for key in [&b""[..], b"a", b"block hash", &[0xffu8; 32]] {
            let hash = short48(&SEED, key);
            assert_eq!(hash >> 48, 0, "hash of {key:?} exceeds 48 bits");
        }
    }

    #[test]
    fn test_short48_deterministic() {
        let key = [0x11u8; 32];
        assert_eq!(short48(&SEED, &key), short48(&SEED, &key));
    }

    #[test]
    fn test_short48_seed_sensitivity() {
        let key = [0x11u8; 32];
        let other_seed = [8, 7, 6, 5, 4, 3, 2, 1];
        assert_ne!(short48(&SEED, &key), short48(&other_seed, &key));
    }

    #[test]
    fn test_short48_never_produces_sentinel() {
        // structurally impossible: bit 63 is always cleared
        for i in 0u8..=255 {
            assert_ne!(short48(&SEED, &[i]), MATCH_ANY_ADDR);
        }
    }

    #[test]
    fn test_id56_packing() {
        assert_eq!(id56(0, 0), 0);
        assert_eq!(id56(1, 0), 1 << 24);
        assert_eq!(id56(1, 2), (1 << 24) | 2);
        assert_eq!(id56(u32::MAX, (1 << 24) - 1), (u64::MAX << 8) >> 8);
    }
}
