use crc::{Crc, CRC_32_ISCSI};

/// CRC32C (Castagnoli). Used for key hashes and WAL record checksums.
pub const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Seed for keyed CRC32C hashes.
pub const KEY_HASH_SEED: u32 = 0xDEAD_BEEF;

/// Seeded CRC32C over the key bytes.
pub fn key_hash32(key: &[u8]) -> u32 {
    let mut digest = CRC32C.digest_with_initial(KEY_HASH_SEED);
    digest.update(key);
    digest.finalize()
}

/// Extends a 32-bit key hash to 64 bits: the high word is the bitwise
/// complement of the low word, so a zeroed hash field is never a valid hash.
pub fn hash_extend(hash32: u32) -> u64 {
    ((!hash32 as u64) << 32) | hash32 as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_deterministic() {
        assert_eq!(key_hash32(b"remix"), key_hash32(b"remix"));
        assert_ne!(key_hash32(b"remix"), key_hash32(b"remiy"));
    }

    #[test]
    fn test_hash_empty_key() {
        // A zero-length key is legal and must hash consistently.
        assert_eq!(key_hash32(b""), key_hash32(b""));
    }

    #[test]
    fn test_hash_extend_complement() {
        let h = key_hash32(b"time_travel");
        let ext = hash_extend(h);
        assert_eq!(ext as u32, h);
        assert_eq!((ext >> 32) as u32, !h);
    }
}
