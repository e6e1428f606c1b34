//! MurmurHash3 (x86, 32-bit)
//!
//! Non-cryptographic, well distributed and stable across platforms and
//! process runs, which is what tenant placement needs. Not suitable for
//! anything adversarial.

use std::io::Cursor;

/// Hash `data` with the given seed
pub fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    // Reading from an in-memory cursor cannot fail
    murmur3::murmur3_32(&mut Cursor::new(data), seed).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_vectors() {
        assert_eq!(murmur3_32(b"", 0), 0);
        assert_eq!(murmur3_32(b"", 1), 0x514e_28b7);
        assert_eq!(murmur3_32(b"", 0xffff_ffff), 0x81f1_6f39);
        assert_eq!(murmur3_32(&[0, 0, 0, 0], 0), 0x2362_f9de);
    }

    #[test]
    fn test_tail_lengths() {
        let seed = 0x9747_b28c;
        assert_eq!(murmur3_32(b"a", seed), 0x7fa0_9ea6);
        assert_eq!(murmur3_32(b"ab", seed), 0x7487_5592);
        assert_eq!(murmur3_32(b"abc", seed), 0xc84a_62dd);
        assert_eq!(murmur3_32(b"abcd", seed), 0xf047_8627);
        assert_eq!(murmur3_32(b"Hello, world!", seed), 0x2488_4cba);
        assert_eq!(
            murmur3_32(b"The quick brown fox jumps over the lazy dog", seed),
            0x2fa8_26cd
        );
    }

    #[test]
    fn test_seed_changes_hash() {
        assert_ne!(murmur3_32(b"tenant-alpha", 0), murmur3_32(b"tenant-alpha", 1));
    }
}
