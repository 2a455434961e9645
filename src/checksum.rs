//! Adler-32 checksums and their combination law.
//!
//! The combination of two checksums depends on the length of the *second*
//! byte range, so it is not commutative. Partial checksums from several
//! processes must be folded in ascending rank order.

use crate::error::{ForestError, Result};

const BASE: u64 = 65521;

/// Checksum of an empty byte range.
pub const ADLER32_INIT: u32 = 1;

/// Continue an Adler-32 checksum over `bytes`.
pub fn adler32_update(adler: u32, bytes: &[u8]) -> u32 {
    let mut a = (adler & 0xffff) as u64;
    let mut b = (adler >> 16) as u64;

    // 5552 is the largest block for which b cannot overflow before the modulus.
    for chunk in bytes.chunks(5552) {
        for &byte in chunk {
            a += byte as u64;
            b += a;
        }
        a %= BASE;
        b %= BASE;
    }

    (a | (b << 16)) as u32
}

/// Adler-32 checksum of `bytes`.
pub fn adler32(bytes: &[u8]) -> u32 {
    adler32_update(ADLER32_INIT, bytes)
}

/// Checksum of the concatenation `first ++ second`, given the checksum of each
/// part and the length of `second`.
pub fn adler32_combine(first: u32, second: u32, second_len: u64) -> u32 {
    let rem = second_len % BASE;
    let mut sum1 = (first & 0xffff) as u64;
    let mut sum2 = (rem * sum1) % BASE;

    sum1 += (second & 0xffff) as u64 + BASE - 1;
    sum2 += ((first >> 16) & 0xffff) as u64 + ((second >> 16) & 0xffff) as u64 + BASE - rem;

    if sum1 >= BASE {
        sum1 -= BASE;
    }
    if sum1 >= BASE {
        sum1 -= BASE;
    }
    if sum2 >= BASE << 1 {
        sum2 -= BASE << 1;
    }
    if sum2 >= BASE {
        sum2 -= BASE;
    }

    (sum1 | (sum2 << 16)) as u32
}

/// Fold per-rank checksums, indexed by rank, into the checksum of the
/// concatenated byte ranges. `bytes[p]` is the length of rank `p`'s range.
pub fn combine_in_rank_order(crcs: &[u32], bytes: &[u64]) -> Result<u32> {
    if crcs.len() != bytes.len() {
        return Err(ForestError::precondition(format!(
            "{} checksums but {} byte counts",
            crcs.len(),
            bytes.len()
        )));
    }

    Ok(crcs
        .iter()
        .zip(bytes)
        .skip(1)
        .fold(crcs.first().copied().unwrap_or(ADLER32_INIT), |crc, (&next, &len)| {
            adler32_combine(crc, next, len)
        }))
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;
    use rand::prelude::*;
    use rand::SeedableRng;

    fn bytes_fixture(n: usize, seed: u64) -> Vec<u8> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n).map(|_| rng.gen()).collect()
    }

    #[test]
    fn test_known_values() {
        assert_eq!(adler32(b""), 1);
        assert_eq!(adler32(b"a"), 0x0062_0062);
        assert_eq!(adler32(b"Wikipedia"), 0x11E6_0398);
    }

    #[test]
    fn test_long_input_matches_incremental() {
        let data = bytes_fixture(20000, 0);
        let whole = adler32(&data);
        let (head, tail) = data.split_at(7001);
        assert_eq!(adler32_update(adler32(head), tail), whole);
    }

    #[test]
    fn test_rank_order_matches_concatenation() {
        let parts = vec![
            bytes_fixture(13, 1),
            bytes_fixture(0, 2),
            bytes_fixture(1021, 3),
        ];
        let crcs: Vec<u32> = parts.iter().map(|p| adler32(p)).collect();
        let lens: Vec<u64> = parts.iter().map(|p| p.len() as u64).collect();

        let concatenated: Vec<u8> = parts.concat();

        assert_eq!(combine_in_rank_order(&crcs, &lens), Ok(adler32(&concatenated)));
    }

    #[test]
    fn test_out_of_order_is_different() {
        let parts = vec![
            b"rank zero".to_vec(),
            b"rank one, longer".to_vec(),
            b"two".to_vec(),
        ];
        let crcs: Vec<u32> = parts.iter().map(|p| adler32(p)).collect();
        let lens: Vec<u64> = parts.iter().map(|p| p.len() as u64).collect();

        let in_order = combine_in_rank_order(&crcs, &lens).unwrap();

        // Combining rank 1 before rank 0 describes a different byte stream.
        let swapped = combine_in_rank_order(
            &[crcs[1], crcs[0], crcs[2]],
            &[lens[1], lens[0], lens[2]],
        )
        .unwrap();

        let concatenated: Vec<u8> = parts.concat();
        assert_eq!(in_order, adler32(&concatenated));
        assert_ne!(in_order, swapped);
    }

    #[test]
    fn test_empty_and_single() {
        assert_eq!(combine_in_rank_order(&[], &[]), Ok(ADLER32_INIT));
        assert_eq!(combine_in_rank_order(&[0xdead_beef], &[4]), Ok(0xdead_beef));
    }

    #[test]
    fn test_mismatched_lengths_are_rejected() {
        assert!(combine_in_rank_order(&[1, 2], &[]).is_err());
        assert!(combine_in_rank_order(&[1], &[]).is_err());
        assert!(combine_in_rank_order(&[], &[3]).is_err());
        assert!(combine_in_rank_order(&[1, 2], &[1, 2, 3]).is_err());
    }

    proptest! {
        #[test]
        fn combine_is_concatenation(
            a in proptest::collection::vec(any::<u8>(), 0..300),
            b in proptest::collection::vec(any::<u8>(), 0..300),
        ) {
            let mut ab = a.clone();
            ab.extend_from_slice(&b);
            prop_assert_eq!(adler32_combine(adler32(&a), adler32(&b), b.len() as u64), adler32(&ab));
        }
    }
}
