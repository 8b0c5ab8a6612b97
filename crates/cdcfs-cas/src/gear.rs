//! Gear table for the rolling fingerprint.
//!
//! 256 pseudo-random constants derived at compile time with splitmix64 from
//! a fixed seed. Changing the seed changes every chunk boundary, so it is
//! part of the on-disk format.

const GEAR_SEED: u64 = 0x6364_6366_735f_6765;

/// One constant per byte value
pub static GEAR: [u64; 256] = build_table(GEAR_SEED);

const fn splitmix64(state: u64) -> (u64, u64) {
    let state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
    let mut z = state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    (state, z ^ (z >> 31))
}

const fn build_table(seed: u64) -> [u64; 256] {
    let mut table = [0u64; 256];
    let mut state = seed;
    let mut i = 0;
    while i < 256 {
        let (next, value) = splitmix64(state);
        state = next;
        table[i] = value;
        i += 1;
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_table_is_stable() {
        assert_eq!(GEAR, build_table(GEAR_SEED));
        assert_ne!(GEAR, build_table(GEAR_SEED + 1));
    }

    #[test]
    fn test_entries_are_distinct() {
        let unique: HashSet<u64> = GEAR.iter().copied().collect();
        assert_eq!(unique.len(), 256);
        assert!(!GEAR.contains(&0));
    }

    #[test]
    fn test_bits_are_balanced() {
        // Each bit position should be set in roughly half of the entries.
        for bit in 0..64 {
            let ones = GEAR.iter().filter(|v| (*v >> bit) & 1 == 1).count();
            assert!((80..=176).contains(&ones), "bit {} set {} times", bit, ones);
        }
    }
}
