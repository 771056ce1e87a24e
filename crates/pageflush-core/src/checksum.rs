//! Page checksum
//!
//! The page is read as little-endian 32-bit words and dealt round-robin into
//! `N_SUMS` independent streams, so the inner loop has no dependency between
//! neighbouring words and the compiler can keep every accumulator in a
//! register (or vectorize the row).
//!
//! ```text
//! row 0:  w0  w1  w2 ... w31      each column feeds one accumulator
//! row 1:  w32 w33 w34 ... w63
//! ...
//! ```
//!
//! Every mixing step is a bijection of the accumulator for a fixed input
//! word, so changing any single word always changes the 32-bit folded value.
//! Only the final reduction to 16 bits can collide.

use crate::page::CHECKSUM_OFFSET;
use crate::types::BlockNumber;

/// Number of parallel accumulators.
pub const N_SUMS: usize = 32;

/// Bytes consumed per row (one word per accumulator).
pub const CHECKSUM_STRIDE: usize = N_SUMS * 4;

/// Odd multiplier for the mixing step (32-bit FNV prime).
const MIX_PRIME: u32 = 0x0100_0193;

/// Per-stream seeds, derived at compile time from a splitmix64 sequence.
const SEEDS: [u32; N_SUMS] = derive_seeds();

const fn derive_seeds() -> [u32; N_SUMS] {
    let mut seeds = [0u32; N_SUMS];
    let mut state: u64 = 0x5041_4745_464C_5553; // "PAGEFLUS"
    let mut i = 0;
    while i < N_SUMS {
        state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^= z >> 31;
        seeds[i] = (z >> 32) as u32;
        i += 1;
    }
    seeds
}

#[inline(always)]
fn mix(acc: u32, word: u32) -> u32 {
    let x = (acc ^ word).wrapping_mul(MIX_PRIME);
    (x ^ (x >> 17)).rotate_left(11)
}

#[inline(always)]
fn absorb_row(sums: &mut [u32; N_SUMS], row: &[u8]) {
    for (i, sum) in sums.iter_mut().enumerate() {
        let at = i * 4;
        let word = u32::from_le_bytes([row[at], row[at + 1], row[at + 2], row[at + 3]]);
        *sum = mix(*sum, word);
    }
}

/// Folded 32-bit page hash with the checksum field read as zero.
///
/// A trailing partial row is zero-padded.
pub(crate) fn page_hash32(page: &[u8]) -> u32 {
    let mut sums = SEEDS;

    // The checksum field lives in the first row. Work on a copy of that row
    // with the field cleared so the page itself is never touched.
    let mut first = [0u8; CHECKSUM_STRIDE];
    let head_len = page.len().min(CHECKSUM_STRIDE);
    first[..head_len].copy_from_slice(&page[..head_len]);
    first[CHECKSUM_OFFSET] = 0;
    first[CHECKSUM_OFFSET + 1] = 0;
    absorb_row(&mut sums, &first);

    if page.len() > CHECKSUM_STRIDE {
        let rest = &page[CHECKSUM_STRIDE..];
        let mut rows = rest.chunks_exact(CHECKSUM_STRIDE);
        for row in &mut rows {
            absorb_row(&mut sums, row);
        }
        let tail = rows.remainder();
        if !tail.is_empty() {
            let mut padded = [0u8; CHECKSUM_STRIDE];
            padded[..tail.len()].copy_from_slice(tail);
            absorb_row(&mut sums, &padded);
        }
    }

    // Avalanche: two zero-input rounds on every accumulator
    let mut folded = 0u32;
    for sum in sums.iter_mut() {
        *sum = mix(*sum, 0);
        *sum = mix(*sum, 0);
        folded ^= *sum;
    }
    folded
}

/// Compute the 16-bit checksum of a page stored at `block`.
///
/// Deterministic and pure. The result is always in `[1, 65535]`; 0 means
/// "no checksum" in a page header and is never produced. The block number is
/// mixed in so a page copied to the wrong location fails verification.
pub fn compute_page_checksum(page: &[u8], block: BlockNumber) -> u16 {
    let hash = page_hash32(page) ^ block.0;
    ((hash % 65535) + 1) as u16
}
