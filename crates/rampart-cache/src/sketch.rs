//! Count-min frequency sketch.
//!
//! Four-bit saturating counters, sixteen to a word, with four hash rows
//! sharing one table. Increments are lock-free compare-and-swap loops. Once
//! the number of successful increments reaches ten times the table width,
//! every counter is halved so that stale popularity fades.

use std::sync::atomic::{AtomicU64, Ordering};

/// Hash rows per key.
const DEPTH: usize = 4;

/// Counter ceiling (4 bits).
const MAX_COUNT: u64 = 15;

/// Clears the bit shifted in from the neighbouring counter when halving.
const RESET_MASK: u64 = 0x7777_7777_7777_7777;

/// Aging period as a multiple of the table width.
const SAMPLE_FACTOR: u64 = 10;

const MIN_WIDTH: usize = 64;
const MAX_WIDTH: usize = 1 << 16;

const SEEDS: [u64; DEPTH] = [
    0xc3a5_c85c_97cb_3127,
    0xb492_b66f_be98_f273,
    0x9ae1_6a3b_2f90_404f,
    0xcbf2_9ce4_8422_2325,
];

/// Approximate access frequency of keys, by hash.
pub struct FrequencySketch {
    table: Box<[AtomicU64]>,
    mask: usize,
    additions: AtomicU64,
    sample_size: u64,
    resets: AtomicU64,
}

impl FrequencySketch {
    /// Create a sketch sized for roughly `expected_entries` distinct keys.
    pub fn with_capacity(expected_entries: usize) -> Self {
        let width = expected_entries
            .clamp(MIN_WIDTH, MAX_WIDTH)
            .next_power_of_two();
        let table = (0..width)
            .map(|_| AtomicU64::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            table,
            mask: width - 1,
            additions: AtomicU64::new(0),
            sample_size: SAMPLE_FACTOR * width as u64,
            resets: AtomicU64::new(0),
        }
    }

    /// Estimated frequency of `hash`, between 0 and 15.
    pub fn frequency(&self, hash: u64) -> u8 {
        let mut min = MAX_COUNT;
        for depth in 0..DEPTH {
            let (index, shift) = self.locate(hash, depth);
            let count = (self.table[index].load(Ordering::Relaxed) >> shift) & 0xF;
            min = min.min(count);
        }
        min as u8
    }

    /// Record one occurrence of `hash`.
    pub fn increment(&self, hash: u64) {
        let mut added = false;
        for depth in 0..DEPTH {
            let (index, shift) = self.locate(hash, depth);
            added |= self.increment_at(index, shift);
        }

        if added {
            let n = self.additions.fetch_add(1, Ordering::Relaxed) + 1;
            if n >= self.sample_size
                && self
                    .additions
                    .compare_exchange(n, n / 2, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            {
                self.halve();
            }
        }
    }

    /// Number of aging passes performed so far.
    pub fn resets(&self) -> u64 {
        self.resets.load(Ordering::Relaxed)
    }

    /// Number of counters per row, rounded to a power of two.
    pub fn width(&self) -> usize {
        self.table.len()
    }

    fn increment_at(&self, index: usize, shift: u32) -> bool {
        let slot = &self.table[index];
        let mut current = slot.load(Ordering::Relaxed);
        loop {
            if (current >> shift) & 0xF == MAX_COUNT {
                return false;
            }
            match slot.compare_exchange_weak(
                current,
                current + (1 << shift),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn halve(&self) {
        for slot in self.table.iter() {
            let _ = slot.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |word| {
                Some((word >> 1) & RESET_MASK)
            });
        }
        self.resets.fetch_add(1, Ordering::Relaxed);
    }

    /// Word index and bit offset of the counter for `hash` in row `depth`.
    fn locate(&self, hash: u64, depth: usize) -> (usize, u32) {
        let h = mix(hash.wrapping_add(SEEDS[depth]).wrapping_mul(SEEDS[depth]));
        let index = (h >> 8) as usize & self.mask;
        let shift = ((h & 0xF) as u32) * 4;
        (index, shift)
    }
}

/// 64-bit finalizer from MurmurHash3.
fn mix(mut x: u64) -> u64 {
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51_afd7_ed55_8ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    x ^ (x >> 33)
}
