//! Fixed-width growable bitset over the node table
//!
//! The three derived node bitmaps (available, idle, shareable), job
//! allocations, and selector accumulation all operate on this type. The
//! contiguous-run search backs the consecutive-placement preference.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

const BLOCK_BITS: usize = 64;

/// Growable bitset with set algebra and contiguous-run search.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bitmap {
    blocks: Vec<u64>,
    len: usize,
}

impl Bitmap {
    /// Create a bitmap of `len` bits, all clear.
    pub fn new(len: usize) -> Self {
        Bitmap {
            blocks: vec![0; len.div_ceil(BLOCK_BITS)],
            len,
        }
    }

    /// Create a bitmap of `len` bits with the given indices set.
    pub fn from_indices(len: usize, indices: &[usize]) -> Self {
        let mut bm = Bitmap::new(len);
        for &i in indices {
            bm.set(i);
        }
        bm
    }

    /// Bit width.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the bitmap has zero width.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Grow to `len` bits; new bits are clear. Shrinking is not supported.
    pub fn resize(&mut self, len: usize) {
        if len > self.len {
            self.blocks.resize(len.div_ceil(BLOCK_BITS), 0);
            self.len = len;
        }
    }

    /// Set bit `idx`.
    pub fn set(&mut self, idx: usize) {
        debug_assert!(idx < self.len);
        self.blocks[idx / BLOCK_BITS] |= 1 << (idx % BLOCK_BITS);
    }

    /// Clear bit `idx`.
    pub fn clear(&mut self, idx: usize) {
        debug_assert!(idx < self.len);
        self.blocks[idx / BLOCK_BITS] &= !(1 << (idx % BLOCK_BITS));
    }

    /// Test bit `idx`.
    pub fn test(&self, idx: usize) -> bool {
        if idx >= self.len {
            return false;
        }
        self.blocks[idx / BLOCK_BITS] & (1 << (idx % BLOCK_BITS)) != 0
    }

    /// Clear every bit.
    pub fn clear_all(&mut self) {
        for b in &mut self.blocks {
            *b = 0;
        }
    }

    /// Set every bit.
    pub fn set_all(&mut self) {
        for b in &mut self.blocks {
            *b = u64::MAX;
        }
        self.mask_tail();
    }

    /// Number of set bits.
    pub fn count(&self) -> usize {
        self.blocks.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Whether no bit is set.
    pub fn is_clear(&self) -> bool {
        self.blocks.iter().all(|&b| b == 0)
    }

    /// Whether any bit is set.
    pub fn any(&self) -> bool {
        !self.is_clear()
    }

    /// Index of the lowest set bit.
    pub fn first_set(&self) -> Option<usize> {
        for (i, &b) in self.blocks.iter().enumerate() {
            if b != 0 {
                return Some(i * BLOCK_BITS + b.trailing_zeros() as usize);
            }
        }
        None
    }

    /// In-place union.
    pub fn or_with(&mut self, other: &Bitmap) {
        debug_assert_eq!(self.len, other.len);
        for (a, b) in self.blocks.iter_mut().zip(&other.blocks) {
            *a |= b;
        }
    }

    /// In-place intersection.
    pub fn and_with(&mut self, other: &Bitmap) {
        debug_assert_eq!(self.len, other.len);
        for (a, b) in self.blocks.iter_mut().zip(&other.blocks) {
            *a &= b;
        }
    }

    /// In-place difference (`self & !other`).
    pub fn and_not(&mut self, other: &Bitmap) {
        debug_assert_eq!(self.len, other.len);
        for (a, b) in self.blocks.iter_mut().zip(&other.blocks) {
            *a &= !b;
        }
    }

    /// New bitmap: union of two.
    pub fn union(a: &Bitmap, b: &Bitmap) -> Bitmap {
        let mut out = a.clone();
        out.or_with(b);
        out
    }

    /// New bitmap: intersection of two.
    pub fn intersection(a: &Bitmap, b: &Bitmap) -> Bitmap {
        let mut out = a.clone();
        out.and_with(b);
        out
    }

    /// Whether every set bit of `self` is also set in `other`.
    pub fn is_subset_of(&self, other: &Bitmap) -> bool {
        debug_assert_eq!(self.len, other.len);
        self.blocks
            .iter()
            .zip(&other.blocks)
            .all(|(a, b)| a & !b == 0)
    }

    /// Whether the two share any set bit.
    pub fn intersects(&self, other: &Bitmap) -> bool {
        debug_assert_eq!(self.len, other.len);
        self.blocks.iter().zip(&other.blocks).any(|(a, b)| a & b != 0)
    }

    /// Iterate indices of set bits in ascending order.
    pub fn iter_ones(&self) -> Ones<'_> {
        Ones {
            bitmap: self,
            next: 0,
        }
    }

    /// Smallest contiguous run of set bits with length >= `want`, preferring
    /// the run leaving the least surplus; ties fall to the lowest index.
    /// Returns the leading `want` indices of the chosen run.
    pub fn best_fit_run(&self, want: usize) -> Option<Range<usize>> {
        if want == 0 {
            return None;
        }
        let mut best: Option<Range<usize>> = None;
        let mut run_start = None;
        for idx in 0..=self.len {
            let bit = idx < self.len && self.test(idx);
            match (bit, run_start) {
                (true, None) => run_start = Some(idx),
                (false, Some(start)) => {
                    let run_len = idx - start;
                    if run_len >= want {
                        let better = match &best {
                            None => true,
                            Some(b) => run_len < b.len(),
                        };
                        if better {
                            best = Some(start..idx);
                        }
                    }
                    run_start = None;
                }
                _ => {}
            }
        }
        best.map(|r| r.start..r.start + want)
    }

    fn mask_tail(&mut self) {
        let tail = self.len % BLOCK_BITS;
        if tail != 0 {
            if let Some(last) = self.blocks.last_mut() {
                *last &= (1u64 << tail) - 1;
            }
        }
    }
}

/// Iterator over set-bit indices.
pub struct Ones<'a> {
    bitmap: &'a Bitmap,
    next: usize,
}

impl Iterator for Ones<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        while self.next < self.bitmap.len {
            let idx = self.next;
            self.next += 1;
            if self.bitmap.test(idx) {
                return Some(idx);
            }
        }
        None
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bitmap[{}:{{", self.len)?;
        for (i, idx) in self.iter_ones().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{idx}")?;
        }
        write!(f, "}}]")
    }
}
