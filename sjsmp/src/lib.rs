//! Pointer stack maps for JITted frames.
//!
//! A [StackMap] is a bitmap with one bit per pointer-width word of some region of a frame: bit
//! *n* is set iff the word at `n * word_size` bytes from the start of the region may hold a live
//! pointer at a safe point. Stack maps are built once, at compile time, with a
//! [StackMapBuilder] and are immutable thereafter: a collector may read them concurrently with
//! any number of threads running the code they describe.
//!
//! The loader receives stack maps in the compact form produced by [StackMap::to_bytes]:
//!
//! ```text
//! u32 (little endian) number of words
//! ceil(n / 8) bytes   bitmap, least significant bit first
//! ```

use std::fmt;
use thiserror::Error;
use vob::Vob;

/// The size of a pointer-width word in bytes. Only 64-bit targets are supported.
pub const WORD_SIZE: u32 = 8;

#[derive(Debug, Error, PartialEq)]
pub enum StackMapError {
    #[error("stackmap data truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("stackmap offset {0} is not word aligned")]
    Unaligned(u32),
}

/// An immutable pointer bitmap.
#[derive(Clone, PartialEq, Eq)]
pub struct StackMap {
    bits: Vob,
}

impl StackMap {
    /// Build a stack map spanning `nwords` words with a bit set for each byte offset in
    /// `offs`. Offsets must be word aligned and lie inside the region.
    ///
    /// # Panics
    ///
    /// If an offset lies outside `nwords` words.
    pub fn from_offsets(nwords: usize, offs: &[u32]) -> Result<Self, StackMapError> {
        let mut bits = Vob::from_elem(false, nwords);
        for off in offs {
            if off % WORD_SIZE != 0 {
                return Err(StackMapError::Unaligned(*off));
            }
            let idx = usize::try_from(off / WORD_SIZE).unwrap();
            assert!(idx < nwords, "offset {off} outside of a {nwords} word stackmap");
            bits.set(idx, true);
        }
        Ok(Self { bits })
    }

    /// How many words does this map cover?
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// May the word at index `idx` hold a pointer? Words beyond the end of the map never do.
    pub fn is_ptr(&self, idx: usize) -> bool {
        self.bits.get(idx).unwrap_or(false)
    }

    /// Iterate over the indexes of words which may hold pointers, in ascending order.
    pub fn iter_ptrs(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter_set_bits(..)
    }

    /// Return the byte offsets of words which may hold pointers, in ascending order.
    pub fn ptr_offsets(&self) -> Vec<u32> {
        self.iter_ptrs()
            .map(|idx| u32::try_from(idx).unwrap() * WORD_SIZE)
            .collect()
    }

    /// Encode this map in the loader's format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let n = self.bits.len();
        let mut out = Vec::with_capacity(4 + n.div_ceil(8));
        out.extend_from_slice(&u32::try_from(n).unwrap().to_le_bytes());
        out.resize(4 + n.div_ceil(8), 0);
        for idx in self.iter_ptrs() {
            out[4 + idx / 8] |= 1 << (idx % 8);
        }
        out
    }

    /// Decode a map in the loader's format. Trailing bytes are ignored.
    pub fn from_bytes(data: &[u8]) -> Result<Self, StackMapError> {
        if data.len() < 4 {
            return Err(StackMapError::Truncated {
                need: 4,
                have: data.len(),
            });
        }
        let n = usize::try_from(u32::from_le_bytes([data[0], data[1], data[2], data[3]])).unwrap();
        let need = 4 + n.div_ceil(8);
        if data.len() < need {
            return Err(StackMapError::Truncated {
                need,
                have: data.len(),
            });
        }
        let mut bits = Vob::from_elem(false, n);
        for idx in 0..n {
            if data[4 + idx / 8] & (1 << (idx % 8)) != 0 {
                bits.set(idx, true);
            }
        }
        Ok(Self { bits })
    }
}

impl fmt::Debug for StackMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StackMap(")?;
        for b in self.bits.iter() {
            write!(f, "{}", if b { '1' } else { '0' })?;
        }
        write!(f, ")")
    }
}

/// Incrementally build a [StackMap], one word at a time.
#[derive(Debug)]
pub struct StackMapBuilder {
    bits: Vob,
}

impl StackMapBuilder {
    pub fn new() -> Self {
        Self { bits: Vob::new() }
    }

    /// Append one word.
    pub fn add_field(&mut self, is_ptr: bool) {
        self.bits.push(is_ptr);
    }

    /// Append `n` words, all with the same pointer-ness.
    pub fn add_fields(&mut self, n: usize, is_ptr: bool) {
        for _ in 0..n {
            self.bits.push(is_ptr);
        }
    }

    /// Mark the already-added word at byte offset `off` as a pointer, growing the map with
    /// non-pointer words if necessary.
    pub fn set_ptr_at(&mut self, off: u32) -> Result<(), StackMapError> {
        if off % WORD_SIZE != 0 {
            return Err(StackMapError::Unaligned(off));
        }
        let idx = usize::try_from(off / WORD_SIZE).unwrap();
        if idx >= self.bits.len() {
            self.add_fields(idx + 1 - self.bits.len(), false);
        }
        self.bits.set(idx, true);
        Ok(())
    }

    /// How many words have been added so far?
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn build(self) -> StackMap {
        StackMap { bits: self.bits }
    }
}

impl Default for StackMapBuilder {
    fn default() -> Self {
        Self::new()
    }
}
