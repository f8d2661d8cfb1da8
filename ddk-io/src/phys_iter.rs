//! Scatter-gather iteration over a transaction's physical pages.
//!
//! Hardware wants `(address, length)` descriptors, not virtual buffers.
//! [`PhysIter`] walks a transaction window and yields the largest runs of
//! physically contiguous memory, split so no run exceeds the caller's limit.
//!
//! ```
//! use ddk_io::buffer::{IoBuffer, PAGE_SIZE};
//! use ddk_io::phys_iter::PhysIter;
//! use ddk_io::{Opcode, Transaction};
//!
//! // Pages 0 and 1 are contiguous, page 2 is elsewhere.
//! let buf = IoBuffer::from_pages(vec![0; 3 * PAGE_SIZE], vec![0x10000, 0x11000, 0x40000])?;
//! let txn = Transaction::new(buf, Opcode::Read, 0, 3 * PAGE_SIZE)?;
//!
//! let lens: Vec<usize> = PhysIter::new(&txn).chunks(0).map(|r| r.len).collect();
//! assert_eq!(lens, [2 * PAGE_SIZE, PAGE_SIZE]);
//! # Ok::<(), ddk_io::Error>(())
//! ```

use crate::buffer::{IoBuffer, PAGE_SIZE};
use crate::txn::Transaction;

/// One physically contiguous piece of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContiguousRange {
    pub phys: u64,
    pub len: usize,
}

/// Single-pass, lazy scatter-gather iterator.
///
/// The iterator snapshots the transaction window when it is created; later
/// changes to the transaction do not affect it.
#[derive(Debug, Clone)]
pub struct PhysIter {
    buffer: IoBuffer,
    pos: usize,
    end: usize,
}

impl PhysIter {
    pub fn new(txn: &Transaction) -> Self {
        Self {
            buffer: txn.buffer().clone(),
            pos: txn.offset(),
            end: txn.offset() + txn.length(),
        }
    }

    /// Bytes not yet yielded.
    pub fn remaining(&self) -> usize {
        self.end - self.pos
    }

    /// Next contiguous range of at most `max_chunk` bytes.
    ///
    /// A `max_chunk` of zero means no limit. Returns `None` forever once the
    /// window is exhausted.
    pub fn next(&mut self, max_chunk: usize) -> Option<ContiguousRange> {
        if self.pos >= self.end {
            return None;
        }
        let pages = self.buffer.phys_pages();
        let limit = if max_chunk == 0 {
            self.end - self.pos
        } else {
            max_chunk.min(self.end - self.pos)
        };

        let first = self.pos / PAGE_SIZE;
        let phys = pages[first] + (self.pos % PAGE_SIZE) as u64;
        let mut len = PAGE_SIZE - self.pos % PAGE_SIZE;
        let mut page = first;
        while len < limit
            && page + 1 < pages.len()
            && pages[page + 1] == pages[page] + PAGE_SIZE as u64
        {
            page += 1;
            len += PAGE_SIZE;
        }

        let len = len.min(limit);
        self.pos += len;
        Some(ContiguousRange { phys, len })
    }

    /// Adapt into a standard iterator with a fixed chunk limit.
    pub fn chunks(self, max_chunk: usize) -> Chunks {
        Chunks {
            iter: self,
            max_chunk,
        }
    }
}

/// [`PhysIter`] with a fixed limit, as an [`Iterator`].
#[derive(Debug, Clone)]
pub struct Chunks {
    iter: PhysIter,
    max_chunk: usize,
}

impl Iterator for Chunks {
    type Item = ContiguousRange;

    fn next(&mut self) -> Option<ContiguousRange> {
        self.iter.next(self.max_chunk)
    }
}

impl std::iter::FusedIterator for Chunks {}
