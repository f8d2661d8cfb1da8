//! Shared I/O buffers backed by pinned physical pages.
//!
//! Every transaction references an [`IoBuffer`]. Cloning an `IoBuffer` (or a
//! transaction) shares the same bytes: a write through one handle is visible
//! through all of them, and the memory is released when the last handle
//! drops.
//!
//! Physical addresses come from the host environment through the [`PhysMap`]
//! capability. The core never computes them itself; it only hands the page
//! list to scatter-gather iteration.
//!
//! # Example
//!
//! ```
//! use ddk_io::IoBuffer;
//!
//! let buf = IoBuffer::alloc(8192)?;
//! let alias = buf.clone();
//! buf.write(0, b"hello");
//!
//! let mut out = [0u8; 5];
//! alias.read(0, &mut out);
//! assert_eq!(&out, b"hello");
//! # Ok::<(), ddk_io::Error>(())
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::lock;

/// Page granularity of physical mappings.
pub const PAGE_SIZE: usize = 4096;

/// Host capability that pins memory and reports its physical pages.
pub trait PhysMap: Send + Sync {
    /// Return the physical address of each page backing a buffer of `len`
    /// bytes, in buffer order. Addresses are page-aligned.
    fn pin(&self, len: usize) -> Result<Vec<u64>>;
}

/// Simulated physical memory for hosts without a real mapping service.
///
/// Pages are handed out in runs of `run_pages` physically contiguous pages,
/// with a one-page hole between runs and between allocations.
#[derive(Debug)]
pub struct SimPhysMap {
    next: AtomicU64,
    run_pages: usize,
}

impl SimPhysMap {
    pub const fn new(base: u64, run_pages: usize) -> Self {
        Self {
            next: AtomicU64::new(base),
            run_pages: if run_pages == 0 { 1 } else { run_pages },
        }
    }

    /// Every allocation is one physically contiguous run.
    pub const fn contiguous(base: u64) -> Self {
        Self::new(base, usize::MAX)
    }
}

impl PhysMap for SimPhysMap {
    fn pin(&self, len: usize) -> Result<Vec<u64>> {
        let pages = len.div_ceil(PAGE_SIZE);
        let holes = pages.saturating_sub(1) / self.run_pages;
        let span = (pages + holes + 1) as u64 * PAGE_SIZE as u64;
        let mut addr = self.next.fetch_add(span, Ordering::Relaxed);

        let mut out = Vec::with_capacity(pages);
        for i in 0..pages {
            if i > 0 && i % self.run_pages == 0 {
                addr += PAGE_SIZE as u64;
            }
            out.push(addr);
            addr += PAGE_SIZE as u64;
        }
        Ok(out)
    }
}

static DEFAULT_PHYS: SimPhysMap = SimPhysMap::new(0x1_0000_0000, 4);

struct BufInner {
    data: Mutex<Box<[u8]>>,
    len: usize,
    phys: Vec<u64>,
}

/// A pinned, shareable I/O buffer.
///
/// `IoBuffer` is `Send + Sync`; the bytes are protected by an internal lock,
/// so concurrent layers may read and write disjoint windows.
#[derive(Clone)]
pub struct IoBuffer {
    inner: Arc<BufInner>,
}

impl IoBuffer {
    /// Allocate a zeroed buffer pinned through the default simulated
    /// physical map.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `size` is zero.
    pub fn alloc(size: usize) -> Result<Self> {
        Self::alloc_with(size, &DEFAULT_PHYS)
    }

    /// Allocate a zeroed buffer pinned through `phys`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `size` is zero or the map
    /// returns the wrong number of pages, and propagates errors from the map.
    pub fn alloc_with(size: usize, phys: &dyn PhysMap) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidArgument("size must be > 0".to_string()));
        }
        let pages = phys.pin(size)?;
        Self::from_pages(vec![0; size], pages)
    }

    /// Wrap existing bytes with an explicit physical page list.
    pub fn from_pages(data: Vec<u8>, phys: Vec<u64>) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::InvalidArgument("size must be > 0".to_string()));
        }
        if phys.len() != data.len().div_ceil(PAGE_SIZE) {
            return Err(Error::InvalidArgument(format!(
                "{} bytes need {} pages, got {}",
                data.len(),
                data.len().div_ceil(PAGE_SIZE),
                phys.len()
            )));
        }
        if phys.iter().any(|p| p % PAGE_SIZE as u64 != 0) {
            return Err(Error::InvalidArgument(
                "physical pages must be page-aligned".to_string(),
            ));
        }
        Ok(Self {
            inner: Arc::new(BufInner {
                len: data.len(),
                data: Mutex::new(data.into_boxed_slice()),
                phys,
            }),
        })
    }

    /// Get the buffer length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len
    }

    /// Zero-length buffers cannot be created.
    #[inline]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Physical address of each backing page.
    pub fn phys_pages(&self) -> &[u64] {
        &self.inner.phys
    }

    /// Physical address of the byte at `offset`.
    pub fn phys_addr(&self, offset: usize) -> Option<u64> {
        let page = self.inner.phys.get(offset / PAGE_SIZE)?;
        Some(page + (offset % PAGE_SIZE) as u64)
    }

    /// Copy bytes out of the buffer starting at `offset`.
    ///
    /// Returns the number of bytes copied, which is short when `out` runs past
    /// the end of the buffer.
    pub fn read(&self, offset: usize, out: &mut [u8]) -> usize {
        let data = lock(&self.inner.data);
        let Some(src) = data.get(offset..) else {
            return 0;
        };
        let n = src.len().min(out.len());
        out[..n].copy_from_slice(&src[..n]);
        n
    }

    /// Copy bytes into the buffer starting at `offset`.
    ///
    /// Returns the number of bytes copied.
    pub fn write(&self, offset: usize, src: &[u8]) -> usize {
        let mut data = lock(&self.inner.data);
        let Some(dst) = data.get_mut(offset..) else {
            return 0;
        };
        let n = dst.len().min(src.len());
        dst[..n].copy_from_slice(&src[..n]);
        n
    }

    /// Run `f` over the whole buffer.
    pub fn with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&lock(&self.inner.data))
    }

    /// Run `f` over the whole buffer, mutably.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut lock(&self.inner.data))
    }

    /// Whether two handles refer to the same memory.
    pub fn same_memory(&self, other: &IoBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Number of live handles (transactions, clones, and issuer copies).
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl std::fmt::Debug for IoBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoBuffer")
            .field("len", &self.len())
            .field("pages", &self.inner.phys.len())
            .finish()
    }
}
