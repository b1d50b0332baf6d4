//! Pooled frame buffers
//!
//! Every backend channel reads and writes packets through two `BytesMut`
//! buffers. Those buffers come from one shared [`BufferPool`] owned by the I/O
//! runtime and go back to it when the channel closes, so channel churn under
//! sustained load does not turn into allocation churn.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                     BufferPool                       │
//! │  ┌──────────┐  ┌──────────┐  ┌──────────┐  ┌───────┐ │
//! │  │  Small   │  │  Medium  │  │  Large   │  │ Huge  │ │
//! │  │  16 KB   │  │  256 KB  │  │  4 MB    │  │ alloc │ │
//! │  └──────────┘  └──────────┘  └──────────┘  └───────┘ │
//! │        bounded free lists (crossbeam channels)       │
//! └──────────────────────────────────────────────────────┘
//! ```

use bytes::BytesMut;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

// ============================================================================
// Size classes
// ============================================================================

/// Buffer size classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    /// Default channel buffers, fits most OK/ERR packets and small rows
    Small,
    /// Wide rows and column definitions of large result sets
    Medium,
    /// Multi-megabyte payloads
    Large,
    /// Beyond the largest class; never pooled
    Huge,
}

impl SizeClass {
    /// Buffer size for this class
    pub const fn size(&self) -> usize {
        match self {
            Self::Small => 16 * 1024,
            Self::Medium => 256 * 1024,
            Self::Large => 4 * 1024 * 1024,
            Self::Huge => 0,
        }
    }

    /// Smallest class that can hold `size` bytes
    pub fn for_size(size: usize) -> Self {
        if size <= Self::Small.size() {
            Self::Small
        } else if size <= Self::Medium.size() {
            Self::Medium
        } else if size <= Self::Large.size() {
            Self::Large
        } else {
            Self::Huge
        }
    }

    /// Largest class a buffer of `capacity` bytes can serve, if any
    fn for_capacity(capacity: usize) -> Option<Self> {
        if capacity > Self::Large.size() * 2 {
            None
        } else if capacity >= Self::Large.size() {
            Some(Self::Large)
        } else if capacity >= Self::Medium.size() {
            Some(Self::Medium)
        } else if capacity >= Self::Small.size() {
            Some(Self::Small)
        } else {
            None
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Buffer pool statistics
#[derive(Debug, Default)]
pub struct BufferPoolStats {
    /// Buffers handed out
    pub allocations: AtomicU64,
    /// Buffers handed back
    pub deallocations: AtomicU64,
    /// Allocations served from a free list
    pub pool_hits: AtomicU64,
    /// Allocations that needed fresh memory
    pub pool_misses: AtomicU64,
    /// Returned buffers dropped (free list full, shrunk or oversized)
    pub discarded: AtomicU64,
    /// Bytes currently handed out
    pub bytes_outstanding: AtomicUsize,
    /// Peak of `bytes_outstanding`
    pub peak_bytes: AtomicUsize,
}

impl BufferPoolStats {
    /// Fraction of allocations served from a free list
    pub fn hit_rate(&self) -> f64 {
        let allocs = self.allocations.load(Ordering::Relaxed);
        if allocs == 0 {
            return 1.0;
        }
        self.pool_hits.load(Ordering::Relaxed) as f64 / allocs as f64
    }
}

// ============================================================================
// Pool
// ============================================================================

/// Size-class segregated pool of `BytesMut` buffers
pub struct BufferPool {
    small: (Sender<BytesMut>, Receiver<BytesMut>),
    medium: (Sender<BytesMut>, Receiver<BytesMut>),
    large: (Sender<BytesMut>, Receiver<BytesMut>),
    stats: BufferPoolStats,
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("small_free", &self.small.1.len())
            .field("medium_free", &self.medium.1.len())
            .field("large_free", &self.large.1.len())
            .finish()
    }
}

impl BufferPool {
    /// Create a pool retaining at most `per_class` free buffers per class.
    /// Large buffers are retained at a quarter of that.
    pub fn new(per_class: usize) -> Self {
        let per_class = per_class.max(1);
        Self {
            small: bounded(per_class),
            medium: bounded(per_class),
            large: bounded((per_class / 4).max(1)),
            stats: BufferPoolStats::default(),
        }
    }

    fn free_list(&self, class: SizeClass) -> Option<&(Sender<BytesMut>, Receiver<BytesMut>)> {
        match class {
            SizeClass::Small => Some(&self.small),
            SizeClass::Medium => Some(&self.medium),
            SizeClass::Large => Some(&self.large),
            SizeClass::Huge => None,
        }
    }

    /// Allocate an empty buffer with capacity for at least `size` bytes
    pub fn allocate(&self, size: usize) -> BytesMut {
        self.stats.allocations.fetch_add(1, Ordering::Relaxed);
        let class = SizeClass::for_size(size);

        let buf = match self.free_list(class).map(|(_, rx)| rx.try_recv()) {
            Some(Ok(mut buf)) => {
                self.stats.pool_hits.fetch_add(1, Ordering::Relaxed);
                buf.clear();
                buf
            }
            Some(Err(_)) => {
                self.stats.pool_misses.fetch_add(1, Ordering::Relaxed);
                BytesMut::with_capacity(class.size())
            }
            None => {
                self.stats.pool_misses.fetch_add(1, Ordering::Relaxed);
                BytesMut::with_capacity(size)
            }
        };
        self.track(buf.capacity() as isize);
        buf
    }

    /// Return a buffer; it is dropped if its free list is full
    pub fn deallocate(&self, mut buf: BytesMut) {
        self.stats.deallocations.fetch_add(1, Ordering::Relaxed);
        self.track(-(buf.capacity() as isize));

        buf.clear();
        let returned = SizeClass::for_capacity(buf.capacity())
            .and_then(|class| self.free_list(class))
            .map(|(tx, _)| tx.try_send(buf).is_ok())
            .unwrap_or(false);
        if !returned {
            self.stats.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Pool statistics
    pub fn stats(&self) -> &BufferPoolStats {
        &self.stats
    }

    /// Free buffers currently retained across all classes
    pub fn free_buffers(&self) -> usize {
        self.small.1.len() + self.medium.1.len() + self.large.1.len()
    }

    fn track(&self, delta: isize) {
        let stats = &self.stats;
        if delta >= 0 {
            let new = stats
                .bytes_outstanding
                .fetch_add(delta as usize, Ordering::Relaxed)
                + delta as usize;
            let mut peak = stats.peak_bytes.load(Ordering::Relaxed);
            while new > peak {
                match stats.peak_bytes.compare_exchange_weak(
                    peak,
                    new,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(current) => peak = current,
                }
            }
        } else {
            let sub = delta.unsigned_abs();
            let _ = stats
                .bytes_outstanding
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                    Some(v.saturating_sub(sub))
                });
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(256)
    }
}
