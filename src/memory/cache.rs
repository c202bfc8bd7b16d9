use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::Memory;

const CACHE_BITS: u32 = 12;
const CACHE_SIZE: usize = 1 << CACHE_BITS;
const CACHE_MASK: u64 = (CACHE_SIZE as u64) - 1;
/// Reads larger than this go straight to the underlying memory.
const MAX_CACHED_READ: usize = 64;

type Page = Box<[u8; CACHE_SIZE]>;

/// Serves a small read from page-sized cache slots, filling them from
/// `underlying` on a miss. Pages that cannot be read completely are never
/// cached; the read is then forwarded as is.
fn cached_read(
    underlying: &dyn Memory,
    pages: &mut HashMap<u64, Page>,
    addr: u64,
    dst: &mut [u8],
) -> usize {
    let mut total = 0;
    while total < dst.len() {
        let Some(cur) = addr.checked_add(total as u64) else {
            break;
        };
        let page_addr = cur & !CACHE_MASK;
        let page = match pages.get(&page_addr) {
            Some(page) => page,
            None => {
                let mut page: Page = Box::new([0; CACHE_SIZE]);
                if underlying.read_fully(page_addr, &mut page[..]).is_err() {
                    return total + underlying.read(cur, &mut dst[total..]);
                }
                pages.entry(page_addr).or_insert(page)
            }
        };
        let in_page = (cur & CACHE_MASK) as usize;
        let n = (dst.len() - total).min(CACHE_SIZE - in_page);
        dst[total..total + n].copy_from_slice(&page[in_page..in_page + n]);
        total += n;
    }
    total
}

/// A page cache shared by all threads, guarded by a mutex.
pub struct MemoryCache {
    underlying: Arc<dyn Memory>,
    pages: Mutex<HashMap<u64, Page>>,
}

impl MemoryCache {
    pub fn new(underlying: Arc<dyn Memory>) -> Self {
        Self {
            underlying,
            pages: Mutex::new(HashMap::new()),
        }
    }
}

impl Memory for MemoryCache {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        if dst.len() > MAX_CACHED_READ {
            return self.underlying.read(addr, dst);
        }
        let mut pages = self.pages.lock();
        cached_read(&*self.underlying, &mut pages, addr, dst)
    }

    fn clear(&self) {
        self.pages.lock().clear();
    }

    fn uncached(&self) -> Option<Arc<dyn Memory>> {
        Some(self.underlying.clone())
    }
}

static NEXT_THREAD_CACHE_ID: AtomicUsize = AtomicUsize::new(0);

struct ThreadSlot {
    generation: u64,
    pages: HashMap<u64, Page>,
}

thread_local! {
    /// One slot per live `MemoryThreadCache` instance touched by this thread.
    /// Freed when the thread exits.
    static THREAD_PAGES: RefCell<HashMap<usize, ThreadSlot>> = RefCell::new(HashMap::new());
}

/// A page cache with one private page set per thread, so readers on
/// different threads never contend.
///
/// [`Memory::clear`] bumps a generation counter. Every thread's slot is then
/// discarded on its next read.
pub struct MemoryThreadCache {
    underlying: Arc<dyn Memory>,
    id: usize,
    generation: AtomicU64,
}

impl MemoryThreadCache {
    pub fn new(underlying: Arc<dyn Memory>) -> Self {
        Self {
            underlying,
            id: NEXT_THREAD_CACHE_ID.fetch_add(1, Ordering::Relaxed),
            generation: AtomicU64::new(0),
        }
    }
}

impl Memory for MemoryThreadCache {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        if dst.len() > MAX_CACHED_READ {
            return self.underlying.read(addr, dst);
        }
        let generation = self.generation.load(Ordering::Acquire);
        let cached = THREAD_PAGES.try_with(|slots| {
            let Ok(mut slots) = slots.try_borrow_mut() else {
                return None;
            };
            let slot = slots.entry(self.id).or_insert_with(|| ThreadSlot {
                generation,
                pages: HashMap::new(),
            });
            if slot.generation != generation {
                slot.generation = generation;
                slot.pages.clear();
            }
            Some(cached_read(&*self.underlying, &mut slot.pages, addr, dst))
        });
        match cached {
            Ok(Some(n)) => n,
            // Thread-local storage is gone (thread teardown) or re-entered.
            _ => self.underlying.read(addr, dst),
        }
    }

    fn clear(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    fn uncached(&self) -> Option<Arc<dyn Memory>> {
        Some(self.underlying.clone())
    }
}

impl Drop for MemoryThreadCache {
    fn drop(&mut self) {
        let id = self.id;
        let _ = THREAD_PAGES.try_with(|slots| {
            if let Ok(mut slots) = slots.try_borrow_mut() {
                slots.remove(&id);
            }
        });
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::memory::MemorySnapshot;

    struct CountingMemory {
        inner: MemorySnapshot,
        reads: AtomicUsize,
    }

    impl Memory for CountingMemory {
        fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
            self.reads.fetch_add(1, Ordering::Relaxed);
            self.inner.read(addr, dst)
        }
    }

    fn counting() -> Arc<CountingMemory> {
        let inner = MemorySnapshot::new();
        inner.set_memory_block(0x1000, 0x2000, 0x11);
        Arc::new(CountingMemory {
            inner,
            reads: AtomicUsize::new(0),
        })
    }

    #[test]
    fn small_reads_hit_the_cache() {
        let underlying = counting();
        let cache = MemoryCache::new(underlying.clone());
        assert_eq!(cache.read_u32(0x1100), Ok(0x1111_1111));
        assert_eq!(cache.read_u32(0x1200), Ok(0x1111_1111));
        assert_eq!(underlying.reads.load(Ordering::Relaxed), 1);

        // Crosses into the second page.
        assert_eq!(cache.read_u64(0x1ffc), Ok(0x1111_1111_1111_1111));
        assert_eq!(underlying.reads.load(Ordering::Relaxed), 2);

        // Large reads bypass.
        let mut big = [0u8; 128];
        assert_eq!(cache.read(0x1000, &mut big), 128);
        assert_eq!(underlying.reads.load(Ordering::Relaxed), 3);

        underlying.inner.set_memory(0x1100, &[0x22; 4]);
        assert_eq!(cache.read_u32(0x1100), Ok(0x1111_1111));
        cache.clear();
        assert_eq!(cache.read_u32(0x1100), Ok(0x2222_2222));
    }

    #[test]
    fn partial_pages_are_not_cached() {
        let underlying = counting();
        underlying.inner.set_memory(0x3000, &[0x33; 8]);
        let cache = MemoryCache::new(underlying.clone());
        assert_eq!(cache.read_u32(0x3000), Ok(0x3333_3333));
        assert_eq!(cache.read_u32(0x3000), Ok(0x3333_3333));
        // Each read tried the page, failed, then read directly.
        assert_eq!(underlying.reads.load(Ordering::Relaxed), 4);
        assert!(cache.read_u32(0x3006).is_err());
    }

    #[test]
    fn thread_cache_is_per_thread_and_clearable() {
        let underlying = counting();
        let cache = Arc::new(MemoryThreadCache::new(underlying.clone()));
        assert_eq!(cache.read_u32(0x1100), Ok(0x1111_1111));
        assert_eq!(cache.read_u32(0x1104), Ok(0x1111_1111));
        assert_eq!(underlying.reads.load(Ordering::Relaxed), 1);

        let other = cache.clone();
        std::thread::spawn(move || {
            assert_eq!(other.read_u32(0x1100), Ok(0x1111_1111));
        })
        .join()
        .unwrap();
        assert_eq!(underlying.reads.load(Ordering::Relaxed), 2);

        underlying.inner.set_memory(0x1100, &[0x44; 4]);
        assert_eq!(cache.read_u32(0x1100), Ok(0x1111_1111));
        cache.clear();
        assert_eq!(cache.read_u32(0x1100), Ok(0x4444_4444));
        assert!(cache.uncached().is_some());
    }
}
