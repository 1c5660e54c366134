//! Per-thread buddy heaps with lock-free cross-thread free.
//!
//! Each thread lazily creates one heap on first allocation. A heap owns a
//! set of pools and a freelist per block order; splitting and coalescing
//! never synchronize because only the owner touches them. Blocks freed by
//! another thread are pushed onto the owner's return queue (a Treiber
//! stack) and folded back into the freelists on the owner's next alloc.
//!
//! On thread exit the heap drains its queue and unmaps pools with no live
//! blocks; pools still hosting live blocks are leaked on purpose — results
//! routinely outlive the worker that produced them, and their eventual
//! frees stay parked on the dead heap's queue.

use std::cell::RefCell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::block::{Header, FREE_TAG, HDR_BYTES};
use crate::error::{Error, Result};
use crate::mem::pool::{
    self, MAX_POOL_BLOCK_ORDER, MIN_ORDER, PAGE_BYTES, POOL_ORDER,
};
use crate::mem::{self, DIRECT_BYTES, DIRECT_COUNT, POOL_COUNT};
use crate::types::Mmod;

/// Hard cap on heaps over the process lifetime; ids are never reused.
const MAX_HEAPS: usize = 512;

struct ReturnQueue {
    head: AtomicPtr<Header>,
}

static RETURN_QUEUES: [ReturnQueue; MAX_HEAPS] =
    [const { ReturnQueue { head: AtomicPtr::new(ptr::null_mut()) } }; MAX_HEAPS];

static NEXT_HEAP_ID: AtomicUsize = AtomicUsize::new(0);

pub(crate) struct ThreadHeap {
    id: u16,
    /// Freelist heads indexed by order; only `MIN_ORDER..=MAX_POOL_BLOCK_ORDER`
    /// are populated.
    free: [*mut Header; POOL_ORDER as usize],
    pools: Vec<*mut u8>,
}

thread_local! {
    static HEAP: RefCell<Option<ThreadHeap>> = const { RefCell::new(None) };
}

/// Smallest order whose block fits a header plus `data_bytes` of payload.
fn order_for(data_bytes: usize) -> Result<u32> {
    let total = HDR_BYTES
        .checked_add(data_bytes)
        .ok_or(Error::OutOfMemory(data_bytes))?;
    let order = total.next_power_of_two().trailing_zeros().max(MIN_ORDER);
    if order > 46 {
        return Err(Error::OutOfMemory(data_bytes));
    }
    Ok(order)
}

/// Allocate a block whose payload can hold `data_bytes`.
///
/// The returned header is zeroed except `rc = 1`, `order` and `mmod`.
pub(crate) fn alloc(data_bytes: usize) -> Result<*mut Header> {
    let order = order_for(data_bytes)?;
    if order > MAX_POOL_BLOCK_ORDER {
        return alloc_direct(order, data_bytes);
    }
    HEAP.with(|cell| {
        let mut slot = cell.borrow_mut();
        if slot.is_none() {
            *slot = Some(ThreadHeap::new()?);
        }
        slot.as_mut().unwrap().alloc_order(order, data_bytes)
    })
}

fn alloc_direct(order: u32, data_bytes: usize) -> Result<*mut Header> {
    let size = 1usize << order;
    let raw = unsafe { pool::map_direct(size) };
    if raw.is_null() {
        return Err(Error::OutOfMemory(data_bytes));
    }
    let hdr = raw as *mut Header;
    unsafe { (*hdr).init(Mmod::Direct, order as u8) };
    DIRECT_COUNT.fetch_add(1, Ordering::Relaxed);
    DIRECT_BYTES.fetch_add(size, Ordering::Relaxed);
    mem::note_alloc(size);
    Ok(hdr)
}

/// Return a heap or direct block to its allocator.
///
/// # Safety
/// `p` must be a live block with `rc == 0` whose children are already
/// released; it must not be touched afterwards.
pub(crate) unsafe fn free(p: *mut Header) {
    match unsafe { (*p).mmod() } {
        Mmod::Direct => unsafe {
            let size = 1usize << (*p).order;
            DIRECT_COUNT.fetch_sub(1, Ordering::Relaxed);
            DIRECT_BYTES.fetch_sub(size, Ordering::Relaxed);
            mem::note_free(size);
            pool::unmap_direct(p as *mut u8, size);
        },
        Mmod::Heap => {
            let owner = unsafe { pool::owner_heap_id(p) };
            HEAP.with(|cell| {
                let mut slot = cell.borrow_mut();
                match slot.as_mut() {
                    Some(h) if h.id == owner => unsafe { h.free_local(p) },
                    // Not ours (or this thread has no heap): park it on the
                    // owner's return queue.
                    _ => unsafe { push_return(owner, p) },
                }
            });
        }
        // Mmap and Static blocks never reach the buddy heap.
        Mmod::Mmap | Mmod::Static => unreachable!("mmap/static blocks are not heap-freed"),
    }
}

unsafe fn push_return(owner: u16, p: *mut Header) {
    let q = &RETURN_QUEUES[owner as usize];
    loop {
        let head = q.head.load(Ordering::Acquire);
        unsafe { (*p).set_free_next(head) };
        if q
            .head
            .compare_exchange_weak(head, p, Ordering::Release, Ordering::Acquire)
            .is_ok()
        {
            return;
        }
    }
}

impl ThreadHeap {
    fn new() -> Result<Self> {
        let id = NEXT_HEAP_ID.fetch_add(1, Ordering::Relaxed);
        if id >= MAX_HEAPS {
            return Err(Error::OutOfMemory(0));
        }
        log::debug!("heap {id} initialized");
        Ok(ThreadHeap {
            id: id as u16,
            free: [ptr::null_mut(); POOL_ORDER as usize],
            pools: Vec::new(),
        })
    }

    fn alloc_order(&mut self, order: u32, data_bytes: usize) -> Result<*mut Header> {
        self.drain_returns();

        // Smallest non-empty freelist at or above the requested order.
        let mut o = order;
        while o <= MAX_POOL_BLOCK_ORDER && self.free[o as usize].is_null() {
            o += 1;
        }
        if o > MAX_POOL_BLOCK_ORDER {
            self.grow(data_bytes)?;
            o = order;
            while o <= MAX_POOL_BLOCK_ORDER && self.free[o as usize].is_null() {
                o += 1;
            }
            if o > MAX_POOL_BLOCK_ORDER {
                return Err(Error::OutOfMemory(data_bytes));
            }
        }

        let blk = self.pop_free(o);
        // Split down to the requested order, pushing upper halves back.
        let mut cur = o;
        while cur > order {
            cur -= 1;
            let buddy = unsafe { (blk as *mut u8).add(1 << cur) } as *mut Header;
            unsafe { self.push_free(buddy, cur) };
        }

        unsafe {
            (*blk).init(Mmod::Heap, order as u8);
            pool::pool_meta(pool::pool_base(blk)).live += 1;
        }
        mem::note_alloc(1 << order);
        Ok(blk)
    }

    /// Map a fresh pool and seed the freelist ladder: one free block per
    /// order from 6 up to 24, at offset `2^o`.
    fn grow(&mut self, data_bytes: usize) -> Result<()> {
        let base = unsafe { pool::map_pool(self.id) };
        if base.is_null() {
            return Err(Error::OutOfMemory(data_bytes));
        }
        for o in 6..=MAX_POOL_BLOCK_ORDER {
            let blk = unsafe { base.add(1 << o) } as *mut Header;
            unsafe { self.push_free(blk, o) };
        }
        self.pools.push(base);
        POOL_COUNT.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    unsafe fn free_local(&mut self, p: *mut Header) {
        let base = pool::pool_base(p) as usize;
        let mut addr = p as usize;
        let mut o = unsafe { (*p).order } as u32;

        unsafe { pool::pool_meta(base as *mut u8).live -= 1 };
        mem::note_free(1 << o);

        // Coalesce while the buddy is free and of the same order. The block
        // at offset 0 holds the pool header and is never free, so probes
        // toward it terminate naturally.
        while o < MAX_POOL_BLOCK_ORDER {
            let offset = addr - base;
            let buddy = (base + (offset ^ (1usize << o))) as *mut Header;
            let buddy_free =
                unsafe { (*buddy).tag == FREE_TAG && (*buddy).order as u32 == o };
            if !buddy_free {
                break;
            }
            self.unlink_free(buddy, o);
            addr = base + (offset & !(1usize << o));
            o += 1;
        }

        let blk = addr as *mut Header;
        unsafe { self.push_free(blk, o) };
        let size = 1usize << o;
        if size > PAGE_BYTES {
            unsafe { pool::release_pages(blk as *mut u8, size) };
        }
    }

    unsafe fn push_free(&mut self, p: *mut Header, order: u32) {
        unsafe {
            (*p).mark_free(order as u8);
            (*p).set_free_prev(ptr::null_mut());
            (*p).set_free_next(self.free[order as usize]);
            let next = self.free[order as usize];
            if !next.is_null() {
                (*next).set_free_prev(p);
            }
        }
        self.free[order as usize] = p;
    }

    fn pop_free(&mut self, order: u32) -> *mut Header {
        let head = self.free[order as usize];
        debug_assert!(!head.is_null());
        unsafe {
            let next = (*head).free_next();
            self.free[order as usize] = next;
            if !next.is_null() {
                (*next).set_free_prev(ptr::null_mut());
            }
        }
        head
    }

    fn unlink_free(&mut self, p: *mut Header, order: u32) {
        unsafe {
            let prev = (*p).free_prev();
            let next = (*p).free_next();
            if prev.is_null() {
                self.free[order as usize] = next;
            } else {
                (*prev).set_free_next(next);
            }
            if !next.is_null() {
                (*next).set_free_prev(prev);
            }
        }
    }

    fn drain_returns(&mut self) {
        let q = &RETURN_QUEUES[self.id as usize];
        let mut p = q.head.swap(ptr::null_mut(), Ordering::Acquire);
        while !p.is_null() {
            let next = unsafe { (*p).free_next() };
            unsafe { self.free_local(p) };
            p = next;
        }
    }
}

impl Drop for ThreadHeap {
    fn drop(&mut self) {
        self.drain_returns();
        for &base in &self.pools {
            let live = unsafe { pool::pool_meta(base).live };
            if live == 0 {
                unsafe { pool::unmap_pool(base) };
                POOL_COUNT.fetch_sub(1, Ordering::Relaxed);
            } else {
                // Live blocks outlive the thread; the pool leaks and later
                // frees park on this heap's (now-unowned) return queue.
                log::debug!("heap {} leaking pool {base:p} with {live} live blocks", self.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_header_is_zeroed_except_bookkeeping() {
        let p = alloc(100).unwrap();
        unsafe {
            assert_eq!((*p).rc.load(Ordering::Relaxed), 1);
            assert_eq!((*p).mmod(), Mmod::Heap);
            assert_eq!((*p).order, 8); // 32 + 100 rounds up to 256
            assert_eq!((*p).tag, 0);
            assert_eq!((*p).attrs, 0);
            assert_eq!((*p).head, [0u8; 16]);
            assert_eq!((*p).val, 0);
            (*p).rc.store(0, Ordering::Relaxed);
            free(p);
        }
    }

    #[test]
    fn same_size_class_reuses_or_coalesces() {
        let a = alloc(40).unwrap();
        let addr = a as usize;
        unsafe {
            (*a).rc.store(0, Ordering::Relaxed);
            free(a);
        }
        let b = alloc(40).unwrap();
        // Either the identical address comes back or a coalesced larger
        // block was re-split at the same spot.
        assert_eq!(b as usize & !(127usize), addr & !(127usize));
        unsafe {
            (*b).rc.store(0, Ordering::Relaxed);
            free(b);
        }
    }

    #[test]
    fn split_then_coalesce_restores_large_order() {
        // Fresh heap for this test thread: the second order-6 alloc splits
        // the order-7 ladder block, and freeing it re-coalesces, so the
        // following order-7 request gets that exact block back.
        let a = alloc(32).unwrap(); // ladder block, no split
        let b = alloc(32).unwrap(); // split from the order-7 ladder slot
        unsafe {
            (*a).rc.store(0, Ordering::Relaxed);
            (*b).rc.store(0, Ordering::Relaxed);
            free(a);
            free(b);
        }
        let big = alloc(96).unwrap(); // order 7
        assert_eq!(big as usize, b as usize);
        unsafe {
            (*big).rc.store(0, Ordering::Relaxed);
            free(big);
        }
    }

    #[test]
    fn cross_thread_free_round_trips() {
        let p = alloc(64).unwrap();
        let addr = p as usize;
        std::thread::spawn(move || {
            let p = addr as *mut Header;
            unsafe {
                (*p).rc.store(0, Ordering::Relaxed);
                free(p);
            }
        })
        .join()
        .unwrap();
        // Draining happens on our next alloc; the block must be reusable.
        let q = alloc(64).unwrap();
        unsafe {
            (*q).rc.store(0, Ordering::Relaxed);
            free(q);
        }
    }

    #[test]
    fn direct_blocks_bypass_pools() {
        let big = alloc(40 << 20).unwrap(); // 40 MiB > largest pool block
        unsafe {
            assert_eq!((*big).mmod(), Mmod::Direct);
            (*big).rc.store(0, Ordering::Relaxed);
            free(big);
        }
    }
}
