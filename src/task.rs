//! The worker pool: persistent threads, an SPMC task ring, and cooperative
//! cancellation.
//!
//! One pool exists per process. `N` background workers (default: hardware
//! threads minus one) sleep on a semaphore between dispatches; the
//! dispatching thread fills the ring, publishes a task count with release
//! ordering, wakes every worker, then participates as worker 0 and
//! spin-waits for the pending counter to drain. Within a dispatch tasks are
//! independent and run in any order; the release decrement on completion
//! paired with the dispatcher's acquire loop gives the happens-before edge
//! that makes worker writes visible when `dispatch` returns.
//!
//! Cancellation is cooperative: [`cancel`] raises a flag workers poll once
//! per task; raised, the remaining tasks drain without running and the
//! executor reports the query as cancelled. The flag is cleared at the
//! start of the next execute.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::error::{Error, Result};
use crate::mem;
use crate::types::{MORSELS_PER_TASK, MORSEL_ELEMS};

/// Elements per task: the dispatch grain.
pub(crate) const TASK_GRAIN: i64 = MORSEL_ELEMS * MORSELS_PER_TASK;

/// Ring growth cap; beyond this the grain is widened instead.
const MAX_TASKS_PER_DISPATCH: usize = 4096;

const STATE_UNINIT: u8 = 0;
const STATE_INITIALIZING: u8 = 1;
const STATE_READY: u8 = 2;
const STATE_DESTROYING: u8 = 3;

static STATE: AtomicU8 = AtomicU8::new(STATE_UNINIT);
static CANCEL: AtomicBool = AtomicBool::new(false);

/// Worker-pool sizing. `workers: None` means `hardware_threads - 1`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolConfig {
    pub workers: Option<usize>,
}

impl PoolConfig {
    /// Resolved background worker count.
    pub fn worker_count(&self) -> usize {
        self.workers
            .unwrap_or_else(|| num_cpus::get().saturating_sub(1))
    }

    /// Initialize the pool with this configuration.
    pub fn init(self) -> Result<()> {
        pool_init(self.worker_count())
    }
}

type TaskFn = unsafe fn(*const u8, i64, i64);

#[derive(Clone, Copy)]
struct Task {
    f: TaskFn,
    ctx: *const u8,
    start: i64,
    end: i64,
}

unsafe fn noop_task(_: *const u8, _: i64, _: i64) {}

const IDLE_TASK: Task = Task {
    f: noop_task,
    ctx: std::ptr::null(),
    start: 0,
    end: 0,
};

/// Single-producer multi-consumer task ring. `tail` and `count` are
/// cumulative over the pool lifetime; a slot is `index & (capacity - 1)`.
/// Consumers claim indices with an atomic increment bounded by the
/// published count, so a claim can never overshoot into the next dispatch.
struct Ring {
    tasks: UnsafeCell<Vec<Task>>,
    count: AtomicU64,
    tail: AtomicU64,
    pending: AtomicU64,
}

unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

impl Ring {
    fn new() -> Ring {
        Ring {
            tasks: UnsafeCell::new(vec![IDLE_TASK; 256]),
            count: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            pending: AtomicU64::new(0),
        }
    }

    fn claim(&self) -> Option<Task> {
        loop {
            let t = self.tail.load(Ordering::Relaxed);
            if t >= self.count.load(Ordering::Acquire) {
                return None;
            }
            if self
                .tail
                .compare_exchange_weak(t, t + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                let tasks = unsafe { &*self.tasks.get() };
                return Some(tasks[t as usize & (tasks.len() - 1)]);
            }
        }
    }

    /// Producer-only: stage `batch` and publish it. Requires all prior
    /// tasks consumed and completed (`pending == 0`).
    unsafe fn publish(&self, batch: &[Task]) {
        debug_assert_eq!(self.pending.load(Ordering::Acquire), 0);
        let tasks = unsafe { &mut *self.tasks.get() };
        if batch.len() > tasks.len() {
            let cap = batch.len().next_power_of_two();
            tasks.clear();
            tasks.resize(cap, IDLE_TASK);
        }
        let mask = tasks.len() - 1;
        let base = self.count.load(Ordering::Relaxed);
        for (k, t) in batch.iter().enumerate() {
            tasks[(base as usize + k) & mask] = *t;
        }
        self.pending.store(batch.len() as u64, Ordering::Release);
        self.count
            .store(base + batch.len() as u64, Ordering::Release);
    }
}

/// Counting semaphore the workers sleep on between dispatches.
struct Semaphore {
    permits: Mutex<usize>,
    cv: Condvar,
}

impl Semaphore {
    fn new() -> Semaphore {
        Semaphore {
            permits: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    fn post(&self, n: usize) {
        let mut p = self.permits.lock().unwrap();
        *p += n;
        if n == 1 {
            self.cv.notify_one();
        } else {
            self.cv.notify_all();
        }
    }

    fn acquire(&self) {
        let mut p = self.permits.lock().unwrap();
        while *p == 0 {
            p = self.cv.wait(p).unwrap();
        }
        *p -= 1;
    }
}

struct Shared {
    ring: Ring,
    sem: Semaphore,
    shutdown: AtomicBool,
    n_workers: usize,
}

struct Pool {
    shared: Arc<Shared>,
    handles: Vec<JoinHandle<()>>,
}

static POOL: Mutex<Option<Pool>> = Mutex::new(None);
/// Serializes dispatches; the ring supports one producer at a time.
static DISPATCH_LOCK: Mutex<()> = Mutex::new(());

fn run_one(task: &Task) {
    if !CANCEL.load(Ordering::Relaxed) {
        unsafe { (task.f)(task.ctx, task.start, task.end) };
    }
}

fn worker_main(shared: Arc<Shared>) {
    loop {
        shared.sem.acquire();
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        while let Some(task) = shared.ring.claim() {
            run_one(&task);
            shared.ring.pending.fetch_sub(1, Ordering::Release);
        }
    }
}

/// Initialize the pool with `n_workers` background threads. Fails if the
/// pool is already initialized; call [`pool_destroy`] first to resize.
pub fn pool_init(n_workers: usize) -> Result<()> {
    if STATE
        .compare_exchange(
            STATE_UNINIT,
            STATE_INITIALIZING,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_err()
    {
        return Err(Error::Rank("worker pool already initialized".into()));
    }
    let shared = Arc::new(Shared {
        ring: Ring::new(),
        sem: Semaphore::new(),
        shutdown: AtomicBool::new(false),
        n_workers,
    });
    let mut handles = Vec::with_capacity(n_workers);
    for i in 0..n_workers {
        let sh = Arc::clone(&shared);
        let spawned = std::thread::Builder::new()
            .name(format!("basalt-worker-{i}"))
            .spawn(move || worker_main(sh));
        match spawned {
            Ok(h) => handles.push(h),
            Err(e) => {
                // Unwind cleanly so a later init can retry.
                shared.shutdown.store(true, Ordering::Release);
                shared.sem.post(handles.len().max(1));
                for h in handles {
                    let _ = h.join();
                }
                STATE.store(STATE_UNINIT, Ordering::Release);
                return Err(Error::io("spawn", format!("worker-{i}"), e));
            }
        }
    }
    *POOL.lock().unwrap() = Some(Pool { shared, handles });
    log::debug!("worker pool ready with {n_workers} workers");
    STATE.store(STATE_READY, Ordering::Release);
    Ok(())
}

/// Tear the pool down, joining every worker.
pub fn pool_destroy() {
    if STATE
        .compare_exchange(
            STATE_READY,
            STATE_DESTROYING,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_err()
    {
        return;
    }
    let pool = POOL.lock().unwrap().take();
    if let Some(pool) = pool {
        pool.shared.shutdown.store(true, Ordering::Release);
        pool.shared.sem.post(pool.handles.len().max(1));
        for h in pool.handles {
            let _ = h.join();
        }
    }
    STATE.store(STATE_UNINIT, Ordering::Release);
}

/// Raise the cancellation flag. Running tasks finish; queued tasks drain
/// without executing; the executor returns `Error::Cancelled`.
pub fn cancel() {
    CANCEL.store(true, Ordering::Release);
}

pub(crate) fn cancelled() -> bool {
    CANCEL.load(Ordering::Relaxed)
}

pub(crate) fn clear_cancel() {
    CANCEL.store(false, Ordering::Release);
}

fn ensure_pool() -> Result<Arc<Shared>> {
    if STATE.load(Ordering::Acquire) != STATE_READY {
        // A racing initializer is fine; only one CAS wins.
        let _ = PoolConfig::default().init();
        // Spin briefly while another thread finishes initializing.
        while STATE.load(Ordering::Acquire) == STATE_INITIALIZING {
            std::hint::spin_loop();
        }
    }
    POOL.lock()
        .unwrap()
        .as_ref()
        .map(|p| Arc::clone(&p.shared))
        .ok_or_else(|| Error::Rank("worker pool unavailable".into()))
}

/// Ceiling division for non-negative `i64` operands.
pub(crate) fn div_ceil_i64(a: i64, b: i64) -> i64 {
    (a + b - 1) / b
}

/// Partition `[0, total)` into grain-sized tasks and run them across the
/// pool, dispatcher included. Returns once every task has completed.
pub(crate) fn dispatch_range<C: Sync>(ctx: &C, total: i64, f: fn(&C, i64, i64)) -> Result<()> {
    struct Shim<C> {
        f: fn(&C, i64, i64),
        ctx: *const C,
    }
    unsafe fn thunk<C>(p: *const u8, s: i64, e: i64) {
        let shim = unsafe { &*(p as *const Shim<C>) };
        (shim.f)(unsafe { &*shim.ctx }, s, e);
    }
    let shim = Shim { f, ctx };

    let mut grain = TASK_GRAIN;
    let mut n_tasks = div_ceil_i64(total, grain);
    if n_tasks as usize > MAX_TASKS_PER_DISPATCH {
        // Widen the grain, keeping task starts on grain-multiple offsets.
        grain = div_ceil_i64(
            div_ceil_i64(total, MAX_TASKS_PER_DISPATCH as i64),
            TASK_GRAIN,
        ) * TASK_GRAIN;
        n_tasks = div_ceil_i64(total, grain);
    }
    let mut batch = Vec::with_capacity(n_tasks as usize);
    for i in 0..n_tasks {
        batch.push(Task {
            f: thunk::<C> as TaskFn,
            ctx: &shim as *const Shim<C> as *const u8,
            start: i * grain,
            end: ((i + 1) * grain).min(total),
        });
    }
    run_batch(&batch)
}

/// Dispatch exactly `n` one-unit tasks (`start = i`, `end = i + 1`); used
/// by partitioned hash aggregates and joins.
pub(crate) fn dispatch_partitions<C: Sync>(ctx: &C, n: i64, f: fn(&C, i64, i64)) -> Result<()> {
    struct Shim<C> {
        f: fn(&C, i64, i64),
        ctx: *const C,
    }
    unsafe fn thunk<C>(p: *const u8, s: i64, e: i64) {
        let shim = unsafe { &*(p as *const Shim<C>) };
        (shim.f)(unsafe { &*shim.ctx }, s, e);
    }
    let shim = Shim { f, ctx };
    let batch: Vec<Task> = (0..n)
        .map(|i| Task {
            f: thunk::<C> as TaskFn,
            ctx: &shim as *const Shim<C> as *const u8,
            start: i,
            end: i + 1,
        })
        .collect();
    run_batch(&batch)
}

fn run_batch(batch: &[Task]) -> Result<()> {
    if batch.is_empty() {
        return Ok(());
    }
    let shared = ensure_pool()?;
    let _guard = DISPATCH_LOCK.lock().unwrap();

    mem::parallel_begin();
    unsafe { shared.ring.publish(batch) };
    shared.sem.post(shared.n_workers);

    // Participate as worker 0.
    while let Some(task) = shared.ring.claim() {
        run_one(&task);
        shared.ring.pending.fetch_sub(1, Ordering::Release);
    }

    // Quiesce: acquire pairs with each worker's release decrement.
    let mut spins = 0u32;
    while shared.ring.pending.load(Ordering::Acquire) != 0 {
        std::hint::spin_loop();
        spins += 1;
        if spins % 64 == 0 {
            std::thread::yield_now();
        }
    }
    mem::parallel_end();
    Ok(())
}

/// Unit tests that dispatch (or cancel) share the process-global pool;
/// they serialize on this lock so a raised cancel flag cannot leak into a
/// neighbouring test's dispatch.
#[cfg(test)]
pub(crate) static TEST_POOL_LOCK: Mutex<()> = Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI64;

    use super::TEST_POOL_LOCK as TEST_LOCK;

    #[test]
    fn dispatch_covers_the_whole_range() -> Result<()> {
        let _t = TEST_LOCK.lock().unwrap();
        let sum = AtomicI64::new(0);
        fn body(sum: &AtomicI64, start: i64, end: i64) {
            let mut acc = 0;
            for i in start..end {
                acc += i;
            }
            sum.fetch_add(acc, Ordering::Relaxed);
        }
        let n = 100_000i64;
        dispatch_range(&sum, n, body)?;
        assert_eq!(sum.load(Ordering::Relaxed), n * (n - 1) / 2);
        Ok(())
    }

    #[test]
    fn partition_dispatch_runs_each_once() -> Result<()> {
        let _t = TEST_LOCK.lock().unwrap();
        let hits: Vec<AtomicI64> = (0..17).map(|_| AtomicI64::new(0)).collect();
        fn body(hits: &Vec<AtomicI64>, start: i64, _end: i64) {
            hits[start as usize].fetch_add(1, Ordering::Relaxed);
        }
        dispatch_partitions(&hits, 17, body)?;
        for h in &hits {
            assert_eq!(h.load(Ordering::Relaxed), 1);
        }
        Ok(())
    }

    #[test]
    fn cancellation_drains_without_running() -> Result<()> {
        let _t = TEST_LOCK.lock().unwrap();
        let ran = AtomicI64::new(0);
        fn body(ran: &AtomicI64, _s: i64, _e: i64) {
            ran.fetch_add(1, Ordering::Relaxed);
        }
        cancel();
        dispatch_range(&ran, 1_000_000, body)?;
        assert_eq!(ran.load(Ordering::Relaxed), 0);
        clear_cancel();
        dispatch_range(&ran, 20_000, body)?;
        assert!(ran.load(Ordering::Relaxed) > 0);
        Ok(())
    }

    #[test]
    fn back_to_back_dispatches_reuse_the_ring() -> Result<()> {
        let _t = TEST_LOCK.lock().unwrap();
        let sum = AtomicI64::new(0);
        fn body(sum: &AtomicI64, start: i64, end: i64) {
            sum.fetch_add(end - start, Ordering::Relaxed);
        }
        for _ in 0..10 {
            dispatch_range(&sum, 50_000, body)?;
        }
        assert_eq!(sum.load(Ordering::Relaxed), 500_000);
        Ok(())
    }
}
