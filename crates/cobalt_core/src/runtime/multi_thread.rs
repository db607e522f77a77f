//! Data parallel execution of generated pipeline functions.
//!
//! A parallel pipeline is a generated worker function invoked once per worker
//! on a dedicated pool. Each worker gets its own pipeline state block and a
//! `MultiThreadContext` describing its slice of the work. Workers meet at a
//! counting barrier before merging anything into shared state, and merges
//! go through a single mutex owned by the barrier.

use std::mem::{align_of, size_of};
use std::ptr;

use cobalt_error::{DbError, Result};
use parking_lot::{Condvar, Mutex};
use rayon::ThreadPoolBuilder;
use tracing::{debug, warn};

use super::error::{set_pending_error, take_pending_error};
use super::hash_table::{HashTable, destroy_if_live};

#[derive(Debug)]
struct BarrierState {
    /// Number of workers currently waiting.
    waiting: usize,
    /// Incremented every time all workers arrive.
    generation: u64,
    /// Set when a worker failed. Waiting on a poisoned barrier fails
    /// immediately.
    poisoned: bool,
}

/// Counting barrier shared by the workers of one parallel pipeline.
#[derive(Debug)]
pub struct Barrier {
    parties: usize,
    state: Mutex<BarrierState>,
    cond: Condvar,
    /// Guards merging thread local hash tables into a global one.
    merge_lock: Mutex<()>,
}

impl Barrier {
    pub fn new(parties: usize) -> Self {
        assert!(parties > 0);
        Barrier {
            parties,
            state: Mutex::new(BarrierState {
                waiting: 0,
                generation: 0,
                poisoned: false,
            }),
            cond: Condvar::new(),
            merge_lock: Mutex::new(()),
        }
    }

    /// Wait for all workers to arrive.
    ///
    /// Returns true for exactly one worker per generation (the last to
    /// arrive).
    pub fn wait(&self) -> Result<bool> {
        let mut state = self.state.lock();
        if state.poisoned {
            return Err(DbError::new("Parallel execution aborted by another worker"));
        }

        state.waiting += 1;
        if state.waiting == self.parties {
            state.waiting = 0;
            state.generation += 1;
            self.cond.notify_all();
            return Ok(true);
        }

        let generation = state.generation;
        while generation == state.generation && !state.poisoned {
            self.cond.wait(&mut state);
        }

        if generation == state.generation {
            // Woken by poisoning.
            return Err(DbError::new("Parallel execution aborted by another worker"));
        }

        Ok(false)
    }

    /// Poison the barrier, releasing everyone waiting on it.
    pub fn poison(&self) {
        let mut state = self.state.lock();
        state.poisoned = true;
        self.cond.notify_all();
    }

    /// Merge a worker's thread local table into the global table. Only one
    /// worker merges at a time.
    ///
    /// # Safety
    ///
    /// Both pointers must point to distinct live hash tables, and `global`
    /// must only be modified through this method while workers are running.
    pub unsafe fn merge_to_global_hash_table(&self, global: *mut HashTable, local: *mut HashTable) -> Result<()> {
        let _guard = self.merge_lock.lock();
        let global = unsafe { &mut *global };
        let local = unsafe { &mut *local };
        global.merge_lazy_unfinished(local)
    }
}

/// Per worker context handed to the generated worker function.
#[derive(Debug)]
pub struct MultiThreadContext<'a> {
    worker_id: usize,
    num_workers: usize,
    barrier: &'a Barrier,
}

impl<'a> MultiThreadContext<'a> {
    pub fn new(worker_id: usize, num_workers: usize, barrier: &'a Barrier) -> Self {
        assert!(worker_id < num_workers);
        MultiThreadContext {
            worker_id,
            num_workers,
            barrier,
        }
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Number of workers actually receiving work, at most one per unit.
    fn active_workers(&self, total: usize) -> usize {
        usize::min(self.num_workers, total)
    }

    /// Start of this worker's `[start, end)` range of `total` units.
    pub fn range_start(&self, total: usize) -> usize {
        let active = self.active_workers(total);
        if self.worker_id >= active {
            return total;
        }
        let slice = total / active;
        self.worker_id * slice
    }

    /// End of this worker's range. The last active worker picks up the
    /// remainder.
    pub fn range_end(&self, total: usize) -> usize {
        let active = self.active_workers(total);
        if self.worker_id >= active {
            return total;
        }
        if self.worker_id == active - 1 {
            return total;
        }
        let slice = total / active;
        (self.worker_id + 1) * slice
    }

    pub fn barrier(&self) -> &Barrier {
        self.barrier
    }
}

/// Per worker state blocks for a parallel pipeline.
///
/// Lives inside the query's runtime state. Generated code only ever handles
/// pointers to it.
#[repr(C)]
#[derive(Debug)]
pub struct ThreadStates {
    /// Size of each worker's state, multiple of 8.
    state_size: usize,
    num_workers: usize,
    /// u64 backing to keep every state 8 byte aligned.
    data: Vec<u64>,
    live: bool,
}

pub const THREAD_STATES_SIZE: usize = size_of::<ThreadStates>();
pub const THREAD_STATES_ALIGN: usize = align_of::<ThreadStates>();

impl ThreadStates {
    pub fn new() -> Self {
        ThreadStates {
            state_size: 0,
            num_workers: 0,
            data: Vec::new(),
            live: true,
        }
    }

    /// Allocate zeroed state for `num_workers` workers.
    pub fn reset(&mut self, num_workers: usize, state_size: usize) {
        let state_size = state_size.next_multiple_of(8);
        self.state_size = state_size;
        self.num_workers = num_workers;
        self.data.clear();
        self.data.resize(num_workers * state_size / 8, 0);
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    pub fn state_size(&self) -> usize {
        self.state_size
    }

    pub fn state_ptr(&self, worker: usize) -> *mut u8 {
        assert!(worker < self.num_workers);
        // SAFETY: Worker is in bounds of the allocated data.
        unsafe { (self.data.as_ptr() as *mut u8).add(worker * self.state_size) }
    }

    pub fn iter_states(&self) -> impl Iterator<Item = *mut u8> + '_ {
        (0..self.num_workers).map(|worker| self.state_ptr(worker))
    }
}

impl Default for ThreadStates {
    fn default() -> Self {
        Self::new()
    }
}

/// Generated worker function: `(runtime_state, worker_state, worker_ctx)`.
pub type WorkerFunction = unsafe extern "C" fn(*mut u8, *mut u8, *mut u8);

/// Pointer that may be sent across threads.
#[derive(Debug, Clone, Copy)]
struct SendPtr(*mut u8);

// SAFETY: Generated code coordinates access to shared state through the
// barrier.
unsafe impl Send for SendPtr {}
unsafe impl Sync for SendPtr {}

impl SendPtr {
    /// Closures must go through this so they capture the wrapper rather
    /// than the raw pointer field.
    fn get(self) -> *mut u8 {
        self.0
    }
}

/// Run `func` on `num_workers` workers, returning the first error raised by
/// any of them.
///
/// # Safety
///
/// `func` must be a valid worker function, and `runtime_state` must be valid
/// for the duration of the call.
pub unsafe fn run_parallel(
    func: WorkerFunction,
    runtime_state: *mut u8,
    thread_states: &mut ThreadStates,
    num_workers: usize,
    state_size: usize,
) -> Result<()> {
    let num_workers = num_workers.max(1);
    thread_states.reset(num_workers, state_size);

    let pool = ThreadPoolBuilder::new()
        .thread_name(|idx| format!("cobalt_worker_{idx}"))
        .num_threads(num_workers)
        .build()
        .map_err(|e| DbError::with_source("Failed to build thread pool", Box::new(e)))?;

    debug!(num_workers, state_size, "running parallel pipeline");

    let barrier = Barrier::new(num_workers);
    let error: Mutex<Option<DbError>> = Mutex::new(None);
    let runtime_state = SendPtr(runtime_state);
    let states: Vec<_> = thread_states.iter_states().map(SendPtr).collect();

    pool.scope(|s| {
        for (worker_id, state) in states.iter().copied().enumerate() {
            let barrier = &barrier;
            let error = &error;
            s.spawn(move |_| {
                let mut ctx = MultiThreadContext::new(worker_id, num_workers, barrier);
                let ctx_ptr = ptr::addr_of_mut!(ctx) as *mut u8;
                // SAFETY: Caller guarantees `func` and `runtime_state` are
                // valid, state and context outlive the call.
                unsafe { func(runtime_state.get(), state.get(), ctx_ptr) };

                if let Some(e) = take_pending_error() {
                    warn!(%worker_id, %e, "worker failed");
                    barrier.poison();
                    let mut error = error.lock();
                    if error.is_none() {
                        *error = Some(e);
                    }
                }
            });
        }
    });

    match error.into_inner() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// # Safety
///
/// `states` must point to `THREAD_STATES_SIZE` writable, suitably aligned
/// bytes.
pub unsafe extern "C" fn rt_thread_states_init(states: *mut u8) {
    unsafe { (states as *mut ThreadStates).write(ThreadStates::new()) };
}

/// Destroy thread states. States that were never initialized are skipped,
/// tear down runs this even when init failed.
///
/// # Safety
///
/// `states` must point to states initialized with `rt_thread_states_init`
/// or zeroed memory.
pub unsafe extern "C" fn rt_thread_states_release(states: *mut u8) {
    let states = states as *mut ThreadStates;
    let live = unsafe { ptr::addr_of!((*states).live).read() };
    if live {
        unsafe {
            ptr::drop_in_place(states);
            ptr::write_bytes(states as *mut u8, 0, THREAD_STATES_SIZE);
        }
    }
}

/// Destroy any hash table still live at `offset` in a worker's state.
///
/// Worker functions destroy their thread local tables once merged. This
/// cleans up after workers that bailed out early.
///
/// # Safety
///
/// `states` must point to thread states or zeroed memory. Live states must
/// hold a hash table or zeroed memory at `offset` in each worker state.
pub unsafe extern "C" fn rt_thread_states_destroy_hash_tables(states: *mut u8, offset: u64) {
    let states = states as *const ThreadStates;
    let live = unsafe { ptr::addr_of!((*states).live).read() };
    if !live {
        return;
    }
    let states = unsafe { &*states };
    for state in states.iter_states() {
        unsafe { destroy_if_live(state.add(offset as usize) as *mut HashTable) };
    }
}

/// # Safety
///
/// `func` must be a generated worker function, `thread_states` must point to
/// live thread states.
pub unsafe extern "C" fn rt_run_parallel(
    func: *const u8,
    runtime_state: *mut u8,
    thread_states: *mut u8,
    num_workers: u64,
    state_size: u64,
) {
    let func: WorkerFunction = unsafe { std::mem::transmute(func) };
    let thread_states = unsafe { &mut *(thread_states as *mut ThreadStates) };
    let result = unsafe {
        run_parallel(
            func,
            runtime_state,
            thread_states,
            num_workers as usize,
            state_size as usize,
        )
    };
    if let Err(e) = result {
        set_pending_error(e);
    }
}

/// # Safety
///
/// `ctx` must point to the context passed to a worker function.
pub unsafe extern "C" fn rt_worker_id(ctx: *mut u8) -> u64 {
    let ctx = unsafe { &*(ctx as *const MultiThreadContext) };
    ctx.worker_id() as u64
}

/// # Safety
///
/// See `rt_worker_id`.
pub unsafe extern "C" fn rt_worker_range_start(ctx: *mut u8, total: u64) -> u64 {
    let ctx = unsafe { &*(ctx as *const MultiThreadContext) };
    ctx.range_start(total as usize) as u64
}

/// # Safety
///
/// See `rt_worker_id`.
pub unsafe extern "C" fn rt_worker_range_end(ctx: *mut u8, total: u64) -> u64 {
    let ctx = unsafe { &*(ctx as *const MultiThreadContext) };
    ctx.range_end(total as usize) as u64
}

/// Returns 1 for the last worker to arrive.
///
/// # Safety
///
/// See `rt_worker_id`.
pub unsafe extern "C" fn rt_barrier_wait(ctx: *mut u8) -> u8 {
    let ctx = unsafe { &*(ctx as *const MultiThreadContext) };
    match ctx.barrier().wait() {
        Ok(leader) => leader as u8,
        Err(e) => {
            set_pending_error(e);
            0
        }
    }
}

/// # Safety
///
/// See `rt_worker_id` and `Barrier::merge_to_global_hash_table`.
pub unsafe extern "C" fn rt_merge_to_global_hash_table(ctx: *mut u8, global: *mut u8, local: *mut u8) {
    let ctx = unsafe { &*(ctx as *const MultiThreadContext) };
    let result = unsafe {
        ctx.barrier()
            .merge_to_global_hash_table(global as *mut HashTable, local as *mut HashTable)
    };
    if let Err(e) = result {
        set_pending_error(e);
    }
}
