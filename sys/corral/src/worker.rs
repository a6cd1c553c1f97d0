// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Worker threads.
//!
//! Each process runs one pinned worker per CPU it owns, plus a *keeper*
//! thread that watches the hand-off mailbox, plus a pool of spare workers
//! created on demand. Spares exist because a task that blocks (pause,
//! contended mutex, in-task wait) keeps its stack camped on its worker
//! thread: the worker hands its CPU to a spare and parks until the task is
//! rescheduled, so the CPU never idles behind a blocked task.
//!
//! A parked worker is *bound* to its task through
//! `TaskRecord::bound_worker` (a pointer meaningful only inside the owner
//! process). When the scheduler later hands the task to some worker on
//! some CPU, that worker revives the bound one in its place — re-pinning
//! it to the serving CPU — and retires itself to the spare pool.
//!
//! Ordering rule for every blocking path: the parking worker clears its
//! own assignment word *before* the task becomes discoverable (state
//! paused / requeued). A reviver writes the assignment word only after
//! discovering the task, so the two writes cannot cross.

use core::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::cell::Cell;
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;

use crate::dlock::{item_task, Acquired, ITEM_TRY_AGAIN};
use crate::scheduler::Server;
use crate::shmem::Off;
use crate::task::{
    self, STATE_PAUSED, STATE_READY, STATE_RUNNING, STATE_SUBMITTED, STATE_YIELDING,
};
use crate::Instance;
use abi::GovernorPolicy;

/// `WorkerHandle::cpu` values below zero.
const ASSIGN_NONE: i32 = -2;
const ASSIGN_EXIT: i32 = -1;

/// Per-thread handle through which a worker receives CPU assignments.
/// Lives in an `Arc` held by the pool for the life of the attachment, so
/// the raw pointer stored in `TaskRecord::bound_worker` stays valid.
pub(crate) struct WorkerHandle {
    thread: OnceLock<std::thread::Thread>,
    /// Current assignment: a CPU logical id, or `ASSIGN_NONE` (parked) or
    /// `ASSIGN_EXIT`.
    cpu: AtomicI32,
    /// Task to run immediately on assignment (mailbox hand-off), or 0.
    direct: AtomicU64,
    /// Immediate-successor stash for the task currently running here.
    successor: AtomicU64,
}

impl WorkerHandle {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            thread: OnceLock::new(),
            cpu: AtomicI32::new(ASSIGN_NONE),
            direct: AtomicU64::new(0),
            successor: AtomicU64::new(0),
        })
    }

    fn assign(&self, cpu: i32, direct: Off) {
        self.direct.store(direct, Ordering::Relaxed);
        self.cpu.store(cpu, Ordering::Release);
        if let Some(t) = self.thread.get() {
            t.unpark();
        }
    }

    /// Parks until an assignment (or exit) arrives.
    fn wait_assignment(&self) -> i32 {
        loop {
            let c = self.cpu.load(Ordering::Acquire);
            if c != ASSIGN_NONE {
                return c;
            }
            std::thread::park();
        }
    }

    fn cpu_now(&self) -> i32 {
        self.cpu.load(Ordering::Acquire)
    }

    fn take_direct(&self) -> Option<Off> {
        let v = self.direct.swap(0, Ordering::AcqRel);
        (v != 0).then_some(v)
    }
}

#[derive(Default)]
struct PoolState {
    spares: Vec<Arc<WorkerHandle>>,
    all: Vec<(Arc<WorkerHandle>, JoinHandle<()>)>,
    shutdown: bool,
}

/// The process-local worker pool.
pub(crate) struct WorkerPool {
    state: Mutex<PoolState>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Puts a worker on `cpu`, reusing a spare if one is parked, spawning
    /// otherwise. `direct` optionally carries a task to run first.
    /// Returns false (declining the assignment) once shutdown has begun.
    pub fn assign_cpu(&self, inst: &Arc<Instance>, cpu: usize, direct: Option<Off>) -> bool {
        let handle = {
            let mut st = self.state.lock().unwrap();
            if st.shutdown {
                return false;
            }
            match st.spares.pop() {
                Some(h) => h,
                None => {
                    let h = WorkerHandle::new();
                    let inst2 = Arc::clone(inst);
                    let h2 = Arc::clone(&h);
                    let join = std::thread::Builder::new()
                        .name("corral-worker".into())
                        .spawn(move || worker_main(inst2, h2))
                        .expect("spawning worker thread");
                    st.all.push((Arc::clone(&h), join));
                    h
                }
            }
        };
        handle.assign(cpu as i32, direct.unwrap_or(0));
        true
    }

    /// Re-registers a worker as spare. Returns false when the pool is
    /// shutting down (the worker should exit instead); the assignment
    /// word is only reset under the pool lock so a concurrent exit
    /// broadcast cannot be overwritten.
    fn park_as_spare(&self, me: &Arc<WorkerHandle>) -> bool {
        let mut st = self.state.lock().unwrap();
        if st.shutdown {
            return false;
        }
        me.cpu.store(ASSIGN_NONE, Ordering::Release);
        st.spares.push(Arc::clone(me));
        true
    }

    /// Tells every worker to exit and joins them. `wake` is invoked
    /// repeatedly while stragglers drain: it must wake this process's
    /// waiter-slot futexes, since a foreign lock holder can park our
    /// waiters again at any point before they observe the exit order.
    pub fn shutdown(&self, wake: impl Fn()) {
        let joins: Vec<_> = {
            let mut st = self.state.lock().unwrap();
            st.shutdown = true;
            st.spares.clear();
            st.all.drain(..).collect()
        };
        for (h, _) in &joins {
            h.assign(ASSIGN_EXIT, 0);
        }
        for (h, join) in joins {
            while !join.is_finished() {
                wake();
                if let Some(t) = h.thread.get() {
                    t.unpark();
                }
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
            let _ = join.join();
        }
    }
}

// --- thread-local task context ------------------------------------------

#[derive(Copy, Clone)]
pub(crate) struct Current {
    pub instance: *const Instance,
    pub worker: *const WorkerHandle,
    pub task: Off,
    pub exec: u32,
}

thread_local! {
    static CURRENT: Cell<Option<Current>> = const { Cell::new(None) };
}

/// The calling thread's task context, if it is a worker mid-body.
pub(crate) fn current() -> Option<Current> {
    CURRENT.with(|c| c.get())
}

/// The logical CPU the calling worker currently runs on.
pub(crate) fn current_cpu() -> Option<usize> {
    let cur = current()?;
    // Safety: `worker` is valid while the body runs on this thread.
    let c = unsafe { (*cur.worker).cpu_now() };
    (c >= 0).then_some(c as usize)
}

// --- worker main loop ----------------------------------------------------

fn pin_to(inst: &Instance, cpu: usize) {
    #[cfg(target_os = "linux")]
    {
        let server = Server::new(&inst.region);
        let sys = server.topo.logical_to_system(cpu as u32) as usize;
        let mut set = nix::sched::CpuSet::new();
        if set.set(sys).is_ok() {
            if let Err(e) = nix::sched::sched_setaffinity(nix::unistd::gettid(), &set) {
                log::warn!("pinning worker to cpu {sys}: {e}");
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (inst, cpu);
    }
}

enum CpuOutcome {
    Exit,
    Retire,
}

enum RunOutcome {
    Done,
    /// The task belonged to a parked worker which now has our CPU; we
    /// must leave it.
    Handoff,
}

fn worker_main(inst: Arc<Instance>, me: Arc<WorkerHandle>) {
    let _ = me.thread.set(std::thread::current());
    loop {
        let c = me.wait_assignment();
        if c == ASSIGN_EXIT {
            break;
        }
        pin_to(&inst, c as usize);
        match on_cpu(&inst, &me) {
            CpuOutcome::Exit => break,
            CpuOutcome::Retire => {
                if !inst.pool.park_as_spare(&me) {
                    break;
                }
            }
        }
    }
}

fn on_cpu(inst: &Arc<Instance>, me: &Arc<WorkerHandle>) -> CpuOutcome {
    let server = Server::new(&inst.region);
    let policy = server.tunables.policy();
    let threshold = server.tunables.governor_spins;
    let mut parked = false;
    let mut spins = 0u32;

    loop {
        let c = me.cpu_now();
        if c == ASSIGN_EXIT {
            // A direct hand-off must not evaporate during shutdown.
            if let Some(off) = me.take_direct() {
                let _ = run_task(inst, me, &server, off, 1);
            }
            return CpuOutcome::Exit;
        }
        debug_assert!(c >= 0);
        let cpu = c as usize;

        if let Some(off) = me.take_direct() {
            match run_task(inst, me, &server, off, 1) {
                RunOutcome::Done => continue,
                RunOutcome::Handoff => return CpuOutcome::Retire,
            }
        }

        match server.lock.acquire(cpu, parked) {
            Acquired::Holder => {
                parked = false;
                match server.server_pass(Some(cpu)) {
                    Some((off, exec)) => {
                        server.lock.release();
                        spins = 0;
                        match run_task(inst, me, &server, off, exec) {
                            RunOutcome::Done => {}
                            RunOutcome::Handoff => return CpuOutcome::Retire,
                        }
                    }
                    None => {
                        // Nothing for us either; the governor's policy
                        // applies to the holder as it would to a waiter.
                        let park_now = match policy {
                            GovernorPolicy::Busy => false,
                            GovernorPolicy::Idle => true,
                            GovernorPolicy::Hybrid => spins >= threshold,
                        };
                        if park_now {
                            server.sched.gov.waiters.clear(cpu);
                            server.sched.gov.sleepers.set(cpu);
                            server.lock.prime_self_sleep(cpu);
                            server.lock.release();
                            // Close the submit/park race: a submission
                            // whose wake-one missed our sleep command
                            // must be visible to this re-check (and vice
                            // versa), so the queue can never strand work
                            // behind a full set of sleepers.
                            core::sync::atomic::fence(Ordering::SeqCst);
                            if server.inputs_pending() {
                                server.lock.wake_slot(cpu);
                            }
                            parked = true;
                            spins = 0;
                        } else {
                            server.lock.release();
                            parked = false;
                            spins += 1;
                            core::hint::spin_loop();
                        }
                    }
                }
            }
            Acquired::Served { item, exec } => {
                parked = false;
                if item == ITEM_TRY_AGAIN {
                    spins += 1;
                    continue;
                }
                if let Some(off) = item_task(item) {
                    spins = 0;
                    match run_task(inst, me, &server, off, exec) {
                        RunOutcome::Done => {}
                        RunOutcome::Handoff => return CpuOutcome::Retire,
                    }
                }
            }
        }
    }
}

/// Executes (or hands off) one served task, then any immediate
/// successors.
fn run_task(
    inst: &Arc<Instance>,
    me: &Arc<WorkerHandle>,
    server: &Server<'_>,
    off: Off,
    exec: u32,
) -> RunOutcome {
    // Safety: the scheduler gave us a live task.
    let t = unsafe { task::task(&inst.region, off) };

    // A nonzero bound worker means this is a paused/yielded body being
    // rescheduled: its stack lives on another thread. Give that thread our
    // CPU and bow out.
    let bound = t.rec.bound_worker.load(Ordering::Acquire);
    if bound != 0 {
        let cpu = me.cpu_now();
        debug_assert!(cpu >= 0);
        // Safety: bound-worker pointers are only stored by this process
        // and stay valid until pool shutdown.
        let handle = unsafe { &*(bound as *const WorkerHandle) };
        handle.assign(cpu, 0);
        return RunOutcome::Handoff;
    }

    let mut current = (off, exec);
    loop {
        execute_body(inst, me, server, current.0, current.1);

        // Immediate successor: run it on this CPU without touching the
        // queues.
        match me.successor.swap(0, Ordering::AcqRel) {
            0 => break,
            succ => {
                let s = unsafe { task::task(&inst.region, succ) };
                s.transition(STATE_SUBMITTED, STATE_READY);
                s.transition(STATE_READY, STATE_RUNNING);
                let e = s.rec.dispatched.fetch_add(1, Ordering::AcqRel) + 1;
                current = (succ, e);
            }
        }
    }
    RunOutcome::Done
}

fn execute_body(
    inst: &Arc<Instance>,
    me: &Arc<WorkerHandle>,
    server: &Server<'_>,
    off: Off,
    exec: u32,
) {
    let t = unsafe { task::task(&inst.region, off) };
    let body = inst.type_body(t.rec.type_id);

    let cpu = me.cpu_now();
    debug_assert!(cpu >= 0);
    server.note_run_start(cpu as usize, off);
    t.rec.last_cpu.store(cpu, Ordering::Relaxed);

    let prev = CURRENT.with(|c| {
        c.replace(Some(Current {
            instance: Arc::as_ptr(inst),
            worker: Arc::as_ptr(me),
            task: off,
            exec,
        }))
    });

    if let Some(body) = body {
        body(&crate::TaskCtx::new(off, exec));
    } else {
        // Submission rejects bodyless types; reaching here is a bug.
        debug_assert!(false, "dispatched a task with no run callback");
    }

    CURRENT.with(|c| c.set(prev));
    // The body may have paused and resumed on a different CPU.
    let cpu_now = me.cpu_now();
    if cpu_now >= 0 {
        server.note_run_end(cpu_now as usize);
    }
    t.rec.yield_flag.store(0, Ordering::Relaxed);

    if t.finish_invocation() {
        // Publish completion first, then collect the in-task waiter: a
        // waiter that registers after our swap is guaranteed to observe
        // `done` set and unregisters itself instead of pausing.
        t.mark_completed();
        let waiter = t.rec.waiter_task.swap(0, Ordering::AcqRel);
        if waiter != 0 {
            let w = unsafe { task::task(&inst.region, waiter) };
            if w.unblock() {
                resume_task(inst, waiter);
            }
        }
    }
}

// --- blocking machinery --------------------------------------------------

/// First half of every park: bind the task to this worker, clear the
/// assignment word, and stop the run clock. After this returns, a reviver
/// that discovers the task may safely write a new assignment. Returns the
/// CPU being given up.
fn detach_from_cpu(me: &WorkerHandle, server: &Server<'_>, t: task::Task<'_>, worker_ptr: *const WorkerHandle) -> usize {
    t.rec
        .bound_worker
        .store(worker_ptr as u64, Ordering::Release);
    let old = me.cpu_now();
    debug_assert!(old >= 0);
    me.cpu.store(ASSIGN_NONE, Ordering::Release);
    server.note_run_end(old as usize);
    old as usize
}

/// Second half: park until a reviver hands us a CPU, then re-pin and
/// restart the run clock.
fn wait_revival(inst: &Arc<Instance>, me: &WorkerHandle, server: &Server<'_>, t: task::Task<'_>, off: Off) {
    let c = me.wait_assignment();
    if c == ASSIGN_EXIT {
        // Shutting down with a blocked task is a contract violation;
        // return so the body can unwind off this thread.
        log::warn!("worker revived by shutdown while its task was blocked");
    } else {
        pin_to(inst, c as usize);
        server.note_run_start(c as usize, off);
    }
    t.rec.bound_worker.store(0, Ordering::Release);
}

/// running → paused. The caller has already raised the blocking count.
/// Returns when the task is resumed on some CPU.
pub(crate) fn pause_current(inst: &Arc<Instance>, cur: Current) {
    let me = unsafe { &*cur.worker };
    let server = Server::new(&inst.region);
    let t = unsafe { task::task(&inst.region, cur.task) };

    let old = detach_from_cpu(me, &server, t, cur.worker);
    // Discoverable from here on: a resumer spins for the paused state.
    t.transition(STATE_RUNNING, STATE_PAUSED);
    // The CPU must not idle behind us.
    inst.pool.assign_cpu(inst, old, None);
    wait_revival(inst, me, &server, t, cur.task);
}

/// running → yielding → resubmitted. Returns when rescheduled.
pub(crate) fn yield_current(inst: &Arc<Instance>, cur: Current) {
    let me = unsafe { &*cur.worker };
    let server = Server::new(&inst.region);
    let t = unsafe { task::task(&inst.region, cur.task) };

    let old = detach_from_cpu(me, &server, t, cur.worker);
    t.transition(STATE_RUNNING, STATE_YIELDING);
    t.transition(STATE_YIELDING, STATE_SUBMITTED);
    server.enqueue(inst.proc_idx, cur.task, Some(old));
    inst.pool.assign_cpu(inst, old, None);
    wait_revival(inst, me, &server, t, cur.task);
}

/// Mutex unlock fast hand-off: the unlocker requeues itself like a yield
/// but gives its CPU straight to `resumed` (whose blocking count already
/// hit zero), bypassing the scheduler queue.
pub(crate) fn in_place_yield_to(inst: &Arc<Instance>, cur: Current, resumed: Off) {
    let me = unsafe { &*cur.worker };
    let server = Server::new(&inst.region);
    let t = unsafe { task::task(&inst.region, cur.task) };
    let r = unsafe { task::task(&inst.region, resumed) };

    // Wait out the resumed task's parking bookkeeping, then move it
    // straight to running.
    wait_for_paused(r);
    let bound = r.rec.bound_worker.load(Ordering::Acquire);
    debug_assert_ne!(bound, 0);
    r.transition(STATE_PAUSED, STATE_RUNNING);

    let old = detach_from_cpu(me, &server, t, cur.worker);
    t.transition(STATE_RUNNING, STATE_YIELDING);
    t.transition(STATE_YIELDING, STATE_SUBMITTED);
    server.enqueue(inst.proc_idx, cur.task, Some(old));

    // Safety: bound-worker pointers stay valid until pool shutdown.
    let handle = unsafe { &*(bound as *const WorkerHandle) };
    handle.assign(old as i32, 0);

    wait_revival(inst, me, &server, t, cur.task);
}

/// Resumes a paused task through the scheduler: paused → submitted →
/// (ready). The pausing worker may still be mid-bookkeeping; wait it out.
pub(crate) fn resume_task(inst: &Arc<Instance>, off: Off) {
    let server = Server::new(&inst.region);
    let t = unsafe { task::task(&inst.region, off) };
    wait_for_paused(t);
    t.transition(STATE_PAUSED, STATE_SUBMITTED);
    server.enqueue(inst.proc_idx, off, current_cpu());
}

fn wait_for_paused(t: task::Task<'_>) {
    let mut spins = 0u32;
    while t.state() != STATE_PAUSED {
        spins += 1;
        if spins % 256 == 0 {
            std::thread::yield_now();
        } else {
            core::hint::spin_loop();
        }
    }
}

/// Stashes `off` as the current worker's immediate successor if the slot
/// is free. Returns false when the caller should submit normally.
pub(crate) fn try_stash_successor(cur: Current, off: Off) -> bool {
    // Safety: worker pointer valid for the body's duration.
    let me = unsafe { &*cur.worker };
    me.successor
        .compare_exchange(0, off, Ordering::AcqRel, Ordering::Relaxed)
        .is_ok()
}
