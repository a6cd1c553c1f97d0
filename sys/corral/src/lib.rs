// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! corral: a co-execution tasking runtime.
//!
//! Several processes on one machine share a pool of hardware CPUs by
//! routing user tasks to worker threads pinned to those CPUs, arbitrating
//! CPU ownership through a named shared-memory region instead of
//! oversubscribing threads.
//!
//! The crate is organized bottom-up:
//!
//! - [`shmem`]: the shared coordination region (one per isolation scope);
//! - [`topology`]: the five-level locality model over that region;
//! - [`cpu`], [`dlock`], [`governor`]: CPU ownership, the delegation
//!   lock, and the spin→sleep policy;
//! - [`scheduler`]: input queues, ready FIFO, affinity-ordered dispatch,
//!   quantum;
//! - [`task`], `worker`: the task state machine and the pinned worker
//!   pool;
//! - [`mutex`]: the task-blocking mutex record.
//!
//! The front door is [`Runtime::attach`]; everything a task body needs at
//! runtime hangs off [`TaskCtx`].

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock, RwLock, Weak};
use std::thread::JoinHandle;

pub mod cpu;
pub mod dlock;
pub mod err;
pub mod futex;
pub mod governor;
pub mod logging;
pub mod mutex;
pub mod proc;
pub mod scheduler;
pub mod shmem;
pub mod task;
pub mod topology;
mod worker;

pub use abi::{
    Affinity, AffinityPolicy, Config, GovernorPolicy, IsolationLevel, Level, Status,
};
pub use err::{Error, Result};

use scheduler::Server;
use shmem::{Off, Region, SharedTunables};
use task::{STATE_COMPLETED, STATE_CREATED, STATE_SUBMITTED};
use topology::{Binding, HostInfo, TopologyLists, TopologyPlan};

/// One registered task type: a label for tooling, and the run callback.
/// Callbacks are process-local; the shared task record refers to them by
/// index and owner pid only.
struct TypeRec {
    #[allow(dead_code)]
    label: String,
    body: Option<Arc<dyn Fn(&TaskCtx) + Send + Sync>>,
}

/// A process's attachment to one runtime instance.
pub(crate) struct Instance {
    pub(crate) region: Region,
    pub(crate) proc_idx: usize,
    pub(crate) pid: i32,
    pub(crate) pool: worker::WorkerPool,
    types: RwLock<Vec<TypeRec>>,
    keeper: StdMutex<Option<JoinHandle<()>>>,
    stop: AtomicBool,
    detached: AtomicBool,
    weak: OnceLock<Weak<Instance>>,
}

impl Instance {
    pub(crate) fn type_body(
        &self,
        id: u32,
    ) -> Option<Arc<dyn Fn(&TaskCtx) + Send + Sync>> {
        self.types
            .read()
            .unwrap()
            .get(id as usize)
            .and_then(|t| t.body.clone())
    }

    fn arc(&self) -> Arc<Instance> {
        self.weak
            .get()
            .and_then(Weak::upgrade)
            .expect("instance self-reference not initialized")
    }
}

/// Handle to a task created on this instance.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TaskHandle {
    off: Off,
}

/// Handle to a registered task type.
#[derive(Copy, Clone, Debug)]
pub struct TaskType {
    id: u32,
}

/// The in-body view of the running task, passed to every run callback.
pub struct TaskCtx {
    task: Off,
    exec: u32,
}

/// A process's runtime attachment. Dropping it detaches (join workers,
/// release CPUs, unlink on last out).
pub struct Runtime {
    inner: Arc<Instance>,
}

impl Runtime {
    /// Attaches the calling process to the instance named by `config`,
    /// creating and initializing the shared region if this is the first
    /// attacher. Configuration and environment problems are fatal here
    /// and nowhere else.
    pub fn attach(config: &Config) -> Result<Runtime> {
        let binding = Binding::parse(&config.topology.binding)?;
        let lists = TopologyLists::parse(&config.topology)?;
        let name = shmem::region_name(
            &config.shared_memory.name,
            config.shared_memory.isolation_level,
        );
        let (region, needs_init) = Region::open(
            &name,
            config.shared_memory.size as usize,
            config.shared_memory.start,
        )?;
        if needs_init {
            let host = HostInfo::probe()?;
            let resolved = binding.resolve(&host)?;
            let valid = topology::correct_binding(&resolved)?;
            if valid.is_empty() {
                return Err(Error::Config(format!(
                    "binding {resolved} was rejected wholesale by the scheduler"
                )));
            }
            let plan = TopologyPlan::build(&host, &valid, &lists)?;
            scheduler::init_region(&region, SharedTunables::from_config(config), &plan)?;
            region.publish_ready();
            log::debug!(
                "initialized region {name} with {} cpus",
                plan.ncpus()
            );
        }

        if region.header().ncpus == 0 {
            // READY without a topology means the region belongs to some
            // other (or torn-down) world.
            return Err(Status::NotInitialized.into());
        }

        let pid = nix::unistd::getpid().as_raw();
        let proc_idx = {
            let server = Server::new(&region);
            let idx = server.procs.claim(pid)?;
            scheduler::ensure_rings(&region, &server.procs, idx)?;
            idx
        };

        let inst = Arc::new(Instance {
            region,
            proc_idx,
            pid,
            pool: worker::WorkerPool::new(),
            types: RwLock::new(Vec::new()),
            keeper: StdMutex::new(None),
            stop: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            weak: OnceLock::new(),
        });
        let _ = inst.weak.set(Arc::downgrade(&inst));

        let keeper_inst = Arc::clone(&inst);
        let keeper = match std::thread::Builder::new()
            .name("corral-keeper".into())
            .spawn(move || keeper_main(keeper_inst))
        {
            Ok(j) => j,
            Err(_) => {
                Server::new(&inst.region).procs.release(proc_idx);
                return Err(Error::last_os("spawn"));
            }
        };
        *inst.keeper.lock().unwrap() = Some(keeper);
        inst.region
            .header()
            .attach_count
            .fetch_add(1, Ordering::AcqRel);

        // Claim whatever CPUs are free and staff them. Entitlement policy
        // is not ours: first come, first served; later submitters get
        // CPUs through the starved-owner path or transfers.
        {
            let server = Server::new(&inst.region);
            while let Some(cpu) = server.cpus.pop_free(pid) {
                inst.pool.assign_cpu(&inst, cpu, None);
            }
        }
        log::debug!("pid {pid} attached as process slot {proc_idx}");
        Ok(Runtime { inner: inst })
    }

    /// Detaches explicitly. Equivalent to dropping, but surfaces errors.
    pub fn detach(self) -> Result<()> {
        do_detach(&self.inner);
        Ok(())
    }

    /// Registers a task type with a run callback.
    pub fn register_type(
        &self,
        label: &str,
        body: impl Fn(&TaskCtx) + Send + Sync + 'static,
    ) -> Result<TaskType> {
        self.register(label, Some(Arc::new(body)))
    }

    /// Registers a type with no callback. Tasks of such a type can be
    /// created and destroyed but not submitted.
    pub fn register_bodyless_type(&self, label: &str) -> Result<TaskType> {
        self.register(label, None)
    }

    fn register(
        &self,
        label: &str,
        body: Option<Arc<dyn Fn(&TaskCtx) + Send + Sync>>,
    ) -> Result<TaskType> {
        if label.is_empty() {
            return Err(Status::InvalidParameter.into());
        }
        let mut types = self.inner.types.write().unwrap();
        let id = types.len() as u32;
        types.push(TypeRec {
            label: label.to_string(),
            body,
        });
        Ok(TaskType { id })
    }

    /// Creates a task of `ty` with the given degree (1 = scalar).
    pub fn create_task(&self, ty: &TaskType, degree: u32) -> Result<TaskHandle> {
        self.create_task_with_metadata(ty, degree, &[])
    }

    /// Creates a task carrying an inline metadata block readable from the
    /// body via [`TaskCtx::metadata`].
    pub fn create_task_with_metadata(
        &self,
        ty: &TaskType,
        degree: u32,
        metadata: &[u8],
    ) -> Result<TaskHandle> {
        if (ty.id as usize) >= self.inner.types.read().unwrap().len() {
            return Err(Status::InvalidParameter.into());
        }
        let off = task::create(&self.inner.region, ty.id, self.inner.pid, degree, metadata)?;
        Ok(TaskHandle { off })
    }

    /// Sets (or clears) a task's affinity. Legal only before submission.
    pub fn set_affinity(&self, handle: &TaskHandle, affinity: Option<Affinity>) -> Result<()> {
        if let Some(a) = affinity {
            let server = Server::new(&self.inner.region);
            if server.topo.domain(a.level, a.domain).is_none() {
                return Err(Status::InvalidParameter.into());
            }
        }
        unsafe { task::task(&self.inner.region, handle.off) }.set_affinity(affinity)
    }

    /// Submits a task for execution.
    pub fn submit(&self, handle: &TaskHandle) -> Result<()> {
        submit_inner(&self.inner, handle.off)
    }

    /// Decrements a paused task's blocking count, resubmitting it when
    /// the count reaches zero. The pair for [`TaskCtx::pause`].
    pub fn submit_unblocked(&self, handle: &TaskHandle) -> Result<()> {
        let t = unsafe { task::task(&self.inner.region, handle.off) };
        if t.unblock() {
            worker::resume_task(&self.inner, handle.off);
        }
        Ok(())
    }

    /// Waits for a task to complete. From an external thread this blocks
    /// the thread; from inside a task it pauses the calling task (its CPU
    /// keeps working) until the target completes.
    pub fn wait(&self, handle: &TaskHandle) -> Result<()> {
        let inst = &self.inner;
        let cur = worker::current()
            .filter(|c| core::ptr::eq(c.instance, Arc::as_ptr(inst)));
        match cur {
            Some(cur) => wait_in_task(inst, cur, handle.off),
            None => {
                unsafe { task::task(&inst.region, handle.off) }.wait_external();
                Ok(())
            }
        }
    }

    /// Destroys a task. Legal before submission or after completion.
    pub fn destroy_task(&self, handle: TaskHandle) -> Result<()> {
        task::destroy(&self.inner.region, handle.off)
    }

    /// Has the task reached the completed state?
    pub fn is_completed(&self, handle: &TaskHandle) -> bool {
        unsafe { task::task(&self.inner.region, handle.off) }.state() == STATE_COMPLETED
    }

    /// Is the task's blocking count nonzero? (Observability hook: a true
    /// result means a `submit_unblocked` is owed.)
    pub fn is_blocked(&self, handle: &TaskHandle) -> bool {
        unsafe { task::task(&self.inner.region, handle.off) }.blocking() > 0
    }

    /// Creates a task-blocking mutex in the shared region.
    pub fn mutex(&self) -> Result<Mutex> {
        let off = mutex::create(&self.inner.region)?;
        Ok(Mutex {
            inner: Arc::clone(&self.inner),
            off,
        })
    }

    // --- topology queries -------------------------------------------------

    /// Number of domains at `level`.
    pub fn domain_count(&self, level: Level) -> usize {
        Server::new(&self.inner.region).topo.domains(level).len()
    }

    /// System ids of the domains at `level`, in logical-id order.
    pub fn domain_system_ids(&self, level: Level) -> Vec<u32> {
        Server::new(&self.inner.region)
            .topo
            .domains(level)
            .iter()
            .map(|d| d.system_id)
            .collect()
    }

    /// System id of the current task's domain at `level`. Requires a task
    /// context.
    pub fn current_domain_id(&self, level: Level) -> Result<u32> {
        let cur = worker::current()
            .filter(|c| core::ptr::eq(c.instance, Arc::as_ptr(&self.inner)));
        if cur.is_none() {
            return Err(Status::OutsideTask.into());
        }
        let cpu = worker::current_cpu().ok_or(Error::Code(Status::OutsideTask))?;
        let server = Server::new(&self.inner.region);
        let logical = server.topo.cpu(cpu as u32).parents[level.index()];
        debug_assert!(logical >= 0);
        Ok(server
            .topo
            .domain(level, logical as u32)
            .map(|d| d.system_id)
            .unwrap_or(0))
    }

    /// Number of CPUs bound by this instance.
    pub fn cpu_count(&self) -> usize {
        Server::new(&self.inner.region).topo.ncpus()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        do_detach(&self.inner);
    }
}

impl TaskCtx {
    pub(crate) fn new(task: Off, exec: u32) -> TaskCtx {
        TaskCtx { task, exec }
    }

    fn cur(&self) -> Result<worker::Current> {
        match worker::current() {
            Some(c) if c.task == self.task => Ok(c),
            _ => Err(Status::OutsideTask.into()),
        }
    }

    /// Execution id of this body invocation: 1 for scalar tasks,
    /// `1..=degree` for parallel ones.
    pub fn execution_id(&self) -> u32 {
        self.exec
    }

    /// The task's inline metadata block.
    pub fn metadata(&self) -> &[u8] {
        let Ok(cur) = self.cur() else { return &[] };
        // Safety: the instance outlives the body invocation, and the
        // metadata is immutable after create.
        let inst = unsafe { &*cur.instance };
        let t = unsafe { task::task(&inst.region, self.task) };
        let m = t.metadata(&inst.region);
        // Safety: reborrow to the ctx lifetime; the region outlives it.
        unsafe { core::slice::from_raw_parts(m.as_ptr(), m.len()) }
    }

    /// Pauses the task: raises the blocking count and parks until a
    /// matching [`Runtime::submit_unblocked`] brings it back. The CPU is
    /// handed to another worker meanwhile.
    pub fn pause(&self) -> Result<()> {
        let cur = self.cur()?;
        let inst = unsafe { &*cur.instance };
        let t = unsafe { task::task(&inst.region, self.task) };
        if t.is_parallel() {
            // A parallel body is not alone in its task; the blocking
            // count would not mean anything.
            return Err(Status::InvalidOperation.into());
        }
        t.block();
        worker::pause_current(&inst.arc(), cur);
        Ok(())
    }

    /// Yields the CPU: the task goes back through the scheduler queue and
    /// resumes when dispatched again.
    pub fn yield_now(&self) -> Result<()> {
        let cur = self.cur()?;
        let inst = unsafe { &*cur.instance };
        let t = unsafe { task::task(&inst.region, self.task) };
        if t.is_parallel() {
            return Err(Status::InvalidOperation.into());
        }
        worker::yield_current(&inst.arc(), cur);
        Ok(())
    }

    /// Scheduling point: yields if the quantum expired for this task.
    /// Returns whether a yield happened.
    pub fn yield_checkpoint(&self) -> Result<bool> {
        let cur = self.cur()?;
        let inst = unsafe { &*cur.instance };
        let t = unsafe { task::task(&inst.region, self.task) };
        if t.rec.yield_flag.swap(0, Ordering::AcqRel) == 0 {
            return Ok(false);
        }
        if t.is_parallel() {
            return Ok(false);
        }
        worker::yield_current(&inst.arc(), cur);
        Ok(true)
    }

    /// Submits another (created, not yet submitted) task from inside a
    /// body; the immediate-successor hint applies when enabled.
    pub fn submit(&self, handle: &TaskHandle) -> Result<()> {
        let cur = self.cur()?;
        let inst = unsafe { &*cur.instance };
        submit_inner(&inst.arc(), handle.off)
    }

    /// Waits from inside a body for another task to complete; this task
    /// pauses and its CPU keeps working.
    pub fn wait_for(&self, handle: &TaskHandle) -> Result<()> {
        let cur = self.cur()?;
        let inst = unsafe { &*cur.instance };
        wait_in_task(&inst.arc(), cur, handle.off)
    }

    /// Has the scheduler asked this task to yield?
    pub fn should_yield(&self) -> bool {
        let Ok(cur) = self.cur() else { return false };
        let inst = unsafe { &*cur.instance };
        unsafe { task::task(&inst.region, self.task) }
            .rec
            .yield_flag
            .load(Ordering::Acquire)
            != 0
    }
}

/// A task-blocking mutex shared through the region.
///
/// `lock` from a task that loses the race appends the task to a FIFO wait
/// list and pauses it; `unlock` transfers ownership to the head waiter,
/// handing over the unlocker's CPU directly when the new owner is affine
/// to it.
pub struct Mutex {
    inner: Arc<Instance>,
    off: Off,
}

impl Mutex {
    fn cur_task(&self) -> Result<worker::Current> {
        worker::current()
            .filter(|c| core::ptr::eq(c.instance, Arc::as_ptr(&self.inner)))
            .ok_or_else(|| Status::OutsideTask.into())
    }

    /// Acquires the mutex, pausing the calling task while contended.
    pub fn lock(&self) -> Result<()> {
        let cur = self.cur_task()?;
        let inst = &self.inner;
        let me = unsafe { task::task(&inst.region, cur.task) };
        if me.is_parallel() {
            // The caller would not be the only body holding the mutex.
            return Err(Status::InvalidOperation.into());
        }
        let rec = unsafe { mutex::record(&inst.region, self.off) };

        // Raise the count before the task can appear on the wait list, so
        // an immediate unlock on another CPU cannot underflow it.
        me.block();
        match rec.lock(&inst.region, cur.task) {
            mutex::LockOutcome::Acquired => {
                me.rec.blocking.fetch_sub(1, Ordering::AcqRel);
                Ok(())
            }
            mutex::LockOutcome::MustWait => {
                worker::pause_current(&inst.arc(), cur);
                // Ownership was transferred to us before we were resumed.
                Ok(())
            }
        }
    }

    /// Non-blocking acquire; `Busy` when held elsewhere.
    pub fn try_lock(&self) -> Result<()> {
        let cur = self.cur_task()?;
        let me = unsafe { task::task(&self.inner.region, cur.task) };
        if me.is_parallel() {
            return Err(Status::InvalidOperation.into());
        }
        let rec = unsafe { mutex::record(&self.inner.region, self.off) };
        if rec.try_lock() {
            Ok(())
        } else {
            Err(Status::Busy.into())
        }
    }

    /// Releases the mutex, reviving the next owner if one is queued.
    pub fn unlock(&self) -> Result<()> {
        let cur = self.cur_task()?;
        let inst = &self.inner;
        let rec = unsafe { mutex::record(&inst.region, self.off) };
        let Some(head) = rec.unlock(&inst.region) else {
            return Ok(());
        };
        let ht = unsafe { task::task(&inst.region, head) };
        if !ht.unblock() {
            // Still blocked for other reasons; whoever drops the count to
            // zero resubmits it, already owning the mutex.
            return Ok(());
        }
        let in_place = ht.rec.owner_pid == inst.pid
            && match (worker::current_cpu(), ht.affinity()) {
                (Some(cpu), Some(a)) => {
                    Server::new(&inst.region).topo.covers(a.level, a.domain, cpu as u32)
                }
                _ => false,
            };
        if in_place {
            worker::in_place_yield_to(&inst.arc(), cur, head);
        } else {
            worker::resume_task(&inst.arc(), head);
        }
        Ok(())
    }

    pub fn is_taken(&self) -> bool {
        unsafe { mutex::record(&self.inner.region, self.off) }.is_taken()
    }
}

impl Drop for Mutex {
    fn drop(&mut self) {
        if let Err(e) = mutex::destroy(&self.inner.region, self.off) {
            log::warn!("leaking a live mutex record: {e}");
        }
    }
}

/// In-task wait: the caller pauses (its CPU keeps working) until `target`
/// completes; the completer resumes at most one such waiter.
fn wait_in_task(inst: &Arc<Instance>, cur: worker::Current, target_off: Off) -> Result<()> {
    if cur.task == target_off {
        return Err(Status::InvalidOperation.into());
    }
    let target = unsafe { task::task(&inst.region, target_off) };
    let me = unsafe { task::task(&inst.region, cur.task) };
    if me.is_parallel() {
        return Err(Status::InvalidOperation.into());
    }
    if target.rec.done.load(Ordering::Acquire) != 0 {
        return Ok(());
    }

    me.block();
    if target
        .rec
        .waiter_task
        .compare_exchange(0, cur.task, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        // One in-task waiter per task.
        me.rec.blocking.fetch_sub(1, Ordering::AcqRel);
        return Err(Status::InvalidOperation.into());
    }
    if target.rec.done.load(Ordering::Acquire) != 0 {
        // Completion raced our registration. Whoever wins the word owns
        // the wake-up: if we get it back, nobody will resume us.
        if target
            .rec
            .waiter_task
            .compare_exchange(cur.task, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            me.rec.blocking.fetch_sub(1, Ordering::AcqRel);
            return Ok(());
        }
    }
    worker::pause_current(&inst.arc(), cur);
    Ok(())
}

/// Shared submit path for [`Runtime::submit`] and [`TaskCtx::submit`].
fn submit_inner(inst: &Arc<Instance>, off: Off) -> Result<()> {
    let t = unsafe { task::task(&inst.region, off) };
    if inst.type_body(t.rec.type_id).is_none() {
        return Err(Status::InvalidCallback.into());
    }
    if !t.try_transition(STATE_CREATED, STATE_SUBMITTED) {
        return Err(Status::InvalidOperation.into());
    }

    let server = Server::new(&inst.region);
    let cur = worker::current().filter(|c| core::ptr::eq(c.instance, Arc::as_ptr(inst)));
    if let Some(cur) = cur {
        // Immediate-successor hint: hand the task straight to this CPU at
        // the current body's completion.
        if server.tunables.immediate_successor != 0 {
            if let (Some(cpu), Some(a)) = (worker::current_cpu(), t.affinity()) {
                if server.topo.covers(a.level, a.domain, cpu as u32)
                    && worker::try_stash_successor(cur, off)
                {
                    return Ok(());
                }
            }
        }
    }
    server.enqueue(inst.proc_idx, off, cur.and_then(|_| worker::current_cpu()));
    Ok(())
}

// --- keeper and detach ----------------------------------------------------

/// Watches the hand-off mailbox: every grant puts a worker on the granted
/// CPU, running any task that rode along.
fn keeper_main(inst: Arc<Instance>) {
    let server = Server::new(&inst.region);
    let idx = inst.proc_idx;
    loop {
        let seen = server.procs.mail_seq(idx);
        for cpu in 0..server.cpus.ncpus() {
            if let Some(v) = server.procs.take_mailbox(idx, cpu) {
                if inst.stop.load(Ordering::Acquire) {
                    // Late grant during shutdown: give the CPU back.
                    if v != proc::MAIL_GRANT {
                        log::warn!("dropping task hand-off during detach");
                    }
                    server.cpus.mark_free(cpu);
                    continue;
                }
                let direct = (v != proc::MAIL_GRANT).then_some(v);
                log::trace!("keeper: cpu {cpu} granted (task: {})", direct.is_some());
                if !inst.pool.assign_cpu(&inst, cpu, direct) {
                    // Shutdown began under us; behave like the late-grant
                    // path above.
                    if direct.is_some() {
                        log::warn!("dropping task hand-off during detach");
                    }
                    server.cpus.mark_free(cpu);
                }
            }
        }
        if inst.stop.load(Ordering::Acquire) {
            break;
        }
        server.procs.wait_mail(idx, seen);
    }
}

fn do_detach(inst: &Arc<Instance>) {
    if inst.detached.swap(true, Ordering::AcqRel) {
        return;
    }
    let server = Server::new(&inst.region);
    let pid = inst.pid;
    log::debug!("pid {pid} detaching");

    // 1. Stop our workers. They may be parked on waiter-slot futexes, and
    // a foreign holder can re-park them, so the wake runs until they are
    // all gone.
    let owned_then = server.cpus.owned_by(pid);
    inst.pool.shutdown(|| {
        for cpu in server.cpus.owned_by(pid).iter() {
            server.lock.wake_slot(cpu);
        }
        for cpu in owned_then.iter() {
            server.lock.wake_slot(cpu);
        }
    });

    // 2. Release our CPUs: to a process with a use for them when there is
    // one, to the free pool otherwise. The raw lock also serializes this
    // against other detachers' slot scans.
    server.lock.acquire_raw();
    for cpu in server.cpus.owned_by(pid).iter() {
        if let Some(lost) = server.lock.retire_slot(cpu) {
            // Can only be one of our own tasks, which the contract says
            // should all have completed.
            log::error!("task {lost:#x} was in flight to cpu {cpu} at detach");
        }
        server.sched.gov.waiters.clear(cpu);
        server.sched.gov.sleepers.clear(cpu);
        match server.claim_for_transfer(cpu, pid) {
            Some((to, task)) => {
                if !server.cpus.transfer(&server.procs, to, cpu, task) {
                    server.cpus.mark_free(cpu);
                }
            }
            None => server.cpus.mark_free(cpu),
        }
    }
    // 3. Stop the keeper while still serialized, then release the slot.
    inst.stop.store(true, Ordering::Release);
    server.procs.kick_keeper(inst.proc_idx);
    server.lock.release();

    if let Some(join) = inst.keeper.lock().unwrap().take() {
        let _ = join.join();
    }
    // Residual grants that arrived after the keeper quit.
    for cpu in 0..server.cpus.ncpus() {
        if server.procs.take_mailbox(inst.proc_idx, cpu).is_some() {
            server.cpus.mark_free(cpu);
        }
    }
    server.procs.release(inst.proc_idx);

    // 4. Last one out unlinks the name.
    let left = inst
        .region
        .header()
        .attach_count
        .fetch_sub(1, Ordering::AcqRel)
        - 1;
    if left == 0 {
        inst.region.unlink();
        log::debug!("pid {pid} was the last attachment; region unlinked");
    }
}
