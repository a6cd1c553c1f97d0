// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The scheduler core.
//!
//! Submission is multi-producer: every worker owns an SPSC input ring
//! (bucketed by CPU), with a spinlock-protected overflow FIFO behind it,
//! so a submit never blocks on another producer. Service is single
//! consumer: whoever holds the delegation lock drains the rings in bounded
//! batches, matches ready tasks to waiting CPUs using the affinity rules,
//! enforces the quantum, and hands tasks out through the waiter slots.
//!
//! Assignment order for a CPU, per pass:
//!
//! 1. the oldest ready task *strictly* affine to a domain covering it;
//! 2. the oldest task *preferring* a covering domain;
//! 3. any eligible task, preferring locality to the task's last CPU
//!    (same core > same complex set > same NUMA node > same node);
//! 4. nothing — the governor decides between *try-again* and parking.
//!
//! A task is only ever matched to a CPU owned by the task's own process;
//! run callbacks do not cross the process boundary.

use core::sync::atomic::{AtomicU64, Ordering};

use abi::{AffinityPolicy, MAX_PROCS};
use spscq::Spsc;

use crate::cpu::{self, CpuManager};
use crate::dlock::{self, LockView, ITEM_TRY_AGAIN};
use crate::governor::{self, Governor, GovernorShared, Verdict};
use crate::proc::{self, ringblk, ProcTable};
use crate::shmem::{Off, Region, SharedTunables};
use crate::task::{self, STATE_READY, STATE_RUNNING, STATE_SUBMITTED};
use crate::topology::{TopologyPlan, TopologyView};

/// Per-CPU record of what is executing, for quantum enforcement. Written
/// by the worker that starts/ends a body invocation.
#[repr(C)]
pub struct RunSlot {
    pub task: AtomicU64,
    pub start_ns: AtomicU64,
}

/// Region-resident server state: the delegation lock, the governor, and
/// the ready FIFO (intrusive through `TaskRecord::sched_next`,
/// holder-only).
#[repr(C)]
pub struct SchedShared {
    pub lock: dlock::DelegationLock,
    pub gov: GovernorShared,
    ready_head: AtomicU64,
    ready_tail: AtomicU64,
    /// Offset of `[RunSlot; ncpus]`.
    run_off: Off,
}

/// Monotonic wall clock in nanoseconds, comparable across the processes
/// of one machine.
pub fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // Safety: plain clock read into a local.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Initializes every region-resident structure of one instance: topology
/// arenas, owner vector, waiter slots, server state, run table, process
/// slots. Called by the first attacher, under the region's init lock.
pub fn init_region(
    region: &Region,
    tunables: SharedTunables,
    plan: &TopologyPlan,
) -> crate::err::Result<()> {
    let ncpus = plan.ncpus();
    let topology_off = plan.write_into(region)?;

    let owners_off = region.alloc(ncpus * 4, 4)?;
    let slots_off = region.alloc(
        ncpus * core::mem::size_of::<dlock::WaiterSlot>(),
        core::mem::align_of::<dlock::WaiterSlot>(),
    )?;
    let sched_off = region.alloc(
        core::mem::size_of::<SchedShared>(),
        core::mem::align_of::<SchedShared>(),
    )?;
    let run_off = region.alloc(ncpus * core::mem::size_of::<RunSlot>(), 8)?;
    let procs_off = region.alloc(proc::table_size(), 8)?;

    // Safety: all freshly allocated inside the region; we are the sole
    // initializer (init file lock).
    unsafe {
        cpu::init_in_place(region.at_ptr(owners_off), ncpus);
        let sched = region.at_ptr::<SchedShared>(sched_off);
        dlock::init_in_place(
            core::ptr::addr_of_mut!((*sched).lock),
            region.at_ptr(slots_off),
            ncpus,
        );
        governor::init_in_place(core::ptr::addr_of_mut!((*sched).gov));
        core::ptr::addr_of_mut!((*sched).ready_head).write(AtomicU64::new(0));
        core::ptr::addr_of_mut!((*sched).ready_tail).write(AtomicU64::new(0));
        core::ptr::addr_of_mut!((*sched).run_off).write(run_off);
        for i in 0..ncpus {
            region
                .at_ptr::<RunSlot>(run_off + (i * core::mem::size_of::<RunSlot>()) as u64)
                .write(RunSlot {
                    task: AtomicU64::new(0),
                    start_ns: AtomicU64::new(0),
                });
        }
        proc::init_in_place(region.at_ptr(procs_off));

        let h = region.at_ptr::<crate::shmem::RegionHeader>(0);
        (*h).ncpus = ncpus as u32;
        (*h).rings_per_proc = ncpus.div_ceil(tunables.cpus_per_queue as usize) as u32;
        (*h).tunables = tunables;
        (*h).topology_off = topology_off;
        (*h).owners_off = owners_off;
        (*h).slots_off = slots_off;
        (*h).sched_off = sched_off;
        (*h).procs_off = procs_off;
    }
    Ok(())
}

/// Allocates one process's input ring block (idempotent per slot: reused
/// across re-attachments of the slot).
pub fn ensure_rings(region: &Region, procs: &ProcTable<'_>, idx: usize) -> crate::err::Result<()> {
    let header = region.header();
    let slot = procs.slot(idx);
    if slot.rings_off.load(Ordering::Acquire) != 0 {
        return Ok(());
    }
    let cap = header.tunables.in_queue_size as usize;
    let block = region.alloc(
        ringblk::block_size(header.rings_per_proc as usize, cap),
        8,
    )?;
    // Rings come out of fresh zero memory; head == tail == 0 is the empty
    // ring, so no further initialization is needed.
    slot.rings_off.store(block, Ordering::Release);
    Ok(())
}

/// Everything a thread needs to talk to one instance. Cheap to construct;
/// all fields are views into the region.
#[derive(Copy, Clone)]
pub struct Server<'r> {
    pub region: &'r Region,
    pub topo: TopologyView<'r>,
    pub cpus: CpuManager<'r>,
    pub procs: ProcTable<'r>,
    pub lock: LockView<'r>,
    pub sched: &'r SchedShared,
    pub tunables: SharedTunables,
}

impl<'r> Server<'r> {
    /// Builds the view bundle from a READY region.
    pub fn new(region: &'r Region) -> Server<'r> {
        let header = region.header();
        let ncpus = header.ncpus as usize;
        // Safety: the header offsets were written by `init_region` before
        // the region was published READY; the layouts match by
        // construction.
        unsafe {
            let sched: &SchedShared = region.at(header.sched_off);
            Server {
                region,
                topo: TopologyView::from_region(region, header.topology_off),
                cpus: CpuManager::new(region.slice(header.owners_off, ncpus)),
                procs: ProcTable::new(region.slice(header.procs_off, MAX_PROCS)),
                lock: LockView::new(&sched.lock, region.slice(header.slots_off, ncpus)),
                sched,
                tunables: header.tunables,
            }
        }
    }

    pub fn governor(&self) -> Governor<'r> {
        Governor::new(
            self.tunables.policy(),
            self.tunables.governor_spins,
            &self.sched.gov,
        )
    }

    fn run_slot(&self, cpu: usize) -> &'r RunSlot {
        // Safety: run table written by `init_region`.
        unsafe {
            self.region.at(
                self.sched.run_off + (cpu * core::mem::size_of::<RunSlot>()) as u64,
            )
        }
    }

    /// Worker bookkeeping: a body invocation begins on `cpu`.
    pub fn note_run_start(&self, cpu: usize, off: Off) {
        let slot = self.run_slot(cpu);
        slot.start_ns.store(monotonic_ns(), Ordering::Relaxed);
        slot.task.store(off, Ordering::Release);
    }

    /// Worker bookkeeping: the invocation on `cpu` ended.
    pub fn note_run_end(&self, cpu: usize) {
        self.run_slot(cpu).task.store(0, Ordering::Release);
    }

    // --- submission side -------------------------------------------------

    /// Ring bucket for a producer on `cpu`.
    fn bucket(&self, cpu: usize) -> usize {
        cpu / self.tunables.cpus_per_queue as usize
    }

    /// Enqueues a submitted task. `from_cpu` names the producer's pinned
    /// CPU; producers with no pinned CPU (external threads) go straight to
    /// the overflow FIFO, which tolerates multiple producers.
    ///
    /// The task must already be in the submitted state.
    pub fn enqueue(&self, proc_idx: usize, off: Off, from_cpu: Option<usize>) {
        debug_assert_eq!(
            unsafe { task::task(self.region, off) }.state(),
            STATE_SUBMITTED
        );
        if let Some(cpu) = from_cpu {
            unsafe { task::task(self.region, off) }
                .rec
                .last_cpu
                .store(cpu as i32, Ordering::Relaxed);
        }
        let slot = self.procs.slot(proc_idx);
        let pushed = match from_cpu {
            Some(cpu) if slot.overflow.head.load(Ordering::Acquire) == 0 => {
                let ring = self.ring(proc_idx, self.bucket(cpu));
                ring.push(off).is_ok()
            }
            _ => false,
        };
        if !pushed {
            self.overflow_push(proc_idx, off);
        }
        // Pairs with the fence a parking worker issues between priming
        // its slot for sleep and re-checking the input queues: either our
        // push is visible to that re-check, or its sleep command is
        // visible to wake-one.
        core::sync::atomic::fence(Ordering::SeqCst);
        self.governor().wake_one(&self.lock);
    }

    /// Is anything sitting in an input ring or overflow list? Used by the
    /// last parking worker to close the submit/park race; a false
    /// negative is impossible after a `SeqCst` fence on both sides.
    pub fn inputs_pending(&self) -> bool {
        let nrings = self.region.header().rings_per_proc as usize;
        for idx in self.procs.attached() {
            let slot = self.procs.slot(idx);
            if slot.overflow.head.load(Ordering::Acquire) != 0 {
                return true;
            }
            if slot.rings_off.load(Ordering::Acquire) == 0 {
                continue;
            }
            for bucket in 0..nrings {
                if !self.ring(idx, bucket).is_empty() {
                    return true;
                }
            }
        }
        false
    }

    fn ring(&self, proc_idx: usize, bucket: usize) -> Spsc<'r> {
        let header = self.region.header();
        let cap = header.tunables.in_queue_size as usize;
        let block = self.procs.slot(proc_idx).rings_off.load(Ordering::Acquire);
        debug_assert_ne!(block, 0, "enqueue before ensure_rings");
        // Safety: the ring block layout is fixed by `ensure_rings`.
        unsafe {
            Spsc::new(
                self.region.at(ringblk::header_off(block, bucket, cap)),
                self.region.slice(ringblk::slots_off(block, bucket, cap), cap + 1),
            )
        }
    }

    fn overflow_push(&self, proc_idx: usize, off: Off) {
        let of = &self.procs.slot(proc_idx).overflow;
        while of
            .lock
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        let t = unsafe { task::task(self.region, off) };
        t.rec.sched_next.store(0, Ordering::Relaxed);
        let tail = of.tail.load(Ordering::Relaxed);
        if tail == 0 {
            of.head.store(off, Ordering::Release);
        } else {
            unsafe { task::task(self.region, tail) }
                .rec
                .sched_next
                .store(off, Ordering::Relaxed);
        }
        of.tail.store(off, Ordering::Relaxed);
        of.lock.store(0, Ordering::Release);
    }

    fn overflow_pop(&self, proc_idx: usize) -> Option<Off> {
        let of = &self.procs.slot(proc_idx).overflow;
        if of.head.load(Ordering::Acquire) == 0 {
            return None;
        }
        while of
            .lock
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        let head = of.head.load(Ordering::Relaxed);
        let out = if head == 0 {
            None
        } else {
            let next = unsafe { task::task(self.region, head) }
                .rec
                .sched_next
                .swap(0, Ordering::Relaxed);
            of.head.store(next, Ordering::Relaxed);
            if next == 0 {
                of.tail.store(0, Ordering::Relaxed);
            }
            Some(head)
        };
        of.lock.store(0, Ordering::Release);
        out
    }

    // --- server side (call only while holding the delegation lock) -------

    /// Drains input rings and overflow lists in a bounded batch, moving
    /// tasks into the ready FIFO.
    pub fn drain_inputs(&self) {
        let mut budget = self.tunables.queue_batch as usize;
        let nrings = self.region.header().rings_per_proc as usize;
        for idx in self.procs.attached() {
            if self.procs.slot(idx).rings_off.load(Ordering::Acquire) == 0 {
                continue;
            }
            for bucket in 0..nrings {
                let ring = self.ring(idx, bucket);
                while budget > 0 {
                    match ring.pop() {
                        Some(off) => {
                            self.admit(off);
                            budget -= 1;
                        }
                        None => break,
                    }
                }
            }
            while budget > 0 {
                match self.overflow_pop(idx) {
                    Some(off) => {
                        self.admit(off);
                        budget -= 1;
                    }
                    None => break,
                }
            }
            if budget == 0 {
                return;
            }
        }
    }

    /// A submitted task enters the server's view.
    fn admit(&self, off: Off) {
        let t = unsafe { task::task(self.region, off) };
        t.transition(STATE_SUBMITTED, STATE_READY);
        self.ready_push(off);
    }

    fn ready_push(&self, off: Off) {
        let t = unsafe { task::task(self.region, off) };
        t.rec.sched_next.store(0, Ordering::Relaxed);
        let tail = self.sched.ready_tail.load(Ordering::Relaxed);
        if tail == 0 {
            self.sched.ready_head.store(off, Ordering::Relaxed);
        } else {
            unsafe { task::task(self.region, tail) }
                .rec
                .sched_next
                .store(off, Ordering::Relaxed);
        }
        self.sched.ready_tail.store(off, Ordering::Relaxed);
    }

    /// FIFO iteration of the ready queue.
    fn ready_iter(&self) -> ReadyIter<'_, 'r> {
        ReadyIter {
            server: self,
            cursor: self.sched.ready_head.load(Ordering::Relaxed),
        }
    }

    fn ready_unlink(&self, prev: Off, off: Off) {
        let next = unsafe { task::task(self.region, off) }
            .rec
            .sched_next
            .swap(0, Ordering::Relaxed);
        if prev == 0 {
            self.sched.ready_head.store(next, Ordering::Relaxed);
        } else {
            unsafe { task::task(self.region, prev) }
                .rec
                .sched_next
                .store(next, Ordering::Relaxed);
        }
        if next == 0 {
            self.sched.ready_tail.store(prev, Ordering::Relaxed);
        }
    }

    pub fn ready_is_empty(&self) -> bool {
        self.sched.ready_head.load(Ordering::Relaxed) == 0
    }

    /// Can `owner` run `t` on `cpu`? Strict affinity is a hard wall;
    /// everything else is eligible. A resumed task (bound to a parked
    /// worker) has spent all its dispatches already and is still
    /// eligible: dispatch then means "revive", not "invoke".
    fn eligible(&self, t: task::Task<'_>, cpu: usize, owner: i32) -> bool {
        if t.rec.owner_pid != owner {
            return false;
        }
        let resumed = t.rec.bound_worker.load(Ordering::Acquire) != 0;
        if !resumed && t.rec.dispatched.load(Ordering::Relaxed) >= t.rec.degree {
            return false;
        }
        match t.affinity() {
            Some(a) if a.policy == AffinityPolicy::Strict => {
                self.topo.covers(a.level, a.domain, cpu as u32)
            }
            _ => true,
        }
    }

    /// Picks (without removing) the task the affinity rules give `cpu`,
    /// assuming `owner` will run it. Returns `(prev, off)` for unlinking.
    fn pick(&self, cpu: usize, owner: i32) -> Option<(Off, Off)> {
        // Pass 1: strict affinity, FIFO.
        let mut prev = 0;
        for off in self.ready_iter() {
            let t = unsafe { task::task(self.region, off) };
            if self.eligible(t, cpu, owner) {
                if let Some(a) = t.affinity() {
                    if a.policy == AffinityPolicy::Strict
                        && self.topo.covers(a.level, a.domain, cpu as u32)
                    {
                        return Some((prev, off));
                    }
                }
            }
            prev = off;
        }
        // Pass 2: preferred affinity over a covering domain, FIFO.
        prev = 0;
        for off in self.ready_iter() {
            let t = unsafe { task::task(self.region, off) };
            if self.eligible(t, cpu, owner) {
                if let Some(a) = t.affinity() {
                    if a.policy == AffinityPolicy::Preferred
                        && self.topo.covers(a.level, a.domain, cpu as u32)
                    {
                        return Some((prev, off));
                    }
                }
            }
            prev = off;
        }
        // Pass 3: anything eligible, closest first, FIFO among equals.
        let mut best: Option<(Off, Off, u32)> = None;
        prev = 0;
        for off in self.ready_iter() {
            let t = unsafe { task::task(self.region, off) };
            if self.eligible(t, cpu, owner) {
                let last = t.rec.last_cpu.load(Ordering::Relaxed);
                let close = if last >= 0 {
                    self.topo.closeness(last as u32, cpu as u32)
                } else {
                    0
                };
                if best.map_or(true, |(_, _, b)| close > b) {
                    best = Some((prev, off, close));
                }
            }
            prev = off;
        }
        best.map(|(p, o, _)| (p, o))
    }

    /// Claims one body invocation of a picked task: bumps the dispatch
    /// count, unlinks the task once fully claimed, and moves it to
    /// running. Returns the execution id (1-based), or 0 for the revival
    /// of a paused/yielded body (which is not a new invocation).
    fn claim(&self, prev: Off, off: Off) -> u32 {
        let t = unsafe { task::task(self.region, off) };
        if t.rec.bound_worker.load(Ordering::Acquire) != 0 {
            self.ready_unlink(prev, off);
            t.try_transition(STATE_READY, STATE_RUNNING);
            return 0;
        }
        let exec = t.rec.dispatched.fetch_add(1, Ordering::AcqRel) + 1;
        debug_assert!(exec <= t.rec.degree);
        if exec == t.rec.degree {
            self.ready_unlink(prev, off);
        }
        // First claim moves ready → running; later parallel claims find it
        // already running.
        t.try_transition(STATE_READY, STATE_RUNNING);
        exec
    }

    /// One full server pass; the caller holds the delegation lock as the
    /// worker on `my_cpu` (or holds it raw with `my_cpu == None`).
    /// Returns this CPU's own assignment, if any.
    pub fn server_pass(&self, my_cpu: Option<usize>) -> Option<(Off, u32)> {
        self.drain_inputs();

        let gov = self.governor();
        gov.refresh_waiters(&self.lock);

        // Serve every camped waiter, parked or spinning.
        for cpu in 0..self.lock.ncpus() {
            if Some(cpu) == my_cpu || !self.lock.is_present(cpu) {
                continue;
            }
            let owner = self.cpus.owner(cpu);
            match self.pick(cpu, owner) {
                Some((prev, off)) => {
                    let exec = self.claim(prev, off);
                    gov.on_served(cpu);
                    self.lock.serve(cpu, off, exec);
                }
                None => {
                    if self.sched.gov.sleepers.contains(cpu) {
                        // Already parked; leave it be.
                        continue;
                    }
                    match gov.on_unserved(cpu) {
                        Verdict::Release => self.lock.serve(cpu, ITEM_TRY_AGAIN, 0),
                        Verdict::Park => self.lock.tell_sleep(cpu),
                    }
                }
            }
        }

        self.enforce_quantum();
        self.claim_for_starved();

        // Finally, ourselves.
        let cpu = my_cpu?;
        let owner = self.cpus.owner(cpu);
        let (prev, off) = self.pick(cpu, owner)?;
        let exec = self.claim(prev, off);
        gov.on_served(cpu);
        Some((off, exec))
    }

    /// Quantum: a body past its budget on a CPU that has another eligible
    /// ready task is signaled to yield at its next scheduling point.
    fn enforce_quantum(&self) {
        let quantum = self.tunables.quantum_ns;
        if quantum == 0 {
            return;
        }
        let now = monotonic_ns();
        for cpu in 0..self.cpus.ncpus() {
            let slot = self.run_slot(cpu);
            let off = slot.task.load(Ordering::Acquire);
            if off == 0 {
                continue;
            }
            if now.saturating_sub(slot.start_ns.load(Ordering::Relaxed)) <= quantum {
                continue;
            }
            let owner = self.cpus.owner(cpu);
            if self.pick(cpu, owner).is_some() {
                unsafe { task::task(self.region, off) }
                    .rec
                    .yield_flag
                    .store(1, Ordering::Release);
            }
        }
    }

    /// A ready task whose owner holds no CPU starves forever unless
    /// someone intervenes; if a CPU is free, claim it for the owner
    /// through the transfer path.
    fn claim_for_starved(&self) {
        let mut seen_pids: Vec<i32> = Vec::new();
        for off in self.ready_iter() {
            let t = unsafe { task::task(self.region, off) };
            let pid = t.rec.owner_pid;
            if seen_pids.contains(&pid) || self.cpus.owns_any(pid) {
                continue;
            }
            seen_pids.push(pid);
            let Some(free) = self.find_free_for(t) else {
                continue;
            };
            if self.cpus.claim(free, pid) {
                if self.cpus.transfer(&self.procs, pid, free, None) {
                    log::debug!("granted idle cpu {free} to starved pid {pid}");
                } else {
                    // Owner raced us out of the process table.
                    self.cpus.mark_free(free);
                }
            }
        }
    }

    fn find_free_for(&self, t: task::Task<'_>) -> Option<usize> {
        match t.affinity() {
            Some(a) if a.policy == AffinityPolicy::Strict => (0..self.cpus.ncpus())
                .find(|&c| {
                    self.cpus.owner(c) == cpu::FREE
                        && self.topo.covers(a.level, a.domain, c as u32)
                }),
            _ => self.cpus.first_free(),
        }
    }

    /// Detach support: find a task another attached process has ready for
    /// `cpu`, claim one invocation of it, and name the new owner. Called
    /// under the lock by the detaching process.
    ///
    /// The mailbox carries only the task offset, so fresh parallel tasks
    /// (whose execution id could not ride along) are left for normal
    /// scheduling; the grant alone is enough to get them picked up.
    pub fn claim_for_transfer(&self, cpu: usize, excluding_pid: i32) -> Option<(i32, Option<Off>)> {
        let pids: Vec<i32> = self
            .procs
            .attached()
            .map(|i| self.procs.slot(i).pid())
            .filter(|&p| p != excluding_pid && p > 0)
            .collect();
        for pid in pids {
            if let Some((prev, off)) = self.pick(cpu, pid) {
                let t = unsafe { task::task(self.region, off) };
                let resumed = t.rec.bound_worker.load(Ordering::Acquire) != 0;
                if !resumed && t.rec.degree > 1 {
                    return Some((pid, None));
                }
                let _ = self.claim(prev, off);
                return Some((pid, Some(off)));
            }
        }
        None
    }
}

struct ReadyIter<'a, 'r> {
    server: &'a Server<'r>,
    cursor: Off,
}

impl Iterator for ReadyIter<'_, '_> {
    type Item = Off;

    fn next(&mut self) -> Option<Off> {
        if self.cursor == 0 {
            return None;
        }
        let off = self.cursor;
        self.cursor = unsafe { task::task(self.server.region, off) }
            .rec
            .sched_next
            .load(Ordering::Relaxed);
        Some(off)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::{Affinity, AffinityPolicy, Config, Level};
    use cpuset::CpuSet;

    use crate::dlock::Acquired;
    use crate::topology::{HostInfo, TopologyLists};

    /// Builds a READY region with a 4-CPU instance: two cores {0,1} and
    /// {2,3}, NUMA node 0 = {0,1}, node 1 = {2,3}.
    fn instance(tag: &str, tune: impl FnOnce(&mut Config)) -> Region {
        let name = format!(
            "/corral-sched-test-{}-{tag}",
            nix::unistd::getpid().as_raw()
        );
        let cname = std::ffi::CString::new(name.clone()).unwrap();
        unsafe { libc::shm_unlink(cname.as_ptr()) };
        let (region, fresh) = Region::open(&name, 4 << 20, 0).unwrap();
        assert!(fresh);

        let mut siblings = vec![CpuSet::empty(); CpuSet::CAPACITY];
        for cpu in 0..4usize {
            let base = cpu / 2 * 2;
            siblings[cpu] = [base, base + 1].into_iter().collect();
        }
        let host = HostInfo {
            online: CpuSet::first_n(4),
            affinity: CpuSet::first_n(4),
            siblings,
            numa_nodes: Some(vec!["0-1".parse().unwrap(), "2-3".parse().unwrap()]),
        };
        let plan =
            TopologyPlan::build(&host, &CpuSet::first_n(4), &TopologyLists::default())
                .unwrap();

        let mut config = Config::default();
        tune(&mut config);
        init_region(&region, SharedTunables::from_config(&config), &plan).unwrap();
        region.publish_ready();
        region.unlink();
        region
    }

    fn attach_proc(server: &Server<'_>, pid: i32) -> usize {
        let idx = server.procs.claim(pid).unwrap();
        ensure_rings(server.region, &server.procs, idx).unwrap();
        idx
    }

    fn mk_task(server: &Server<'_>, pid: i32, affinity: Option<Affinity>) -> Off {
        let off = task::create(server.region, 0, pid, 1, b"").unwrap();
        let t = unsafe { task::task(server.region, off) };
        t.set_affinity(affinity).unwrap();
        t.transition(task::STATE_CREATED, STATE_SUBMITTED);
        off
    }

    #[test]
    fn drain_moves_submissions_to_ready_in_order() {
        let region = instance("drain", |_| {});
        let server = Server::new(&region);
        let idx = attach_proc(&server, 10);

        let a = mk_task(&server, 10, None);
        let b = mk_task(&server, 10, None);
        server.enqueue(idx, a, Some(0));
        server.enqueue(idx, b, Some(0));

        server.lock.acquire_raw();
        server.drain_inputs();
        let order: Vec<Off> = server.ready_iter().collect();
        assert_eq!(order, [a, b]);
        assert_eq!(unsafe { task::task(&region, a) }.state(), STATE_READY);
        server.lock.release();
    }

    #[test]
    fn ring_overflow_takes_the_overflow_path_and_preserves_order() {
        let region = instance("overflow", |c| {
            c.scheduler.in_queue_size = 2;
        });
        let server = Server::new(&region);
        let idx = attach_proc(&server, 10);

        let tasks: Vec<Off> = (0..6).map(|_| mk_task(&server, 10, None)).collect();
        for &off in &tasks {
            server.enqueue(idx, off, Some(0));
        }

        server.lock.acquire_raw();
        server.drain_inputs();
        server.lock.release();
        let order: Vec<Off> = server.ready_iter().collect();
        // Ring first (its capacity worth), then the overflow FIFO; each
        // channel is FIFO.
        assert_eq!(order.len(), 6);
        assert_eq!(order[0], tasks[0]);
        let mut sorted = order.clone();
        sorted.sort();
        let mut expect = tasks.clone();
        expect.sort();
        assert_eq!(sorted, expect);
    }

    #[test]
    fn strict_affinity_never_crosses_its_domain() {
        let region = instance("strict", |_| {});
        let server = Server::new(&region);
        let idx = attach_proc(&server, 10);
        for cpu in 0..4 {
            assert!(server.cpus.claim(cpu, 10));
        }

        // Strict to NUMA node 0 (cpus 0,1 — logical ids of that node).
        let numa0 = Affinity {
            level: Level::Numa,
            domain: 0,
            policy: AffinityPolicy::Strict,
        };
        let off = mk_task(&server, 10, Some(numa0));
        server.enqueue(idx, off, Some(2));

        server.lock.acquire_raw();
        server.drain_inputs();
        // CPUs 2 and 3 are outside the domain: nothing for them even
        // though they are idle.
        let node1_cpus: Vec<usize> = (0..4)
            .filter(|&c| server.topo.cpu(c as u32).parents[Level::Numa.index()] == 1)
            .collect();
        for &c in &node1_cpus {
            assert!(server.pick(c, 10).is_none());
        }
        let node0_cpu = (0..4)
            .find(|&c| server.topo.cpu(c as u32).parents[Level::Numa.index()] == 0)
            .unwrap();
        assert!(server.pick(node0_cpu, 10).is_some());
        server.lock.release();
    }

    #[test]
    fn tasks_only_match_their_owners_cpus() {
        let region = instance("owner", |_| {});
        let server = Server::new(&region);
        let p = attach_proc(&server, 10);
        let _q = attach_proc(&server, 20);
        assert!(server.cpus.claim(0, 10));
        assert!(server.cpus.claim(1, 20));

        let off = mk_task(&server, 20, None);
        server.enqueue(p, off, Some(0));
        server.lock.acquire_raw();
        server.drain_inputs();
        assert!(server.pick(0, server.cpus.owner(0)).is_none());
        assert!(server.pick(1, server.cpus.owner(1)).is_some());
        server.lock.release();
    }

    #[test]
    fn parallel_task_dispatches_degree_times_with_distinct_ids() {
        let region = instance("parallel", |_| {});
        let server = Server::new(&region);
        let idx = attach_proc(&server, 10);
        for cpu in 0..4 {
            assert!(server.cpus.claim(cpu, 10));
        }

        let off = task::create(&region, 0, 10, 3, b"").unwrap();
        let t = unsafe { task::task(&region, off) };
        t.transition(task::STATE_CREATED, STATE_SUBMITTED);
        server.enqueue(idx, off, Some(0));

        server.lock.acquire_raw();
        server.drain_inputs();
        let mut ids = Vec::new();
        for cpu in 0..4 {
            if let Some((prev, got)) = server.pick(cpu, 10) {
                assert_eq!(got, off);
                ids.push(server.claim(prev, got));
            }
        }
        server.lock.release();
        // Exactly three claims; the fourth CPU found the queue empty.
        assert_eq!(ids, [1, 2, 3]);
        assert!(server.ready_is_empty());
    }

    #[test]
    fn locality_tie_break_prefers_the_submitters_core() {
        let region = instance("local", |_| {});
        let server = Server::new(&region);
        let idx = attach_proc(&server, 10);
        for cpu in 0..4 {
            assert!(server.cpus.claim(cpu, 10));
        }

        // Two unconstrained tasks, one submitted from each core.
        let far = mk_task(&server, 10, None);
        let near = mk_task(&server, 10, None);
        // `far` first so FIFO alone would hand it out first.
        server.enqueue(idx, far, Some(3));
        server.enqueue(idx, near, Some(0));

        server.lock.acquire_raw();
        server.drain_inputs();
        // CPU sharing a core with 0 prefers `near` despite FIFO.
        let sibling = (0..4)
            .find(|&c| c != 0 && server.topo.closeness(c as u32, 0) >= 4)
            .unwrap();
        let (prev, got) = server.pick(sibling, 10).unwrap();
        assert_eq!(got, near);
        let _ = server.claim(prev, got);
        // The far CPU then gets the remaining task.
        let (prev, got) = server.pick(3, 10).unwrap();
        assert_eq!(got, far);
        let _ = server.claim(prev, got);
        server.lock.release();
    }

    #[test]
    fn quantum_flags_overstaying_tasks_only_under_contention() {
        let region = instance("quantum", |c| {
            c.scheduler.quantum_ns = 1; // everything is overdue
        });
        let server = Server::new(&region);
        let idx = attach_proc(&server, 10);
        assert!(server.cpus.claim(0, 10));

        let running = mk_task(&server, 10, None);
        let t = unsafe { task::task(&region, running) };
        t.transition(STATE_SUBMITTED, STATE_READY);
        t.transition(STATE_READY, STATE_RUNNING);
        server.note_run_start(0, running);
        std::thread::sleep(std::time::Duration::from_millis(2));

        // No contender: no flag.
        server.lock.acquire_raw();
        server.server_pass(None);
        server.lock.release();
        assert_eq!(t.rec.yield_flag.load(Ordering::Relaxed), 0);

        // A contender arrives: flag raised.
        let contender = mk_task(&server, 10, None);
        server.enqueue(idx, contender, Some(0));
        server.lock.acquire_raw();
        server.server_pass(None);
        server.lock.release();
        assert_eq!(t.rec.yield_flag.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn quantum_zero_never_flags() {
        let region = instance("quantum0", |c| {
            c.scheduler.quantum_ns = 0;
        });
        let server = Server::new(&region);
        let idx = attach_proc(&server, 10);
        assert!(server.cpus.claim(0, 10));

        let running = mk_task(&server, 10, None);
        let t = unsafe { task::task(&region, running) };
        t.transition(STATE_SUBMITTED, STATE_READY);
        t.transition(STATE_READY, STATE_RUNNING);
        server.note_run_start(0, running);
        let contender = mk_task(&server, 10, None);
        server.enqueue(idx, contender, Some(0));
        std::thread::sleep(std::time::Duration::from_millis(2));

        server.lock.acquire_raw();
        server.server_pass(None);
        server.lock.release();
        assert_eq!(t.rec.yield_flag.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn starved_owner_is_granted_a_free_cpu() {
        let region = instance("starved", |_| {});
        let server = Server::new(&region);
        let idx = attach_proc(&server, 10);
        // Pid 10 owns nothing; CPUs all free.

        let off = mk_task(&server, 10, None);
        server.enqueue(idx, off, None);
        server.lock.acquire_raw();
        server.server_pass(None);
        server.lock.release();

        assert!(server.cpus.owns_any(10));
        // The grant landed in the mailbox.
        let granted = server.cpus.owned_by(10).first().unwrap();
        assert_eq!(
            server.procs.take_mailbox(idx, granted),
            Some(crate::proc::MAIL_GRANT)
        );
    }

    #[test]
    fn served_waiter_receives_task_through_slot() {
        let region = instance("serve", |_| {});
        let server = Server::new(&region);
        let idx = attach_proc(&server, 10);
        for cpu in 0..4 {
            assert!(server.cpus.claim(cpu, 10));
        }
        let off = mk_task(&server, 10, None);
        server.enqueue(idx, off, Some(1));

        // Hold the lock before the waiter shows up, so it must camp on
        // its slot rather than winning the word itself.
        server.lock.acquire_raw();
        std::thread::scope(|s| {
            let waiter = s.spawn(|| {
                let server = Server::new(&region);
                server.lock.acquire(1, false)
            });
            while !server.lock.is_present(1) {
                std::hint::spin_loop();
            }
            server.server_pass(None);
            server.lock.release();
            match waiter.join().unwrap() {
                Acquired::Served { item, exec } => {
                    assert_eq!(item, off);
                    assert_eq!(exec, 1);
                }
                other => panic!("waiter got {other:?}"),
            }
        });
    }

    #[test]
    fn claim_for_transfer_finds_another_process_task() {
        let region = instance("xfer", |_| {});
        let server = Server::new(&region);
        let p = attach_proc(&server, 10);
        let _q = attach_proc(&server, 20);
        assert!(server.cpus.claim(0, 10));

        // Pid 20's task, submitted through p's queue is not possible —
        // it goes through its own slot.
        let off = mk_task(&server, 20, None);
        server.enqueue(p, off, None);
        server.lock.acquire_raw();
        server.drain_inputs();
        let got = server.claim_for_transfer(0, 10).unwrap();
        assert_eq!(got.0, 20);
        assert_eq!(got.1, Some(off));
        server.lock.release();
    }
}
