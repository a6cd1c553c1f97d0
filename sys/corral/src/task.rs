// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The task model.
//!
//! A task is a region-resident [`TaskRecord`] plus a process-local type
//! registration (label and run callback; callbacks never cross the process
//! boundary, so the record carries only the owner pid and a type id that
//! is meaningful in the owner).
//!
//! # State machine
//!
//! ```text
//! created → submitted → ready → running → completed
//!                         ↑        │
//!                         │        ├→ paused   (blocking count > 0)
//!                         └────────┴← yielding
//! ```
//!
//! State words are advanced with compare-exchange so an illegal transition
//! is loud in debug builds and harmless in release. A task is present in
//! at most one queue at a time; the single `sched_next` hook enforces that
//! structurally for the input/overflow/ready queues, and `wait_next` is
//! reserved for the mutex wait list (a paused task can be in a wait list
//! while out of every scheduler queue).

use core::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

use abi::{Affinity, AffinityPolicy, Level, Status, TaskFlags, TASK_METADATA_MAX};

use crate::err::Result;
use crate::futex;
use crate::shmem::{Off, Region};

/// `TaskRecord::state` values.
pub const STATE_CREATED: u32 = 0;
pub const STATE_SUBMITTED: u32 = 1;
pub const STATE_READY: u32 = 2;
pub const STATE_RUNNING: u32 = 3;
pub const STATE_PAUSED: u32 = 4;
pub const STATE_YIELDING: u32 = 5;
pub const STATE_COMPLETED: u32 = 6;

/// `affinity_level` value meaning "no affinity".
pub const NO_AFFINITY: i32 = -1;

/// The shared-layout task record. Allocated from the region's task block
/// allocator; the metadata bytes follow the record inline.
#[repr(C)]
pub struct TaskRecord {
    /// Type id in the owner's registry.
    pub type_id: u32,
    /// Pid of the process that created the task and owns its callback.
    pub owner_pid: i32,
    /// Number of body invocations requested; 1 for a scalar task.
    pub degree: u32,
    /// `TaskFlags` bits.
    pub flags: AtomicU32,

    /// Affinity, settable between create and submit: level (`NO_AFFINITY`
    /// for none), domain logical id, and policy (0 strict / 1 preferred).
    pub affinity_level: AtomicI32,
    pub affinity_domain: AtomicU32,
    pub affinity_policy: AtomicU32,

    pub state: AtomicU32,
    /// Blocking count; must be zero for the task to become ready.
    pub blocking: AtomicI32,
    /// Body invocations handed out so far (also the execution id source).
    pub dispatched: AtomicU32,
    /// Body invocations that have returned.
    pub completed: AtomicU32,
    /// Set by the server at quantum expiry; the body observes it at its
    /// next scheduling point.
    pub yield_flag: AtomicU32,
    /// Completion futex word: 0 while pending, 1 once completed.
    pub done: AtomicU32,

    /// At most one task may wait on this task's completion from inside a
    /// task context; it parks here as a paused task to be resubmitted.
    pub waiter_task: AtomicU64,
    /// Intrusive link for the input/overflow/ready queues.
    pub sched_next: AtomicU64,
    /// Intrusive link for a mutex wait list.
    pub wait_next: AtomicU64,
    /// Logical CPU the task was last submitted from / ran on; locality
    /// tie-break hint. `-1` when unknown.
    pub last_cpu: AtomicI32,
    pub _pad: u32,
    /// Owner-process-local worker token (a pointer, opaque here). Nonzero
    /// while a paused or yielding body is camped on a worker's stack; only
    /// the owner process dereferences it.
    pub bound_worker: AtomicU64,

    /// Class-rounded allocation size, for recycling.
    pub alloc_size: u32,
    pub metadata_len: u32,
}

/// A resolved task handle: the record plus its region offset.
#[derive(Copy, Clone)]
pub struct Task<'r> {
    pub rec: &'r TaskRecord,
    pub off: Off,
}

/// Resolves a task offset.
///
/// # Safety
///
/// `off` must come from [`create`] on this region and the task must not
/// have been destroyed.
pub unsafe fn task(region: &Region, off: Off) -> Task<'_> {
    Task {
        rec: region.at::<TaskRecord>(off),
        off,
    }
}

/// Allocates and initializes a task record.
pub fn create(
    region: &Region,
    type_id: u32,
    owner_pid: i32,
    degree: u32,
    metadata: &[u8],
) -> Result<Off> {
    if degree == 0 {
        return Err(Status::InvalidParameter.into());
    }
    if metadata.len() > TASK_METADATA_MAX {
        return Err(Status::InvalidMetadataSize.into());
    }
    let total = core::mem::size_of::<TaskRecord>() + metadata.len();
    let (off, alloc_size) = region.alloc_task_block(total)?;

    let mut flags = TaskFlags::empty();
    if degree > 1 {
        flags |= TaskFlags::PARALLEL;
    }

    // Safety: a task block is exclusively ours until the offset is
    // published; recycled blocks may hold stale bytes, so every field is
    // written.
    unsafe {
        let p = region.at_ptr::<TaskRecord>(off);
        p.write(TaskRecord {
            type_id,
            owner_pid,
            degree,
            flags: AtomicU32::new(flags.bits()),
            affinity_level: AtomicI32::new(NO_AFFINITY),
            affinity_domain: AtomicU32::new(0),
            affinity_policy: AtomicU32::new(0),
            state: AtomicU32::new(STATE_CREATED),
            blocking: AtomicI32::new(0),
            dispatched: AtomicU32::new(0),
            completed: AtomicU32::new(0),
            yield_flag: AtomicU32::new(0),
            done: AtomicU32::new(0),
            waiter_task: AtomicU64::new(0),
            sched_next: AtomicU64::new(0),
            wait_next: AtomicU64::new(0),
            last_cpu: AtomicI32::new(-1),
            _pad: 0,
            bound_worker: AtomicU64::new(0),
            alloc_size: alloc_size as u32,
            metadata_len: metadata.len() as u32,
        });
        let dst = region.at_ptr::<u8>(off + core::mem::size_of::<TaskRecord>() as u64);
        core::ptr::copy_nonoverlapping(metadata.as_ptr(), dst, metadata.len());
    }
    Ok(off)
}

/// Frees a task record. Legal only before submission or after completion.
pub fn destroy(region: &Region, off: Off) -> Result<()> {
    // Safety: caller warrants the handle.
    let t = unsafe { task(region, off) };
    let state = t.rec.state.load(Ordering::Acquire);
    if state != STATE_CREATED && state != STATE_COMPLETED {
        debug_assert!(false, "destroying a task in state {state}");
        return Err(Status::InvalidOperation.into());
    }
    let size = t.rec.alloc_size as usize;
    region.free_task_block(off, size);
    Ok(())
}

impl Task<'_> {
    pub fn state(&self) -> u32 {
        self.rec.state.load(Ordering::Acquire)
    }

    /// Advances the state machine, insisting (in debug builds) that the
    /// previous state is the expected one.
    pub fn transition(&self, from: u32, to: u32) {
        let prev = self.rec.state.swap(to, Ordering::AcqRel);
        debug_assert_eq!(prev, from, "task state was {prev}, expected {from}");
    }

    /// Conditional transition; returns whether it happened.
    pub fn try_transition(&self, from: u32, to: u32) -> bool {
        self.rec
            .state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn flags(&self) -> TaskFlags {
        TaskFlags::from_bits_truncate(self.rec.flags.load(Ordering::Relaxed))
    }

    pub fn is_parallel(&self) -> bool {
        self.rec.degree > 1
    }

    pub fn affinity(&self) -> Option<Affinity> {
        let level = self.rec.affinity_level.load(Ordering::Relaxed);
        if level == NO_AFFINITY {
            return None;
        }
        Some(Affinity {
            level: Level::from_index(level as usize)?,
            domain: self.rec.affinity_domain.load(Ordering::Relaxed),
            policy: if self.rec.affinity_policy.load(Ordering::Relaxed) == 0 {
                AffinityPolicy::Strict
            } else {
                AffinityPolicy::Preferred
            },
        })
    }

    /// Sets affinity. Only legal before submission.
    pub fn set_affinity(&self, affinity: Option<Affinity>) -> Result<()> {
        if self.state() != STATE_CREATED {
            return Err(Status::InvalidOperation.into());
        }
        match affinity {
            None => self
                .rec
                .affinity_level
                .store(NO_AFFINITY, Ordering::Relaxed),
            Some(a) => {
                self.rec
                    .affinity_domain
                    .store(a.domain, Ordering::Relaxed);
                self.rec.affinity_policy.store(
                    match a.policy {
                        AffinityPolicy::Strict => 0,
                        AffinityPolicy::Preferred => 1,
                    },
                    Ordering::Relaxed,
                );
                self.rec
                    .affinity_level
                    .store(a.level.index() as i32, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Raises the blocking count (pause half of a pause/resume pair).
    pub fn block(&self) -> i32 {
        self.rec.blocking.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Lowers the blocking count; returns true when it hit zero and the
    /// task should be resubmitted. A negative result is a mismatched
    /// pause/resume pair.
    pub fn unblock(&self) -> bool {
        let left = self.rec.blocking.fetch_sub(1, Ordering::AcqRel) - 1;
        debug_assert!(left >= 0, "unblock without matching pause");
        left == 0
    }

    pub fn blocking(&self) -> i32 {
        self.rec.blocking.load(Ordering::Acquire)
    }

    /// Records one finished body invocation; returns true when the task
    /// as a whole just completed (the `degree`-th return).
    pub fn finish_invocation(&self) -> bool {
        let done = self.rec.completed.fetch_add(1, Ordering::AcqRel) + 1;
        debug_assert!(done <= self.rec.degree);
        done == self.rec.degree
    }

    /// Publishes completion and releases every completion waiter.
    pub fn mark_completed(&self) {
        self.rec.state.store(STATE_COMPLETED, Ordering::Release);
        self.rec.done.store(1, Ordering::Release);
        futex::wake(&self.rec.done, i32::MAX);
    }

    /// Blocks the calling *thread* until the task completes. The in-task
    /// variant lives in the runtime front-end; this one is for external
    /// threads.
    pub fn wait_external(&self) {
        while self.rec.done.load(Ordering::Acquire) == 0 {
            futex::wait(&self.rec.done, 0);
        }
    }

    pub fn metadata<'r>(&self, region: &'r Region) -> &'r [u8] {
        // Safety: written at create, immutable afterwards, inside the
        // task's allocation.
        unsafe {
            region.slice::<u8>(
                self.off + core::mem::size_of::<TaskRecord>() as u64,
                self.rec.metadata_len as usize,
            )
        }
    }
}
