// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The governor: spin→sleep policy over the delegation lock's waiters.
//!
//! On each server pass the lock holder refreshes the *waiters* set from
//! the slots' presence flags, and for every waiter it could not serve a
//! task it asks the governor what to do: release with *try-again* (the
//! worker spins in user code and re-enters) or park on the slot futex
//! (the worker moves to the *sleepers* set).
//!
//! The two sets live in the shared region. They are only *mutated* by the
//! lock holder, but submission-side wake-one reads them without the lock;
//! they are stored as atomic words so that read is well-defined, and
//! wake-one treats what it reads as a hint that the slot protocol then
//! confirms.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use abi::GovernorPolicy;
use cpuset::CpuSet;

use crate::dlock::LockView;

/// A CPU set readable without the lock. Same capacity as [`CpuSet`].
#[repr(C)]
pub struct SharedMask {
    words: [AtomicU64; 4],
}

impl SharedMask {
    pub fn set(&self, cpu: usize) {
        self.words[cpu / 64].fetch_or(1 << (cpu % 64), Ordering::AcqRel);
    }

    pub fn clear(&self, cpu: usize) {
        self.words[cpu / 64].fetch_and(!(1 << (cpu % 64)), Ordering::AcqRel);
    }

    pub fn contains(&self, cpu: usize) -> bool {
        self.words[cpu / 64].load(Ordering::Acquire) & (1 << (cpu % 64)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| w.load(Ordering::Acquire) == 0)
    }

    /// Racy snapshot.
    pub fn snapshot(&self) -> CpuSet {
        let mut set = CpuSet::empty();
        for (i, w) in self.words.iter().enumerate() {
            let bits = w.load(Ordering::Acquire);
            for b in 0..64 {
                if bits & (1 << b) != 0 {
                    set.insert(i * 64 + b);
                }
            }
        }
        set
    }
}

/// Region-resident governor state.
#[repr(C)]
pub struct GovernorShared {
    pub waiters: SharedMask,
    pub sleepers: SharedMask,
    /// Per-CPU spin counters for the hybrid policy (holder-only).
    pub spins: [AtomicU32; CpuSet::CAPACITY],
}

/// Initializes governor state in place.
///
/// # Safety
///
/// Exclusive access to the uninitialized memory.
pub unsafe fn init_in_place(gov: *mut GovernorShared) {
    // Fresh region memory is zero, which is exactly the initial state;
    // recycled (re-initialized) regions need the explicit wipe.
    core::ptr::write_bytes(gov as *mut u8, 0, core::mem::size_of::<GovernorShared>());
}

/// What to do with a waiter that got no task this pass.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Serve *try-again*; the worker re-enters immediately.
    Release,
    /// Park the worker on its slot futex.
    Park,
}

/// The policy engine, bound to one instance's shared state.
pub struct Governor<'r> {
    pub policy: GovernorPolicy,
    pub threshold: u32,
    pub shared: &'r GovernorShared,
}

impl<'r> Governor<'r> {
    pub fn new(policy: GovernorPolicy, threshold: u32, shared: &'r GovernorShared) -> Self {
        Self {
            policy,
            threshold,
            shared,
        }
    }

    /// Holder only: brings the waiters set in line with the slots'
    /// presence flags. CPUs in the sleepers set stay there (their flag is
    /// also still up; they are the parked subset).
    pub fn refresh_waiters(&self, lock: &LockView<'_>) {
        for cpu in 0..lock.ncpus() {
            if lock.is_present(cpu) && !self.shared.sleepers.contains(cpu) {
                self.shared.waiters.set(cpu);
            } else if !lock.is_present(cpu) {
                self.shared.waiters.clear(cpu);
                self.shared.sleepers.clear(cpu);
            }
        }
    }

    /// Holder only: a waiter was handed a task.
    pub fn on_served(&self, cpu: usize) {
        self.shared.spins[cpu].store(0, Ordering::Relaxed);
        self.shared.waiters.clear(cpu);
        self.shared.sleepers.clear(cpu);
    }

    /// Holder only: decides the fate of an unserved waiter and updates the
    /// sets. The caller performs the actual serve/park on the lock.
    pub fn on_unserved(&self, cpu: usize) -> Verdict {
        let verdict = match self.policy {
            GovernorPolicy::Busy => Verdict::Release,
            GovernorPolicy::Idle => Verdict::Park,
            GovernorPolicy::Hybrid => {
                let spun = self.shared.spins[cpu].fetch_add(1, Ordering::Relaxed);
                if spun >= self.threshold {
                    Verdict::Park
                } else {
                    Verdict::Release
                }
            }
        };
        match verdict {
            Verdict::Release => {
                self.shared.waiters.clear(cpu);
            }
            Verdict::Park => {
                self.shared.spins[cpu].store(0, Ordering::Relaxed);
                self.shared.waiters.clear(cpu);
                self.shared.sleepers.set(cpu);
            }
        }
        verdict
    }

    /// Wake-one, callable without the lock (submission, shutdown): if any
    /// waiter is live in the lock there is nothing to do — a spinner will
    /// pick the work up. Otherwise kick one sleeper. The sets are hints;
    /// the slot protocol tolerates spurious wakes.
    pub fn wake_one(&self, lock: &LockView<'_>) {
        if !self.shared.waiters.is_empty() {
            return;
        }
        if let Some(cpu) = self.shared.sleepers.snapshot().first() {
            lock.wake_slot(cpu);
        }
    }

    /// Wakes every sleeper (shutdown).
    pub fn wake_all(&self, lock: &LockView<'_>) {
        for cpu in self.shared.sleepers.snapshot().iter() {
            lock.wake_slot(cpu);
        }
    }
}
