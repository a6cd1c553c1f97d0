// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The CPU manager: who owns which CPU, and how a CPU changes hands.
//!
//! Ownership is one word per logical CPU: the owning pid, or
//! [`FREE`]. The word is written only by the process handing the CPU off
//! (release store) or by a process picking it up through pop-free
//! (acquire on the compare-exchange), so invariant 1 of the runtime — at
//! most one owner per CPU at any instant — falls directly out of the
//! atomics.
//!
//! Transfers avoid an idle gap: the new owner is written first, then the
//! grant (with any task riding along) is posted to the target's mailbox,
//! whose keeper immediately puts a worker on the CPU.

use core::sync::atomic::{AtomicI32, Ordering};

use cpuset::CpuSet;

use crate::proc::{ProcTable, MAIL_GRANT};
use crate::shmem::Off;

/// Owner value meaning "unowned".
pub const FREE: i32 = -1;

/// View over the per-CPU owner vector.
#[derive(Copy, Clone)]
pub struct CpuManager<'r> {
    owners: &'r [AtomicI32],
}

impl<'r> CpuManager<'r> {
    /// # Safety
    ///
    /// `owners` must be the region-resident owner vector, one entry per
    /// logical CPU, initialized to [`FREE`].
    pub unsafe fn new(owners: &'r [AtomicI32]) -> Self {
        Self { owners }
    }

    pub fn ncpus(&self) -> usize {
        self.owners.len()
    }

    pub fn owner(&self, cpu: usize) -> i32 {
        self.owners[cpu].load(Ordering::Acquire)
    }

    /// Scans for a free CPU and claims it for `pid`. Returns the logical
    /// id claimed.
    pub fn pop_free(&self, pid: i32) -> Option<usize> {
        for (cpu, owner) in self.owners.iter().enumerate() {
            if owner
                .compare_exchange(FREE, pid, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(cpu);
            }
        }
        None
    }

    /// Claims a specific free CPU for `pid`.
    pub fn claim(&self, cpu: usize, pid: i32) -> bool {
        self.owners[cpu]
            .compare_exchange(FREE, pid, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Releases a CPU to the free pool.
    pub fn mark_free(&self, cpu: usize) {
        self.owners[cpu].store(FREE, Ordering::Release);
    }

    /// Hands `cpu` to `target_pid` without letting it idle: ownership
    /// moves first, then the grant (and optional task) lands in the
    /// target's mailbox and its keeper is woken. Used at process detach
    /// and when quantum-driven redistribution is mandated.
    ///
    /// The caller must currently own `cpu` (or hold the delegation lock
    /// while redistributing a free CPU), which is what makes the plain
    /// store sound.
    pub fn transfer(
        &self,
        procs: &ProcTable<'_>,
        target_pid: i32,
        cpu: usize,
        task: Option<Off>,
    ) -> bool {
        let Some(idx) = procs.find(target_pid) else {
            return false;
        };
        self.owners[cpu].store(target_pid, Ordering::Release);
        procs.post_mailbox(idx, cpu, task.unwrap_or(MAIL_GRANT));
        true
    }

    /// The set of CPUs owned by `pid`.
    pub fn owned_by(&self, pid: i32) -> CpuSet {
        let mut set = CpuSet::empty();
        for (cpu, owner) in self.owners.iter().enumerate() {
            if owner.load(Ordering::Acquire) == pid {
                set.insert(cpu);
            }
        }
        set
    }

    pub fn owns_any(&self, pid: i32) -> bool {
        self.owners
            .iter()
            .any(|o| o.load(Ordering::Acquire) == pid)
    }

    /// First free CPU, if any.
    pub fn first_free(&self) -> Option<usize> {
        self.owners
            .iter()
            .position(|o| o.load(Ordering::Acquire) == FREE)
    }
}

/// Initializes the owner vector in place (all free).
///
/// # Safety
///
/// Exclusive access to the uninitialized memory.
pub unsafe fn init_in_place(owners: *mut AtomicI32, ncpus: usize) {
    for i in 0..ncpus {
        owners.add(i).write(AtomicI32::new(FREE));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::MAX_PROCS;
    use crate::proc;

    fn owners(n: usize) -> Vec<AtomicI32> {
        (0..n).map(|_| AtomicI32::new(FREE)).collect()
    }

    #[test]
    fn pop_free_claims_each_cpu_once() {
        let o = owners(4);
        let m = unsafe { CpuManager::new(&o) };
        let mut got = Vec::new();
        while let Some(cpu) = m.pop_free(10) {
            got.push(cpu);
        }
        assert_eq!(got, [0, 1, 2, 3]);
        assert!(m.pop_free(11).is_none());
        assert_eq!(m.owned_by(10).count(), 4);
        m.mark_free(2);
        assert_eq!(m.pop_free(11), Some(2));
        assert_eq!(m.owner(2), 11);
    }

    #[test]
    fn concurrent_pop_free_never_double_claims() {
        let o = owners(8);
        std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|t| {
                    let o = &o;
                    s.spawn(move || {
                        let m = unsafe { CpuManager::new(o) };
                        let mut mine = 0;
                        while m.pop_free(100 + t).is_some() {
                            mine += 1;
                        }
                        mine
                    })
                })
                .collect();
            let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
            assert_eq!(total, 8);
        });
    }

    #[test]
    fn transfer_moves_ownership_and_posts_grant() {
        let o = owners(2);
        let m = unsafe { CpuManager::new(&o) };
        let slots: Vec<proc::ProcSlot> = (0..MAX_PROCS)
            .map(|_| unsafe { core::mem::zeroed() })
            .collect();
        let t = unsafe { ProcTable::new(&slots) };
        let idx = t.claim(55).unwrap();

        assert!(m.claim(0, 44));
        assert!(m.transfer(&t, 55, 0, Some(0x4000)));
        assert_eq!(m.owner(0), 55);
        assert_eq!(t.take_mailbox(idx, 0), Some(0x4000));

        // Grant with no task.
        assert!(m.transfer(&t, 55, 1, None));
        assert_eq!(t.take_mailbox(idx, 1), Some(MAIL_GRANT));

        // Unknown target refuses.
        assert!(!m.transfer(&t, 777, 0, None));
    }
}
