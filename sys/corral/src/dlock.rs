// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The delegation lock.
//!
//! A single-holder lock engineered so the holder does useful work for all
//! contenders before releasing: each contender is a worker pinned to a
//! CPU, and the lock owns one [`WaiterSlot`] per CPU logical id. A worker
//! that fails to take the lock parks on its slot; the holder publishes a
//! result into the slot (a task handle, or the *try-again* sentinel) and
//! the worker returns from [`LockView::acquire`] without ever holding the
//! lock.
//!
//! # Slot protocol
//!
//! | `item` | `cmd` | meaning |
//! |---|---|---|
//! | `ITEM_EMPTY` | `CMD_SPIN` | waiting, no result yet, spinning |
//! | `ITEM_EMPTY` | `CMD_SLEEP` | waiting, told to park on the futex |
//! | `ITEM_TRY_AGAIN` | — | released with no task; re-enter |
//! | task offset | — | carries a task to execute |
//!
//! Ordering: the holder publishes `exec` (relaxed), then `item` with a
//! release store, then flips `cmd` and wakes the futex. The waiter's
//! acquire load of `item` (or the futex wake on `cmd`) is therefore
//! guaranteed to observe the published value. A waiter writes its own slot
//! only before announcing presence or after withdrawing it; the holder
//! writes other CPUs' slots only while holding the lock.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::futex;
use crate::shmem::Off;

pub const ITEM_EMPTY: u64 = 0;
pub const ITEM_TRY_AGAIN: u64 = 1;

pub const CMD_SPIN: u32 = 0;
pub const CMD_SLEEP: u32 = 1;

/// Per-CPU rendezvous slot. Padded to a cache line so neighboring CPUs'
/// slots do not false-share.
#[repr(C, align(64))]
pub struct WaiterSlot {
    /// Tagged result word; see the table above. Task offsets are always
    /// 64-aligned and past the region header, so they cannot collide with
    /// the sentinels.
    item: AtomicU64,
    /// Execution id accompanying a served task (parallel dispatch).
    /// Published before `item`.
    exec: AtomicU32,
    /// Futex word the waiter parks on when told to sleep.
    cmd: AtomicU32,
    /// Nonzero while a waiter is camped on this slot. Read by the holder
    /// to build the waiters set and by wake-one.
    present: AtomicU32,
    _pad: u32,
}

/// The lock word plus a ticket counter (holder hand-offs, for observation
/// and tests; the counter plays no part in mutual exclusion).
#[repr(C)]
pub struct DelegationLock {
    word: AtomicU32,
    _pad: u32,
    tickets: AtomicU64,
}

/// Outcome of [`LockView::acquire`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Acquired {
    /// You hold the lock; run the server loop, then release.
    Holder,
    /// Another thread's server loop ran on your behalf; `item` is your
    /// result (`ITEM_TRY_AGAIN` or a task offset) and `exec` the execution
    /// id when `item` is a task.
    Served { item: u64, exec: u32 },
}

/// A process's view of the lock and slot vector.
#[derive(Copy, Clone)]
pub struct LockView<'r> {
    lock: &'r DelegationLock,
    slots: &'r [WaiterSlot],
}

impl<'r> LockView<'r> {
    /// # Safety
    ///
    /// `lock` and `slots` must be the region-resident lock and the full
    /// per-CPU slot vector of one instance.
    pub unsafe fn new(lock: &'r DelegationLock, slots: &'r [WaiterSlot]) -> Self {
        Self { lock, slots }
    }

    pub fn ncpus(&self) -> usize {
        self.slots.len()
    }

    /// Contends for the lock from CPU `cpu`. If `parked` is set, the
    /// caller's slot was already primed for sleep by its own previous
    /// holder pass, and we go straight to the futex instead of spinning.
    pub fn acquire(&self, cpu: usize, parked: bool) -> Acquired {
        let slot = &self.slots[cpu];
        if !parked {
            slot.item.store(ITEM_EMPTY, Ordering::Relaxed);
            slot.cmd.store(CMD_SPIN, Ordering::Relaxed);
            slot.present.store(1, Ordering::Release);
        } else {
            // Primed by ourselves while we were the holder: present is
            // still up and cmd says sleep. Wait to be served or woken
            // before contending, otherwise we would just retake the lock
            // and spin.
            loop {
                match slot.item.load(Ordering::Acquire) {
                    ITEM_EMPTY => {
                        if slot.cmd.load(Ordering::Acquire) == CMD_SLEEP {
                            futex::wait(&slot.cmd, CMD_SLEEP);
                        } else {
                            break;
                        }
                    }
                    item => return self.take_served(cpu, item),
                }
            }
        }

        loop {
            if self
                .lock
                .word
                .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                slot.present.store(0, Ordering::Relaxed);
                // We may have been served between announcing presence and
                // winning the word; the result wins, the lock moves on.
                let item = slot.item.swap(ITEM_EMPTY, Ordering::Acquire);
                if item != ITEM_EMPTY {
                    let exec = slot.exec.load(Ordering::Relaxed);
                    self.release();
                    return Acquired::Served { item, exec };
                }
                self.lock.tickets.fetch_add(1, Ordering::Relaxed);
                return Acquired::Holder;
            }
            match slot.item.load(Ordering::Acquire) {
                ITEM_EMPTY => {
                    if slot.cmd.load(Ordering::Acquire) == CMD_SLEEP {
                        futex::wait(&slot.cmd, CMD_SLEEP);
                    } else {
                        core::hint::spin_loop();
                    }
                }
                item => return self.take_served(cpu, item),
            }
        }
    }

    fn take_served(&self, cpu: usize, item: u64) -> Acquired {
        let slot = &self.slots[cpu];
        let exec = slot.exec.load(Ordering::Relaxed);
        slot.item.store(ITEM_EMPTY, Ordering::Relaxed);
        slot.present.store(0, Ordering::Release);
        Acquired::Served { item, exec }
    }

    /// Takes the lock without a waiter slot. For short non-worker critical
    /// sections (attach bookkeeping, detach hand-off); such a holder must
    /// not park anybody.
    pub fn acquire_raw(&self) {
        let mut spins = 0u32;
        while self
            .lock
            .word
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spins += 1;
            if spins % 1024 == 0 {
                std::thread::yield_now();
            } else {
                core::hint::spin_loop();
            }
        }
        self.lock.tickets.fetch_add(1, Ordering::Relaxed);
    }

    /// Releases the lock. Only the current holder may call this.
    pub fn release(&self) {
        self.lock.word.store(0, Ordering::Release);
    }

    /// Holder hand-off count so far.
    pub fn tickets(&self) -> u64 {
        self.lock.tickets.load(Ordering::Relaxed)
    }

    /// Is a waiter camped on `cpu`'s slot?
    pub fn is_present(&self, cpu: usize) -> bool {
        self.slots[cpu].present.load(Ordering::Acquire) != 0
    }

    /// Is `cpu`'s slot told to sleep?
    pub fn is_sleeping(&self, cpu: usize) -> bool {
        self.slots[cpu].cmd.load(Ordering::Acquire) == CMD_SLEEP
    }

    /// Holder only: publishes a result into `cpu`'s slot and releases that
    /// waiter. `item` is a task offset or `ITEM_TRY_AGAIN`.
    pub fn serve(&self, cpu: usize, item: u64, exec: u32) {
        debug_assert_ne!(item, ITEM_EMPTY);
        let slot = &self.slots[cpu];
        slot.exec.store(exec, Ordering::Relaxed);
        slot.item.store(item, Ordering::Release);
        slot.cmd.store(CMD_SPIN, Ordering::Release);
        futex::wake(&slot.cmd, 1);
    }

    /// Holder only: tells the waiter on `cpu` to park. The waiter observes
    /// the command on its next spin iteration.
    pub fn tell_sleep(&self, cpu: usize) {
        self.slots[cpu].cmd.store(CMD_SLEEP, Ordering::Release);
    }

    /// Holder only: primes the holder's *own* slot for sleep before
    /// releasing, so a subsequent `acquire(cpu, true)` parks instead of
    /// retaking the lock.
    pub fn prime_self_sleep(&self, cpu: usize) {
        let slot = &self.slots[cpu];
        slot.item.store(ITEM_EMPTY, Ordering::Relaxed);
        slot.exec.store(0, Ordering::Relaxed);
        slot.cmd.store(CMD_SLEEP, Ordering::Relaxed);
        slot.present.store(1, Ordering::Release);
    }

    /// Releases a sleeping waiter with no result (wake-one, shutdown).
    /// Callable without the lock: it only flips `cmd` forward and wakes.
    pub fn wake_slot(&self, cpu: usize) {
        let slot = &self.slots[cpu];
        slot.cmd.store(CMD_SPIN, Ordering::Release);
        futex::wake(&slot.cmd, 1);
    }

    /// Detach cleanup, called under the lock after this process's workers
    /// have exited: withdraws any stale presence on `cpu`'s slot and
    /// returns a task that was served there but never collected.
    pub fn retire_slot(&self, cpu: usize) -> Option<u64> {
        let slot = &self.slots[cpu];
        slot.present.store(0, Ordering::Release);
        slot.cmd.store(CMD_SPIN, Ordering::Relaxed);
        let item = slot.item.swap(ITEM_EMPTY, Ordering::AcqRel);
        item_task(item)
    }
}

/// Initializes lock + slots in place. Caller is the region initializer.
///
/// # Safety
///
/// Exclusive access to the uninitialized memory.
pub unsafe fn init_in_place(lock: *mut DelegationLock, slots: *mut WaiterSlot, ncpus: usize) {
    lock.write(DelegationLock {
        word: AtomicU32::new(0),
        _pad: 0,
        tickets: AtomicU64::new(0),
    });
    for i in 0..ncpus {
        slots.add(i).write(WaiterSlot {
            item: AtomicU64::new(ITEM_EMPTY),
            exec: AtomicU32::new(0),
            cmd: AtomicU32::new(CMD_SPIN),
            present: AtomicU32::new(0),
            _pad: 0,
        });
    }
}

/// Offsets task handles may use: anything `>= FIRST_VALID_ITEM` is a task.
pub const FIRST_VALID_ITEM: u64 = 2;

/// Helper for interpreting a served item.
pub fn item_is_task(item: u64) -> bool {
    item >= FIRST_VALID_ITEM
}

pub fn item_task(item: u64) -> Option<Off> {
    item_is_task(item).then_some(item)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn fixture(ncpus: usize) -> (Box<DelegationLock>, Vec<WaiterSlot>) {
        let lock = Box::new(DelegationLock {
            word: AtomicU32::new(0),
            _pad: 0,
            tickets: AtomicU64::new(0),
        });
        let slots = (0..ncpus)
            .map(|_| WaiterSlot {
                item: AtomicU64::new(ITEM_EMPTY),
                exec: AtomicU32::new(0),
                cmd: AtomicU32::new(CMD_SPIN),
                present: AtomicU32::new(0),
                _pad: 0,
            })
            .collect();
        (lock, slots)
    }

    #[test]
    fn uncontended_acquire_is_holder() {
        let (lock, slots) = fixture(2);
        let view = unsafe { LockView::new(&lock, &slots) };
        assert_eq!(view.acquire(0, false), Acquired::Holder);
        assert!(!view.is_present(0));
        view.release();
        assert_eq!(view.tickets(), 1);
    }

    #[test]
    fn holder_serves_spinning_waiter() {
        let (lock, slots) = fixture(2);
        let view = unsafe { LockView::new(&lock, &slots) };
        assert_eq!(view.acquire(0, false), Acquired::Holder);

        std::thread::scope(|s| {
            let t = s.spawn(|| {
                let view = unsafe { LockView::new(&lock, &slots) };
                view.acquire(1, false)
            });
            // Wait for the waiter to announce itself, then serve it.
            while !view.is_present(1) {
                std::hint::spin_loop();
            }
            view.serve(1, 0x1000, 2);
            assert_eq!(
                t.join().unwrap(),
                Acquired::Served {
                    item: 0x1000,
                    exec: 2
                }
            );
        });
        view.release();
    }

    #[test]
    fn parked_waiter_is_woken_by_serve() {
        let (lock, slots) = fixture(2);
        let view = unsafe { LockView::new(&lock, &slots) };
        assert_eq!(view.acquire(0, false), Acquired::Holder);

        std::thread::scope(|s| {
            let t = s.spawn(|| {
                let view = unsafe { LockView::new(&lock, &slots) };
                view.acquire(1, false)
            });
            while !view.is_present(1) {
                std::hint::spin_loop();
            }
            view.tell_sleep(1);
            // Give the waiter a moment to actually reach the futex; the
            // protocol is correct either way.
            std::thread::sleep(std::time::Duration::from_millis(10));
            view.serve(1, ITEM_TRY_AGAIN, 0);
            assert_eq!(
                t.join().unwrap(),
                Acquired::Served {
                    item: ITEM_TRY_AGAIN,
                    exec: 0
                }
            );
        });
        view.release();
    }

    #[test]
    fn self_primed_sleep_waits_for_wake() {
        let (lock, slots) = fixture(1);
        let view = unsafe { LockView::new(&lock, &slots) };
        assert_eq!(view.acquire(0, false), Acquired::Holder);
        view.prime_self_sleep(0);
        view.release();

        let woke = AtomicBool::new(false);
        std::thread::scope(|s| {
            let t = s.spawn(|| {
                let view = unsafe { LockView::new(&lock, &slots) };
                let got = view.acquire(0, true);
                woke.store(true, Ordering::Release);
                got
            });
            std::thread::sleep(std::time::Duration::from_millis(20));
            assert!(!woke.load(Ordering::Acquire), "parked worker ran early");
            view.wake_slot(0);
            // With nobody holding the lock, the woken waiter becomes the
            // holder.
            assert_eq!(t.join().unwrap(), Acquired::Holder);
        });
    }

    #[test]
    fn item_tagging() {
        assert!(!item_is_task(ITEM_EMPTY));
        assert!(!item_is_task(ITEM_TRY_AGAIN));
        assert!(item_is_task(64));
        assert_eq!(item_task(64), Some(64));
        assert_eq!(item_task(ITEM_TRY_AGAIN), None);
    }
}
