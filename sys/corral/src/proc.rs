// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Process slots.
//!
//! The region header points at a fixed vector of [`ProcSlot`] records, one
//! per attachable process. A slot carries the submission-side state (input
//! ring block, overflow list) and the *hand-off mailbox*: the per-CPU
//! channel through which another process grants this one a CPU, possibly
//! with a task riding along. The mailbox is watched by the owning
//! process's keeper thread, parked on the slot's futex word.

use core::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

use abi::{Status, MAX_PROCS};
use cpuset::CpuSet;

use crate::err::Result;
use crate::futex;
use crate::shmem::Off;

/// Mailbox entry values. Task offsets are ≥ 64; the sentinels cannot
/// collide.
pub const MAIL_NONE: u64 = 0;
/// CPU granted with no task attached.
pub const MAIL_GRANT: u64 = 1;

/// Words of an overflow FIFO (tasks linked through `sched_next`). The
/// list logic lives with the scheduler; the slot just owns the words.
#[repr(C)]
pub struct OverflowList {
    pub lock: AtomicU32,
    pub _pad: u32,
    pub head: AtomicU64,
    pub tail: AtomicU64,
}

/// One attachable process.
#[repr(C)]
pub struct ProcSlot {
    /// Owning pid, or 0 when the slot is free. Claimed by compare-exchange.
    pid: AtomicI32,
    pub _pad: u32,
    /// Futex word the keeper parks on; bumped on every mailbox post.
    pub mail_seq: AtomicU32,
    pub _pad2: u32,
    /// Offset of this process's input ring block; 0 until first attach.
    pub rings_off: AtomicU64,
    pub overflow: OverflowList,
    /// Per-CPU hand-off slots, indexed by logical id.
    mailbox: [AtomicU64; CpuSet::CAPACITY],
}

impl ProcSlot {
    pub fn pid(&self) -> i32 {
        self.pid.load(Ordering::Acquire)
    }

    pub fn in_use(&self) -> bool {
        self.pid() != 0
    }
}

/// View over the full slot vector.
#[derive(Copy, Clone)]
pub struct ProcTable<'r> {
    slots: &'r [ProcSlot],
}

impl<'r> ProcTable<'r> {
    /// # Safety
    ///
    /// `slots` must be the region-resident vector, `MAX_PROCS` long and
    /// initialized.
    pub unsafe fn new(slots: &'r [ProcSlot]) -> Self {
        debug_assert_eq!(slots.len(), MAX_PROCS);
        Self { slots }
    }

    pub fn slot(&self, idx: usize) -> &'r ProcSlot {
        &self.slots[idx]
    }

    /// Claims a free slot for `pid`.
    pub fn claim(&self, pid: i32) -> Result<usize> {
        debug_assert!(pid > 0);
        for (idx, slot) in self.slots.iter().enumerate() {
            if slot
                .pid
                .compare_exchange(0, pid, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                // The slot may be a reuse; scrub the mailbox.
                for cell in &slot.mailbox {
                    cell.store(MAIL_NONE, Ordering::Relaxed);
                }
                return Ok(idx);
            }
        }
        Err(Status::OutOfMemory.into())
    }

    /// Releases a slot at detach.
    pub fn release(&self, idx: usize) {
        self.slots[idx].pid.store(0, Ordering::Release);
    }

    pub fn find(&self, pid: i32) -> Option<usize> {
        self.slots.iter().position(|s| s.pid() == pid)
    }

    /// Indexes of slots currently attached.
    pub fn attached(&self) -> impl Iterator<Item = usize> + 'r {
        let slots = self.slots;
        (0..slots.len()).filter(move |&i| slots[i].in_use())
    }

    /// Posts a CPU grant (with optional task) to `idx`'s mailbox and wakes
    /// its keeper. `value` is `MAIL_GRANT` or a task offset.
    pub fn post_mailbox(&self, idx: usize, cpu: usize, value: u64) {
        debug_assert_ne!(value, MAIL_NONE);
        let slot = &self.slots[idx];
        slot.mailbox[cpu].store(value, Ordering::Release);
        slot.mail_seq.fetch_add(1, Ordering::AcqRel);
        futex::wake(&slot.mail_seq, 1);
    }

    /// Keeper side: removes and returns the pending grant for `cpu`, if
    /// any.
    pub fn take_mailbox(&self, idx: usize, cpu: usize) -> Option<u64> {
        let v = self.slots[idx].mailbox[cpu].swap(MAIL_NONE, Ordering::AcqRel);
        (v != MAIL_NONE).then_some(v)
    }

    /// Keeper side: parks until the mail sequence moves past `seen`.
    pub fn wait_mail(&self, idx: usize, seen: u32) {
        futex::wait(&self.slots[idx].mail_seq, seen);
    }

    pub fn mail_seq(&self, idx: usize) -> u32 {
        self.slots[idx].mail_seq.load(Ordering::Acquire)
    }

    /// Wakes the keeper without posting (shutdown path).
    pub fn kick_keeper(&self, idx: usize) {
        self.slots[idx].mail_seq.fetch_add(1, Ordering::AcqRel);
        futex::wake(&self.slots[idx].mail_seq, i32::MAX);
    }
}

/// Initializes the slot vector in place.
///
/// # Safety
///
/// Exclusive access to the uninitialized memory.
pub unsafe fn init_in_place(slots: *mut ProcSlot) {
    core::ptr::write_bytes(
        slots as *mut u8,
        0,
        core::mem::size_of::<ProcSlot>() * MAX_PROCS,
    );
}

/// Size of the slot vector allocation.
pub fn table_size() -> usize {
    core::mem::size_of::<ProcSlot>() * MAX_PROCS
}

/// Rings are stored per process as one contiguous block:
/// `rings_per_proc × (RingHeader + (cap + 1) slots)`. These helpers pin
/// the arithmetic down in one place.
pub mod ringblk {
    use super::Off;

    pub fn ring_stride(cap: usize) -> usize {
        let header = core::mem::size_of::<spscq::RingHeader>().max(8);
        header + (cap + 1) * 8
    }

    pub fn block_size(nrings: usize, cap: usize) -> usize {
        nrings * ring_stride(cap)
    }

    pub fn header_off(block: Off, ring: usize, cap: usize) -> Off {
        block + (ring * ring_stride(cap)) as u64
    }

    pub fn slots_off(block: Off, ring: usize, cap: usize) -> Off {
        let header = core::mem::size_of::<spscq::RingHeader>().max(8);
        header_off(block, ring, cap) + header as u64
    }
}
