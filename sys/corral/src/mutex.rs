// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The task-blocking mutex record.
//!
//! A mutex is a region-resident record: a `taken` flag, an intrusive FIFO
//! wait list of task offsets (linked through `TaskRecord::wait_next`), and
//! a spinlock guarding the list. The record level implements the state
//! transitions; parking the calling task (pause) and reviving the new
//! owner (resume, possibly with an in-place CPU hand-off) are the
//! runtime front-end's business, because they involve worker threads.
//!
//! Invariant: `taken == false` exactly when the wait list is empty and no
//! task believes it holds the mutex. Ownership transfers directly to the
//! popped head on unlock, so the flag never clears while a waiter exists.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::shmem::{Off, Region};
use crate::task;

#[repr(C)]
pub struct MutexRecord {
    spin: AtomicU32,
    taken: AtomicU32,
    head: AtomicU64,
    tail: AtomicU64,
}

/// Allocates a fresh mutex record in the region. The block comes from the
/// recyclable allocator so destroyed mutexes do not leak region memory.
pub fn create(region: &Region) -> crate::err::Result<Off> {
    let (off, _size) = region.alloc_task_block(core::mem::size_of::<MutexRecord>())?;
    // Safety: the block is exclusively ours until the offset is published;
    // recycled blocks hold stale bytes, so every field is written.
    unsafe {
        region.at_ptr::<MutexRecord>(off).write(MutexRecord {
            spin: AtomicU32::new(0),
            taken: AtomicU32::new(0),
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
        });
    }
    Ok(off)
}

/// Frees a mutex record. Destroying a held or contended mutex is a
/// programming error; the record is leaked rather than corrupted.
pub fn destroy(region: &Region, off: Off) -> crate::err::Result<()> {
    // Safety: caller warrants the handle.
    let rec = unsafe { record(region, off) };
    if rec.is_taken() || rec.has_waiters() {
        debug_assert!(false, "destroying a live mutex");
        return Err(abi::Status::InvalidOperation.into());
    }
    region.free_task_block(off, class_size());
    Ok(())
}

fn class_size() -> usize {
    let want = core::mem::size_of::<MutexRecord>();
    crate::shmem::SIZE_CLASSES
        .iter()
        .copied()
        .find(|&c| c >= want)
        .expect("mutex record exceeds every size class")
}

/// Resolves a mutex offset.
///
/// # Safety
///
/// `off` must come from [`create`] on this region.
pub unsafe fn record(region: &Region, off: Off) -> &MutexRecord {
    region.at(off)
}

/// Outcome of the lock fast path.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LockOutcome {
    /// The caller owns the mutex; proceed.
    Acquired,
    /// The caller was appended to the wait list and must pause; it owns
    /// the mutex when it resumes.
    MustWait,
}

impl MutexRecord {
    fn with_spin<R>(&self, f: impl FnOnce() -> R) -> R {
        while self
            .spin
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        let r = f();
        self.spin.store(0, Ordering::Release);
        r
    }

    /// Lock attempt by the task at `caller`. On `MustWait` the caller has
    /// already been appended to the FIFO; it must bump its blocking count
    /// and pause before touching the protected data.
    pub fn lock(&self, region: &Region, caller: Off) -> LockOutcome {
        self.with_spin(|| {
            if self.taken.load(Ordering::Relaxed) == 0 {
                self.taken.store(1, Ordering::Relaxed);
                return LockOutcome::Acquired;
            }
            // Safety: caller is a live task handle.
            let t = unsafe { task::task(region, caller) };
            t.rec.wait_next.store(0, Ordering::Relaxed);
            let tail = self.tail.load(Ordering::Relaxed);
            if tail == 0 {
                self.head.store(caller, Ordering::Relaxed);
            } else {
                unsafe { task::task(region, tail) }
                    .rec
                    .wait_next
                    .store(caller, Ordering::Relaxed);
            }
            self.tail.store(caller, Ordering::Relaxed);
            LockOutcome::MustWait
        })
    }

    /// Non-blocking attempt: true if the mutex was taken by this call.
    pub fn try_lock(&self) -> bool {
        self.with_spin(|| {
            if self.taken.load(Ordering::Relaxed) == 0 {
                self.taken.store(1, Ordering::Relaxed);
                true
            } else {
                false
            }
        })
    }

    /// Releases the mutex. Returns the task that now owns it (popped head
    /// of the FIFO) for the caller to revive, or `None` if the mutex is
    /// now free.
    pub fn unlock(&self, region: &Region) -> Option<Off> {
        self.with_spin(|| {
            let head = self.head.load(Ordering::Relaxed);
            if head == 0 {
                self.taken.store(0, Ordering::Relaxed);
                return None;
            }
            let next = unsafe { task::task(region, head) }
                .rec
                .wait_next
                .swap(0, Ordering::Relaxed);
            self.head.store(next, Ordering::Relaxed);
            if next == 0 {
                self.tail.store(0, Ordering::Relaxed);
            }
            // `taken` stays set: ownership moved to `head`.
            Some(head)
        })
    }

    pub fn is_taken(&self) -> bool {
        self.taken.load(Ordering::Acquire) != 0
    }

    pub fn has_waiters(&self) -> bool {
        self.head.load(Ordering::Acquire) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shmem::Region;

    fn region(tag: &str) -> Region {
        let name = format!(
            "/corral-mutex-test-{}-{tag}",
            nix::unistd::getpid().as_raw()
        );
        let cname = std::ffi::CString::new(name.clone()).unwrap();
        unsafe { libc::shm_unlink(cname.as_ptr()) };
        let (r, fresh) = Region::open(&name, 1 << 20, 0).unwrap();
        assert!(fresh);
        r.publish_ready();
        r.unlink();
        r
    }

    fn mk_task(r: &Region) -> Off {
        task::create(r, 0, 1, 1, b"").unwrap()
    }

    #[test]
    fn uncontended_lock_unlock() {
        let r = region("fast");
        let off = create(&r).unwrap();
        let m = unsafe { record(&r, off) };
        let a = mk_task(&r);

        assert_eq!(m.lock(&r, a), LockOutcome::Acquired);
        assert!(m.is_taken());
        assert!(!m.has_waiters());
        assert_eq!(m.unlock(&r), None);
        assert!(!m.is_taken());
    }

    #[test]
    fn try_lock_reports_busy() {
        let r = region("try");
        let off = create(&r).unwrap();
        let m = unsafe { record(&r, off) };
        assert!(m.try_lock());
        assert!(!m.try_lock());
        assert_eq!(m.unlock(&r), None);
        assert!(m.try_lock());
    }

    #[test]
    fn contended_ownership_transfers_in_fifo_order() {
        let r = region("fifo");
        let off = create(&r).unwrap();
        let m = unsafe { record(&r, off) };
        let a = mk_task(&r);
        let b = mk_task(&r);
        let c = mk_task(&r);

        assert_eq!(m.lock(&r, a), LockOutcome::Acquired);
        assert_eq!(m.lock(&r, b), LockOutcome::MustWait);
        assert_eq!(m.lock(&r, c), LockOutcome::MustWait);
        assert!(m.has_waiters());

        // a releases: b owns, taken stays up.
        assert_eq!(m.unlock(&r), Some(b));
        assert!(m.is_taken());
        // b releases: c owns.
        assert_eq!(m.unlock(&r), Some(c));
        assert!(m.is_taken());
        // c releases: free at last.
        assert_eq!(m.unlock(&r), None);
        assert!(!m.is_taken());
        assert!(!m.has_waiters());
    }

    #[test]
    fn destroy_recycles_the_record() {
        let r = region("destroy");
        let off = create(&r).unwrap();
        let m = unsafe { record(&r, off) };
        assert!(m.try_lock());
        assert_eq!(m.unlock(&r), None);
        destroy(&r, off).unwrap();
        // The freed block comes back for the next mutex.
        let again = create(&r).unwrap();
        assert_eq!(off, again);
    }

    #[test]
    fn free_iff_no_waiters_and_no_owner() {
        // Invariant 4 over a little interleaving.
        let r = region("inv");
        let off = create(&r).unwrap();
        let m = unsafe { record(&r, off) };
        let a = mk_task(&r);
        let b = mk_task(&r);
        assert!(!m.is_taken() && !m.has_waiters());
        m.lock(&r, a);
        m.lock(&r, b);
        assert!(m.is_taken());
        m.unlock(&r);
        // b holds it; list empty but taken.
        assert!(m.is_taken() && !m.has_waiters());
        m.unlock(&r);
        assert!(!m.is_taken() && !m.has_waiters());
    }
}
