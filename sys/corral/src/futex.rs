// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The cross-process suspension primitive.
//!
//! On Linux this is the futex syscall over an `AtomicU32` that lives in the
//! shared region. `FUTEX_PRIVATE_FLAG` is deliberately not used: waiters and
//! wakers are in different processes, coordinating through the shared
//! mapping.
//!
//! Elsewhere, a process-local parking table keyed by word address keeps the
//! crate building for development hosts. That fallback cannot cross a
//! process boundary, which is fine for single-process use and for the test
//! suite.

use core::sync::atomic::AtomicU32;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        use core::sync::atomic::Ordering;

        /// Blocks until `wake` is called on `word`, provided `word` still
        /// holds `expected` at sleep time. Spurious returns are allowed;
        /// callers loop around a predicate.
        pub fn wait(word: &AtomicU32, expected: u32) {
            // Quick check dodges the syscall in the common raced case.
            if word.load(Ordering::Acquire) != expected {
                return;
            }
            // Safety: `word` is a valid, live u32; FUTEX_WAIT does not
            // write through the pointer. EAGAIN/EINTR are normal.
            unsafe {
                libc::syscall(
                    libc::SYS_futex,
                    word.as_ptr(),
                    libc::FUTEX_WAIT,
                    expected,
                    core::ptr::null::<libc::timespec>(),
                    0usize,
                    0u32,
                );
            }
        }

        /// Wakes up to `n` waiters on `word`. Returns how many were woken.
        pub fn wake(word: &AtomicU32, n: i32) -> i32 {
            // Safety: as above; FUTEX_WAKE only reads the address for
            // hashing.
            let r = unsafe {
                libc::syscall(
                    libc::SYS_futex,
                    word.as_ptr(),
                    libc::FUTEX_WAKE,
                    n,
                    core::ptr::null::<libc::timespec>(),
                    0usize,
                    0u32,
                )
            };
            r.max(0) as i32
        }
    } else {
        use std::collections::HashMap;
        use std::sync::{Condvar, Mutex, OnceLock};
        use core::sync::atomic::Ordering;

        struct Table {
            seq: Mutex<HashMap<usize, u64>>,
            cond: Condvar,
        }

        fn table() -> &'static Table {
            static TABLE: OnceLock<Table> = OnceLock::new();
            TABLE.get_or_init(|| Table {
                seq: Mutex::new(HashMap::new()),
                cond: Condvar::new(),
            })
        }

        pub fn wait(word: &AtomicU32, expected: u32) {
            let t = table();
            let key = word.as_ptr() as usize;
            let guard = t.seq.lock().unwrap();
            let seen = guard.get(&key).copied().unwrap_or(0);
            if word.load(Ordering::Acquire) != expected {
                return;
            }
            // Wait for any wake on this address since we sampled `seen`.
            let _unused = t
                .cond
                .wait_timeout_while(
                    guard,
                    std::time::Duration::from_millis(50),
                    |m| m.get(&key).copied().unwrap_or(0) == seen,
                )
                .unwrap();
        }

        pub fn wake(word: &AtomicU32, _n: i32) -> i32 {
            let t = table();
            let key = word.as_ptr() as usize;
            let mut guard = t.seq.lock().unwrap();
            *guard.entry(key).or_insert(0) += 1;
            drop(guard);
            t.cond.notify_all();
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::Ordering;
    use std::sync::Arc;

    #[test]
    fn wake_releases_waiter() {
        let word = Arc::new(AtomicU32::new(0));
        let w2 = Arc::clone(&word);
        let t = std::thread::spawn(move || {
            while w2.load(Ordering::Acquire) == 0 {
                wait(&w2, 0);
            }
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        word.store(1, Ordering::Release);
        wake(&word, i32::MAX);
        t.join().unwrap();
    }

    #[test]
    fn stale_expectation_returns_immediately() {
        let word = AtomicU32::new(7);
        // Must not block: the word does not hold the expected value.
        wait(&word, 3);
    }
}
