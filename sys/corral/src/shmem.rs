// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The shared coordination region.
//!
//! One region exists per isolation scope. It is a named, file-backed
//! mapping whose layout is a fixed [`RegionHeader`] followed by
//! bump-allocated tails: the topology arenas, the CPU ownership and waiter
//! slot vectors, the scheduler server state, and every task record.
//!
//! Everything inside the region is addressed by *offset from the region
//! base*, never by pointer. Each process maps the region wherever the
//! kernel likes (honoring `shared_memory.start` as a hint only) and
//! resolves offsets through its own mapping, so a handle created in one
//! process is meaningful in every other.
//!
//! # Initialization protocol
//!
//! The backing file is created with `shm_open` and sized with `ftruncate`.
//! Whoever holds the exclusive `flock` on the file and observes
//! `state != READY` initializes the region; late attachers take the lock,
//! see `READY`, and just map. The `state` word makes a half-built region
//! impossible to observe without also racing the file lock.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::ffi::CString;

use abi::{Config, GovernorPolicy, IsolationLevel, CURRENT_REGION_MAGIC};

use crate::err::{Error, Result};

/// `RegionHeader::state` values.
pub const STATE_RAW: u32 = 0;
pub const STATE_READY: u32 = 2;

/// Task allocation size classes, bytes. Freed task records are recycled
/// through one free list per class; anything larger than the last class is
/// never recycled (it cannot exist: record + metadata is bounded).
pub const SIZE_CLASSES: [usize; 6] = [256, 512, 1024, 2048, 4096, 8192];

/// Offsets into the region are this type everywhere, to keep them from
/// being confused with counts or pointers. Zero is the null offset: the
/// header lives at zero and is never the target of a handle.
pub type Off = u64;

/// POD snapshot of the tunables every attached process must agree on.
/// Written once by the initializing process; late attachers adopt it and
/// ignore the corresponding keys of their own config.
#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct SharedTunables {
    pub quantum_ns: u64,
    pub queue_batch: u32,
    pub cpus_per_queue: u32,
    pub in_queue_size: u32,
    pub immediate_successor: u32,
    pub governor_policy: u32,
    pub governor_spins: u32,
}

impl SharedTunables {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            quantum_ns: cfg.scheduler.quantum_ns,
            queue_batch: cfg.scheduler.queue_batch.max(1),
            cpus_per_queue: cfg.scheduler.cpus_per_queue.max(1),
            in_queue_size: cfg.scheduler.in_queue_size.max(2),
            immediate_successor: cfg.scheduler.immediate_successor as u32,
            governor_policy: match cfg.governor.policy {
                GovernorPolicy::Busy => 0,
                GovernorPolicy::Idle => 1,
                GovernorPolicy::Hybrid => 2,
            },
            governor_spins: cfg.governor.spins,
        }
    }

    pub fn policy(&self) -> GovernorPolicy {
        match self.governor_policy {
            0 => GovernorPolicy::Busy,
            1 => GovernorPolicy::Idle,
            _ => GovernorPolicy::Hybrid,
        }
    }
}

/// Fixed header at offset zero of every region.
#[repr(C)]
pub struct RegionHeader {
    pub magic: u32,
    /// `STATE_RAW` until the initializing process publishes `STATE_READY`.
    pub state: AtomicU32,
    /// Total region length in bytes.
    pub size: u64,
    /// Live attachments; the detacher that drops this to zero unlinks the
    /// backing file.
    pub attach_count: AtomicU32,
    /// Number of CPUs (logical ids `0..ncpus`). Set during init.
    pub ncpus: u32,
    /// Input rings per process slot.
    pub rings_per_proc: u32,
    pub _pad: u32,
    pub tunables: SharedTunables,
    /// Bump pointer for tail allocation.
    alloc_next: AtomicU64,
    /// Free lists for recycled task allocations, one head per size class,
    /// guarded by one spinlock. A freed block stores the next offset in
    /// its first word.
    free_lock: AtomicU32,
    free_heads: [AtomicU64; SIZE_CLASSES.len()],
    /// Offsets of the tails, set during init.
    pub topology_off: Off,
    pub owners_off: Off,
    pub slots_off: Off,
    pub sched_off: Off,
    pub procs_off: Off,
}

/// A process's mapping of one region.
pub struct Region {
    base: NonNull<u8>,
    len: usize,
    fd: i32,
    name: CString,
}

// Safety: the mapping is shared memory; all mutation inside goes through
// atomics or is guarded by the protocols documented on each structure. The
// Region itself is just the base pointer and bookkeeping.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Opens (creating if absent) the named region and maps it. Returns
    /// the mapping plus `needs_init`: whether this process holds the
    /// exclusive file lock and must initialize before calling
    /// [`Region::publish_ready`]. When `needs_init` is false the file lock
    /// has already been dropped.
    pub fn open(name: &str, size: usize, start_hint: u64) -> Result<(Region, bool)> {
        let cname = CString::new(name).map_err(|_| {
            Error::Config(format!("shared memory name {name:?} contains NUL"))
        })?;
        if size < core::mem::size_of::<RegionHeader>() + 4096 {
            return Err(Error::Config(format!(
                "shared memory size {size} is too small to hold the region header"
            )));
        }

        // Safety: plain libc calls with a valid C string; we own the
        // returned fd.
        let fd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_RDWR,
                0o600 as libc::mode_t,
            )
        };
        if fd < 0 {
            return Err(Error::last_os("shm_open"));
        }

        // Serialize initialization against other attachers.
        if unsafe { libc::flock(fd, libc::LOCK_EX) } != 0 {
            let e = Error::last_os("flock");
            unsafe { libc::close(fd) };
            return Err(e);
        }

        let mut st: libc::stat = unsafe { core::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut st) } != 0 {
            let e = Error::last_os("fstat");
            unsafe { libc::close(fd) };
            return Err(e);
        }
        let len = if st.st_size == 0 {
            if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
                let e = Error::last_os("ftruncate");
                unsafe { libc::close(fd) };
                return Err(e);
            }
            size
        } else {
            st.st_size as usize
        };

        // Safety: mapping a file we just opened, shared, full length. The
        // hint address is advisory (no MAP_FIXED), so a collision cannot
        // clobber anything.
        let base = unsafe {
            libc::mmap(
                start_hint as *mut libc::c_void,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            let e = Error::last_os("mmap");
            unsafe { libc::close(fd) };
            return Err(e);
        }
        let region = Region {
            base: NonNull::new(base as *mut u8).unwrap(),
            len,
            fd,
            name: cname,
        };

        let needs_init =
            region.header().state.load(Ordering::Acquire) != STATE_READY;
        if needs_init {
            // Fresh (or abandoned mid-init, which we treat the same way:
            // the file lock proves nobody else is using it). Reset the
            // allocator and stamp the identity fields; the caller fills in
            // the tails.
            // Safety: exclusive via the file lock; nobody else can have
            // attached a READY region.
            unsafe {
                let h = region.at_ptr::<RegionHeader>(0);
                (*h).magic = CURRENT_REGION_MAGIC;
                (*h).size = len as u64;
                (*h).state.store(STATE_RAW, Ordering::Relaxed);
                let first =
                    align_up(core::mem::size_of::<RegionHeader>() as u64, 64);
                (*h).alloc_next.store(first, Ordering::Relaxed);
                for head in &(*h).free_heads {
                    head.store(0, Ordering::Relaxed);
                }
            }
        } else {
            let header = region.header();
            if header.magic != CURRENT_REGION_MAGIC {
                let e = Error::Config(format!(
                    "shared region {name:?} has magic {:#x}, expected {:#x}",
                    header.magic, CURRENT_REGION_MAGIC
                ));
                region.funlock();
                return Err(e);
            }
            region.funlock();
        }
        Ok((region, needs_init))
    }

    /// Marks initialization complete and drops the file lock. Only the
    /// process that got `needs_init == true` may call this, once.
    pub fn publish_ready(&self) {
        self.header().state.store(STATE_READY, Ordering::Release);
        self.funlock();
    }

    fn funlock(&self) {
        unsafe { libc::flock(self.fd, libc::LOCK_UN) };
    }

    /// Removes the region name from the filesystem. Called by the last
    /// detacher; racing attachers will then create a fresh region.
    pub fn unlink(&self) {
        unsafe { libc::shm_unlink(self.name.as_ptr()) };
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn header(&self) -> &RegionHeader {
        // Safety: the header is at offset 0 by construction and the
        // mapping is at least header-sized (checked in `open`).
        unsafe { &*(self.base.as_ptr() as *const RegionHeader) }
    }

    /// Resolves an offset to a shared reference.
    ///
    /// # Safety
    ///
    /// `off` must be the offset of a live, properly initialized `T`,
    /// allocated inside this region, and all mutation of that `T` must go
    /// through atomics or a documented exclusion protocol.
    pub unsafe fn at<T>(&self, off: Off) -> &T {
        debug_assert!(off as usize + core::mem::size_of::<T>() <= self.len);
        debug_assert_eq!(off as usize % core::mem::align_of::<T>(), 0);
        &*(self.base.as_ptr().add(off as usize) as *const T)
    }

    /// Raw-pointer variant of [`Region::at`], for initialization writes.
    ///
    /// # Safety
    ///
    /// As [`Region::at`], except the target need not be initialized yet.
    pub unsafe fn at_ptr<T>(&self, off: Off) -> *mut T {
        debug_assert!(off as usize + core::mem::size_of::<T>() <= self.len);
        self.base.as_ptr().add(off as usize) as *mut T
    }

    /// Resolves an offset to a shared slice of `n` elements.
    ///
    /// # Safety
    ///
    /// As [`Region::at`], for all `n` elements.
    pub unsafe fn slice<T>(&self, off: Off, n: usize) -> &[T] {
        debug_assert!(off as usize + n * core::mem::size_of::<T>() <= self.len);
        core::slice::from_raw_parts(self.base.as_ptr().add(off as usize) as *const T, n)
    }

    /// Bump-allocates `size` bytes at `align` from the tail space. The
    /// memory is zero on a fresh region (fresh shm pages read as zero).
    pub fn alloc(&self, size: usize, align: usize) -> Result<Off> {
        debug_assert!(align.is_power_of_two());
        let header = self.header();
        loop {
            let cur = header.alloc_next.load(Ordering::Relaxed);
            let at = align_up(cur, align as u64);
            let next = at + size as u64;
            if next > self.len as u64 {
                return Err(abi::Status::OutOfMemory.into());
            }
            if header
                .alloc_next
                .compare_exchange_weak(cur, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(at);
            }
        }
    }

    /// Allocates a task-sized block, preferring the recycled free lists.
    /// Returns the offset and the class-rounded size actually allocated.
    pub fn alloc_task_block(&self, size: usize) -> Result<(Off, usize)> {
        let class = match SIZE_CLASSES.iter().position(|&c| c >= size) {
            Some(c) => c,
            None => return Err(abi::Status::InvalidMetadataSize.into()),
        };
        let header = self.header();
        self.with_free_lock(|| {
            let head = header.free_heads[class].load(Ordering::Relaxed);
            if head != 0 {
                // Safety: offsets on a free list were valid task blocks
                // whose first word now stores the next link.
                let next = unsafe { *self.at_ptr::<u64>(head) };
                header.free_heads[class].store(next, Ordering::Relaxed);
                Some(head)
            } else {
                None
            }
        })
        .map(|off| Ok((off, SIZE_CLASSES[class])))
        .unwrap_or_else(|| {
            let off = self.alloc(SIZE_CLASSES[class], 64)?;
            Ok((off, SIZE_CLASSES[class]))
        })
    }

    /// Returns a task block to its free list. `size` must be the
    /// class-rounded size from `alloc_task_block`.
    pub fn free_task_block(&self, off: Off, size: usize) {
        let class = SIZE_CLASSES
            .iter()
            .position(|&c| c == size)
            .expect("freeing a block with a non-class size");
        let header = self.header();
        self.with_free_lock(|| {
            let head = header.free_heads[class].load(Ordering::Relaxed);
            // Safety: the block is dead; reusing its first word as the
            // link is the free-list representation.
            unsafe { *self.at_ptr::<u64>(off) = head };
            header.free_heads[class].store(off, Ordering::Relaxed);
        });
    }

    fn with_free_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        let lock = &self.header().free_lock;
        while lock
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        let r = f();
        lock.store(0, Ordering::Release);
        r
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // Safety: unmapping our own mapping; the fd is ours.
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.len);
            libc::close(self.fd);
        }
    }
}

pub fn align_up(v: u64, align: u64) -> u64 {
    (v + align - 1) & !(align - 1)
}

/// Builds the scoped region name: the configured base name plus the
/// isolation qualifier, shm-style (leading slash, no others).
pub fn region_name(base: &str, isolation: IsolationLevel) -> String {
    let scope = match isolation {
        IsolationLevel::Process => format!("pid{}", nix::unistd::getpid().as_raw()),
        IsolationLevel::User => format!("uid{}", nix::unistd::getuid().as_raw()),
        IsolationLevel::Group => format!("gid{}", nix::unistd::getgid().as_raw()),
        IsolationLevel::Public => "pub".to_string(),
    };
    format!("/{base}-{scope}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        // Tests in one binary share a pid; the tag keeps them apart.
        format!(
            "/corral-test-{}-{tag}",
            nix::unistd::getpid().as_raw()
        )
    }

    fn open_fresh(tag: &str, size: usize) -> Region {
        let name = unique_name(tag);
        unsafe { libc::shm_unlink(CString::new(name.clone()).unwrap().as_ptr()) };
        let (region, needs_init) = Region::open(&name, size, 0).unwrap();
        assert!(needs_init);
        region
    }

    #[test]
    fn create_init_reattach() {
        let region = open_fresh("create", 1 << 20);
        region.publish_ready();

        let (again, needs_init) =
            Region::open(&unique_name("create"), 1 << 20, 0).unwrap();
        assert!(!needs_init);
        assert_eq!(again.header().magic, CURRENT_REGION_MAGIC);
        again.unlink();
    }

    #[test]
    fn bump_allocation_is_aligned_and_bounded() {
        let region = open_fresh("bump", 1 << 20);
        let a = region.alloc(100, 64).unwrap();
        let b = region.alloc(100, 64).unwrap();
        assert_eq!(a % 64, 0);
        assert_eq!(b % 64, 0);
        assert!(b >= a + 100);
        // Exhaust.
        assert!(region.alloc(2 << 20, 8).is_err());
        region.unlink();
    }

    #[test]
    fn task_blocks_recycle() {
        let region = open_fresh("recycle", 1 << 20);
        let (a, sz) = region.alloc_task_block(300).unwrap();
        assert_eq!(sz, 512);
        region.free_task_block(a, sz);
        let (b, sz2) = region.alloc_task_block(400).unwrap();
        assert_eq!((a, sz), (b, sz2), "freed block should be reused");
        // Oversized requests are rejected, not bumped.
        assert!(region.alloc_task_block(100_000).is_err());
        region.unlink();
    }

    #[test]
    fn scoped_names() {
        assert!(region_name("x", IsolationLevel::Public).starts_with("/x-pub"));
        let u = region_name("x", IsolationLevel::User);
        assert!(u.starts_with("/x-uid"));
    }
}
