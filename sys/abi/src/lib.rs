// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Runtime ABI definitions, shared between the core and everything that
//! talks to it.
//!
//! Types in this crate fall into three groups:
//!
//! - Layout-pinned constants and records that appear in the shared
//!   coordination region and must mean the same thing to every attached
//!   process (the magic number, capacity constants, locality levels).
//! - The closed status-code enumeration surfaced at API boundaries.
//! - The configuration record. Loading it from disk is someone else's job;
//!   this crate only defines the recognized keys and their defaults.

use serde::{Deserialize, Serialize};

/// Magic number at the start of a coordination region, to reassure an
/// attaching process that it is not mapping somebody else's file.
pub const CURRENT_REGION_MAGIC: u32 = 0xC0EC_0901;

/// Maximum number of processes that can be attached to one region at a
/// time. Process slots are statically sized in the region header; changing
/// this is an ABI change.
pub const MAX_PROCS: usize = 64;

/// Upper bound on the inline metadata block a task can carry. Requests past
/// this fail with [`Status::InvalidMetadataSize`].
pub const TASK_METADATA_MAX: usize = 4096;

/// Number of levels in the locality hierarchy.
pub const LEVEL_COUNT: usize = 5;

/// One level of the locality hierarchy, coarsest first.
///
/// The numeric values index per-level arrays (domain arenas, parent id
/// vectors) throughout the runtime, so they are pinned.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Level {
    /// The whole instance. Exactly one domain.
    Node = 0,
    /// A NUMA node.
    Numa = 1,
    /// An administrative grouping of cores, typically a last-level-cache
    /// domain.
    ComplexSet = 2,
    /// A physical core; covers its hardware threads.
    Core = 3,
    /// A single hardware thread.
    Cpu = 4,
}

impl Level {
    /// All levels, coarsest first.
    pub const ALL: [Level; LEVEL_COUNT] = [
        Level::Node,
        Level::Numa,
        Level::ComplexSet,
        Level::Core,
        Level::Cpu,
    ];

    /// Index of this level into per-level arrays.
    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(i: usize) -> Option<Level> {
        Level::ALL.get(i).copied()
    }

    /// The next coarser level, or `None` at `Node`.
    pub fn coarser(self) -> Option<Level> {
        Level::from_index(self.index().wrapping_sub(1))
    }

    /// The next finer level, or `None` at `Cpu`.
    pub fn finer(self) -> Option<Level> {
        Level::from_index(self.index() + 1)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Level::Node => "node",
            Level::Numa => "numa",
            Level::ComplexSet => "complex_set",
            Level::Core => "core",
            Level::Cpu => "cpu",
        }
    }
}

impl core::fmt::Display for Level {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// How strongly a task is bound to its affinity domain.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AffinityPolicy {
    /// Only a CPU inside the annotated domain may run the task.
    Strict,
    /// Start in the annotated domain if possible, fall back anywhere.
    Preferred,
}

/// A task's placement request: a domain at some level, plus how hard to try.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Affinity {
    pub level: Level,
    /// Logical id of the domain at `level`.
    pub domain: u32,
    pub policy: AffinityPolicy,
}

/// Governor spin→sleep policy.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GovernorPolicy {
    /// Unserved waiters are released immediately and spin in user code.
    Busy,
    /// Unserved waiters park on their futex at once.
    Idle,
    /// Spin up to a configured count, then park. Threshold zero behaves as
    /// `Idle`.
    Hybrid,
}

/// Which other processes may share a coordination region.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationLevel {
    /// Region private to this process.
    Process,
    /// Shared among processes of the same user.
    User,
    /// Shared among processes of the same group.
    Group,
    /// Shared with anyone who knows the name.
    Public,
}

/// Status codes surfaced at API boundaries.
///
/// This is a closed enumeration with pinned negative discriminants, so the
/// values can cross a C boundary unchanged. Zero is success and is not
/// represented here; operations return `Result<_, _>` and the error side
/// maps onto these.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum Status {
    InvalidCallback = -1,
    InvalidMetadataSize = -2,
    InvalidOperation = -3,
    InvalidParameter = -4,
    NotInitialized = -5,
    OutOfMemory = -6,
    OutsideTask = -7,
    Unknown = -8,
    Busy = -9,
}

impl Status {
    pub const fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Status> {
        use Status::*;
        Some(match code {
            -1 => InvalidCallback,
            -2 => InvalidMetadataSize,
            -3 => InvalidOperation,
            -4 => InvalidParameter,
            -5 => NotInitialized,
            -6 => OutOfMemory,
            -7 => OutsideTask,
            -8 => Unknown,
            -9 => Busy,
            _ => return None,
        })
    }

    pub const fn describe(self) -> &'static str {
        match self {
            Status::InvalidCallback => "invalid callback",
            Status::InvalidMetadataSize => "invalid metadata size",
            Status::InvalidOperation => "invalid operation",
            Status::InvalidParameter => "invalid parameter",
            Status::NotInitialized => "runtime not initialized",
            Status::OutOfMemory => "out of shared memory",
            Status::OutsideTask => "no task context",
            Status::Unknown => "unknown error",
            Status::Busy => "resource busy",
        }
    }
}

impl core::fmt::Display for Status {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.describe())
    }
}

bitflags::bitflags! {
    /// Capability bits on a task record.
    ///
    /// The runtime core only reads `PARALLEL`; the counter/monitoring bits
    /// reserve dispatch space for the external instrumentation
    /// collaborators, which tag tasks they have decorated.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct TaskFlags: u32 {
        /// Degree is greater than one.
        const PARALLEL = 1 << 0;
        /// An external counters block is attached.
        const HAS_COUNTERS = 1 << 1;
        /// An external monitoring block is attached.
        const HAS_MONITORING = 1 << 2;
    }
}

/// Full configuration record.
///
/// All fields have serviceable defaults; a defaulted `Config` attaches a
/// user-scoped region over the inherited CPU mask.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub topology: TopologyConfig,
    pub scheduler: SchedulerConfig,
    pub governor: GovernorConfig,
    pub shared_memory: SharedMemoryConfig,
}

/// `topology.*` keys.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// CPU mask for the instance: `inherit`, `all`, `cores`, or an explicit
    /// CPU-list / hex-mask string.
    pub binding: String,
    /// One CPU-list string per NUMA node. When absent the nodes are taken
    /// from the OS.
    pub numa_nodes: Option<Vec<String>>,
    /// One CPU-list string per complex set. When absent every core gets a
    /// singleton complex set.
    pub complex_sets: Option<Vec<String>>,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            binding: "inherit".to_string(),
            numa_nodes: None,
            complex_sets: None,
        }
    }
}

/// `scheduler.*` keys.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Wall-clock budget, in nanoseconds, after which a running task is
    /// signaled to yield at its next scheduling point. Zero disables.
    pub quantum_ns: u64,
    /// Maximum tasks drained from input queues per server pass.
    pub queue_batch: u32,
    /// How many CPUs share one input ring.
    pub cpus_per_queue: u32,
    /// Capacity of each input ring.
    pub in_queue_size: u32,
    /// Enables the immediate-successor hand-off hint.
    pub immediate_successor: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            quantum_ns: 20_000_000,
            queue_batch: 64,
            cpus_per_queue: 1,
            in_queue_size: 256,
            immediate_successor: true,
        }
    }
}

/// `governor.*` keys.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    pub policy: GovernorPolicy,
    /// Spin threshold for the hybrid policy.
    pub spins: u32,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            policy: GovernorPolicy::Hybrid,
            spins: 10_000,
        }
    }
}

/// `shared_memory.*` keys.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedMemoryConfig {
    pub isolation_level: IsolationLevel,
    /// Base name of the region; the isolation scope is appended.
    pub name: String,
    /// Region size in bytes.
    pub size: u64,
    /// Requested mapping address, or zero to let the kernel choose. The
    /// runtime addresses the region by offset, so this is only a hint.
    pub start: u64,
}

impl Default for SharedMemoryConfig {
    fn default() -> Self {
        Self {
            isolation_level: IsolationLevel::User,
            name: "corral".to_string(),
            size: 8 * 1024 * 1024,
            start: 0,
        }
    }
}
