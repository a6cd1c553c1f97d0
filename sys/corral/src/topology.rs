// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The hardware topology model.
//!
//! Five levels: node / numa / complex-set / core / cpu, coarsest first.
//! Every CPU claimed by the instance gets a dense *logical* id; every
//! domain at every level gets a dense logical id within its level plus the
//! *system* id the OS knows it by. Domains store only parent logical ids
//! (one per level); child lists are derived on demand from the per-level
//! arenas, so there are no cyclic references and the whole tree is plain
//! data.
//!
//! Construction is split so the interesting part is pure:
//!
//! - [`HostInfo`] carries everything we need from the machine (online set,
//!   effective affinity, sibling lists, NUMA node lists). `probe` reads
//!   sysfs and asks the scheduler; tests build `HostInfo` by hand.
//! - [`TopologyPlan::build`] turns a `HostInfo` plus the topology config
//!   into the full tree, or a fatal configuration error.
//! - [`TopologyPlan::write_into`] freezes the plan into the shared
//!   region's arenas, after which the tree is immutable.

use std::fs;

use abi::{Level, LEVEL_COUNT};
use cpuset::CpuSet;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::err::{Error, Result};
use crate::shmem::{Off, Region};

/// Parent id meaning "not set".
pub const NO_PARENT: i32 = -1;

/// One domain of the locality tree, as stored in the per-level arenas.
#[derive(Copy, Clone, Debug, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct DomainRecord {
    /// `Level` index of this domain.
    pub level: u32,
    /// Id as reported by the OS (or the config entry index for levels the
    /// OS does not name).
    pub system_id: u32,
    /// Dense 0-based id within the level.
    pub logical_id: u32,
    pub _pad: u32,
    /// Parent logical ids, indexed by level. The entry for the domain's
    /// own level holds its own logical id; finer entries stay `NO_PARENT`.
    pub parents: [i32; LEVEL_COUNT],
    pub _pad2: u32,
    /// System ids of the CPUs this domain covers.
    pub cpus_system: CpuSet,
    /// Logical ids of the same CPUs.
    pub cpus_logical: CpuSet,
}

impl DomainRecord {
    fn new(level: Level, system_id: u32, logical_id: u32, cpus_system: CpuSet) -> Self {
        let mut parents = [NO_PARENT; LEVEL_COUNT];
        parents[level.index()] = logical_id as i32;
        Self {
            level: level.index() as u32,
            system_id,
            logical_id,
            _pad: 0,
            parents,
            _pad2: 0,
            cpus_system,
            cpus_logical: CpuSet::empty(),
        }
    }
}

/// Everything topology construction needs to know about the machine.
#[derive(Clone, Debug)]
pub struct HostInfo {
    /// CPUs the OS reports online.
    pub online: CpuSet,
    /// The process's effective CPU mask.
    pub affinity: CpuSet,
    /// Thread-sibling set per system CPU id (indexed by id; empty entries
    /// mean unknown and are treated as singleton cores).
    pub siblings: Vec<CpuSet>,
    /// CPU list per NUMA node, in OS node order. `None` when the machine
    /// (or OS) exposes no NUMA information.
    pub numa_nodes: Option<Vec<CpuSet>>,
}

impl HostInfo {
    /// Reads the live machine.
    pub fn probe() -> Result<HostInfo> {
        let online = read_cpu_list("/sys/devices/system/cpu/online")
            .unwrap_or_else(fallback_online);
        let affinity = current_affinity()?;

        let mut siblings = vec![CpuSet::empty(); CpuSet::CAPACITY];
        for cpu in online.iter() {
            let path = format!(
                "/sys/devices/system/cpu/cpu{cpu}/topology/thread_siblings_list"
            );
            siblings[cpu] = read_cpu_list(&path)
                .unwrap_or_else(|| [cpu].into_iter().collect());
        }

        let numa_nodes = read_cpu_list("/sys/devices/system/node/online").map(|nodes| {
            nodes
                .iter()
                .map(|node| {
                    let path = format!("/sys/devices/system/node/node{node}/cpulist");
                    read_cpu_list(&path).unwrap_or_else(CpuSet::empty)
                })
                .collect()
        });

        Ok(HostInfo {
            online,
            affinity,
            siblings,
            numa_nodes,
        })
    }

    fn siblings_of(&self, cpu: usize) -> CpuSet {
        match self.siblings.get(cpu) {
            Some(s) if !s.is_empty() => *s,
            _ => [cpu].into_iter().collect(),
        }
    }
}

fn read_cpu_list(path: &str) -> Option<CpuSet> {
    let text = fs::read_to_string(path).ok()?;
    text.trim().parse().ok()
}

fn fallback_online() -> CpuSet {
    let n = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(CpuSet::CAPACITY);
    CpuSet::first_n(n)
}

#[cfg(target_os = "linux")]
fn current_affinity() -> Result<CpuSet> {
    let os = nix::sched::sched_getaffinity(nix::unistd::Pid::from_raw(0))
        .map_err(|e| Error::Env {
            op: "sched_getaffinity",
            errno: e as i32,
        })?;
    let mut set = CpuSet::empty();
    for cpu in 0..CpuSet::CAPACITY {
        if os.is_set(cpu).unwrap_or(false) {
            set.insert(cpu);
        }
    }
    Ok(set)
}

#[cfg(not(target_os = "linux"))]
fn current_affinity() -> Result<CpuSet> {
    // No affinity syscalls on the portable development path; the process
    // may run anywhere, so "inherit" means every online CPU.
    Ok(fallback_online())
}

/// Applies the kernel round-trip correction to a candidate binding mask:
/// set it, read back what stuck, restore the original mask, and return the
/// intersection. Some architectures report "online" CPUs the scheduler
/// will refuse; this is how we find out.
#[cfg(target_os = "linux")]
pub fn correct_binding(mask: &CpuSet) -> Result<CpuSet> {
    let pid = nix::unistd::Pid::from_raw(0);
    let original = nix::sched::sched_getaffinity(pid).map_err(|e| Error::Env {
        op: "sched_getaffinity",
        errno: e as i32,
    })?;

    let mut want = nix::sched::CpuSet::new();
    for cpu in mask.iter() {
        let _ = want.set(cpu);
    }
    if nix::sched::sched_setaffinity(pid, &want).is_err() {
        // The whole mask was refused; nothing in it is usable.
        return Ok(CpuSet::empty());
    }
    let effective = current_affinity();
    let _ = nix::sched::sched_setaffinity(pid, &original);
    Ok(effective?.intersection(mask))
}

#[cfg(not(target_os = "linux"))]
pub fn correct_binding(mask: &CpuSet) -> Result<CpuSet> {
    Ok(*mask)
}

/// The `topology.binding` modes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Binding {
    Inherit,
    All,
    Cores,
    Explicit(CpuSet),
}

impl Binding {
    pub fn parse(text: &str) -> Result<Binding> {
        match text.trim() {
            "inherit" => Ok(Binding::Inherit),
            "all" => Ok(Binding::All),
            "cores" => Ok(Binding::Cores),
            other => other
                .parse()
                .map(Binding::Explicit)
                .map_err(|e| Error::Config(format!("topology.binding {other:?}: {e}"))),
        }
    }

    /// Resolves the mode to a concrete set of system CPU ids.
    pub fn resolve(&self, host: &HostInfo) -> Result<CpuSet> {
        let valid = match self {
            Binding::Inherit => host.affinity,
            Binding::All => host.online,
            Binding::Cores => {
                // One CPU per core: the least sibling of every core in the
                // inherited mask.
                let mut picked = CpuSet::empty();
                let mut seen = CpuSet::empty();
                for cpu in host.affinity.iter() {
                    if seen.contains(cpu) {
                        continue;
                    }
                    let core = host.siblings_of(cpu).intersection(&host.affinity);
                    seen = seen.union(&core);
                    if let Some(first) = core.first() {
                        picked.insert(first);
                    }
                }
                picked
            }
            Binding::Explicit(mask) => mask.intersection(&host.online),
        };
        if valid.is_empty() {
            return Err(Error::Config(
                "topology.binding selects no usable CPU".to_string(),
            ));
        }
        Ok(valid)
    }
}

/// Parsed topology config entries.
#[derive(Clone, Debug, Default)]
pub struct TopologyLists {
    pub complex_sets: Option<Vec<CpuSet>>,
    pub numa_nodes: Option<Vec<CpuSet>>,
}

impl TopologyLists {
    pub fn parse(cfg: &abi::TopologyConfig) -> Result<TopologyLists> {
        let parse_all = |name: &str, lists: &Option<Vec<String>>| -> Result<Option<Vec<CpuSet>>> {
            match lists {
                None => Ok(None),
                Some(texts) => texts
                    .iter()
                    .map(|t| {
                        t.parse().map_err(|e| {
                            Error::Config(format!("topology.{name} entry {t:?}: {e}"))
                        })
                    })
                    .collect::<Result<Vec<CpuSet>>>()
                    .map(Some),
            }
        };
        Ok(TopologyLists {
            complex_sets: parse_all("complex_sets", &cfg.complex_sets)?,
            numa_nodes: parse_all("numa_nodes", &cfg.numa_nodes)?,
        })
    }
}

/// The fully built tree, heap-side, prior to freezing into the region.
#[derive(Clone, Debug)]
pub struct TopologyPlan {
    /// Domains per level, logical id = index.
    pub levels: [Vec<DomainRecord>; LEVEL_COUNT],
    /// System CPU id → logical CPU id, `-1` where invalid.
    pub sys_to_logical: Vec<i32>,
}

impl TopologyPlan {
    /// Builds the five-level tree over `valid` (system CPU ids), per the
    /// construction order: cores+cpus, complex sets, NUMA, node. Any
    /// configuration inconsistency is fatal.
    pub fn build(host: &HostInfo, valid: &CpuSet, lists: &TopologyLists) -> Result<TopologyPlan> {
        let mut plan = TopologyPlan {
            levels: Default::default(),
            sys_to_logical: vec![NO_PARENT; CpuSet::CAPACITY],
        };

        plan.build_cores_and_cpus(host, valid);
        plan.build_complex_sets(valid, lists.complex_sets.as_deref())?;
        plan.build_numa(host, valid, lists.numa_nodes.as_deref())?;
        plan.build_node(valid)?;
        plan.finish_logical_covers();
        plan.verify(valid);
        Ok(plan)
    }

    /// Step 1: one core per thread-sibling group, one cpu domain per valid
    /// CPU, with logical cpu ids assigned *interleaved* across cores: pass
    /// k numbers the k-th sibling of every core in system-id order, so the
    /// first N logical CPUs land on N distinct cores whenever possible.
    fn build_cores_and_cpus(&mut self, host: &HostInfo, valid: &CpuSet) {
        let mut cores: Vec<CpuSet> = Vec::new();
        let mut placed = CpuSet::empty();
        for cpu in valid.iter() {
            if placed.contains(cpu) {
                continue;
            }
            let members = host.siblings_of(cpu).intersection(valid);
            placed = placed.union(&members);
            cores.push(members);
        }
        // Discovery order is ascending minimum member, which is the core's
        // system id, so `cores` is already in system-id order.

        for (idx, members) in cores.iter().enumerate() {
            let sys = members.first().expect("core with no members") as u32;
            self.levels[Level::Core.index()].push(DomainRecord::new(
                Level::Core,
                sys,
                idx as u32,
                *members,
            ));
        }

        // Interleaved logical id assignment.
        let mut next_logical = 0u32;
        let widest = cores.iter().map(|c| c.count()).max().unwrap_or(0);
        for pass in 0..widest {
            for (core_idx, members) in cores.iter().enumerate() {
                let Some(cpu) = members.iter().nth(pass) else {
                    continue;
                };
                let mut rec = DomainRecord::new(
                    Level::Cpu,
                    cpu as u32,
                    next_logical,
                    [cpu].into_iter().collect(),
                );
                rec.parents[Level::Core.index()] = core_idx as i32;
                self.sys_to_logical[cpu] = next_logical as i32;
                self.levels[Level::Cpu.index()].push(rec);
                next_logical += 1;
            }
        }
    }

    /// Step 2: complex sets from config, expanded to whole cores, plus a
    /// singleton wrapper around every core the config left unparented.
    fn build_complex_sets(&mut self, valid: &CpuSet, entries: Option<&[CpuSet]>) -> Result<()> {
        let mut claimed = CpuSet::empty();
        let mut sets: Vec<CpuSet> = Vec::new();

        for (idx, entry) in entries.unwrap_or(&[]).iter().enumerate() {
            let overlap = entry.intersection(valid);
            if overlap.is_empty() {
                return Err(Error::Config(format!(
                    "topology.complex_sets entry {idx} ({entry}) covers no valid CPU"
                )));
            }
            // An entry naming part of a core claims the whole core.
            let mut cover = CpuSet::empty();
            for core in &self.levels[Level::Core.index()] {
                if !core.cpus_system.is_disjoint(&overlap) {
                    cover = cover.union(&core.cpus_system);
                }
            }
            if !claimed.is_disjoint(&cover) {
                return Err(Error::Config(format!(
                    "topology.complex_sets entry {idx} ({entry}) overlaps another complex set"
                )));
            }
            claimed = claimed.union(&cover);
            sets.push(cover);
        }

        // Total coverage: wrap the leftover cores.
        for core_idx in 0..self.levels[Level::Core.index()].len() {
            let cpus = self.levels[Level::Core.index()][core_idx].cpus_system;
            if claimed.is_disjoint(&cpus) {
                claimed = claimed.union(&cpus);
                sets.push(cpus);
            }
        }

        for (idx, cover) in sets.into_iter().enumerate() {
            let rec = DomainRecord::new(Level::ComplexSet, idx as u32, idx as u32, cover);
            self.levels[Level::ComplexSet.index()].push(rec);
            self.stamp_parents(Level::ComplexSet, idx as u32)?;
        }
        Ok(())
    }

    /// Step 3: NUMA nodes from config if given, else from the OS filtered
    /// to nodes with at least one valid CPU, else one node over everything.
    fn build_numa(
        &mut self,
        host: &HostInfo,
        valid: &CpuSet,
        entries: Option<&[CpuSet]>,
    ) -> Result<()> {
        let mut nodes: Vec<(u32, CpuSet)> = Vec::new();
        match entries {
            Some(lists) => {
                for (idx, entry) in lists.iter().enumerate() {
                    let overlap = entry.intersection(valid);
                    if overlap.is_empty() {
                        return Err(Error::Config(format!(
                            "topology.numa_nodes entry {idx} ({entry}) covers no valid CPU"
                        )));
                    }
                    nodes.push((idx as u32, overlap));
                }
            }
            None => match &host.numa_nodes {
                Some(lists) => {
                    for (idx, entry) in lists.iter().enumerate() {
                        let overlap = entry.intersection(valid);
                        if !overlap.is_empty() {
                            nodes.push((idx as u32, overlap));
                        }
                    }
                }
                None => nodes.push((0, *valid)),
            },
        }
        if nodes.is_empty() {
            // OS listed nodes but none covered a valid CPU.
            nodes.push((0, *valid));
        }

        let mut covered = CpuSet::empty();
        for &(_, ref cpus) in &nodes {
            if !covered.is_disjoint(cpus) {
                return Err(Error::Config(
                    "topology.numa_nodes entries overlap".to_string(),
                ));
            }
            covered = covered.union(cpus);
        }
        if covered != *valid {
            return Err(Error::Config(format!(
                "NUMA nodes cover {covered} but the instance binds {valid}"
            )));
        }

        for (logical, (sys, cpus)) in nodes.into_iter().enumerate() {
            let rec = DomainRecord::new(Level::Numa, sys, logical as u32, cpus);
            self.levels[Level::Numa.index()].push(rec);
            self.stamp_parents(Level::Numa, logical as u32)?;
        }
        Ok(())
    }

    /// Step 4: the single node domain over every valid CPU.
    fn build_node(&mut self, valid: &CpuSet) -> Result<()> {
        let rec = DomainRecord::new(Level::Node, 0, 0, *valid);
        self.levels[Level::Node.index()].push(rec);
        self.stamp_parents(Level::Node, 0)
    }

    /// Propagates a freshly built domain's logical id downward: for every
    /// CPU it covers, walk from the cpu domain up to the level just under
    /// the new one, stamping the parent entry, and abort if an earlier
    /// stamp disagrees.
    fn stamp_parents(&mut self, level: Level, logical: u32) -> Result<()> {
        let cover = self.levels[level.index()][logical as usize].cpus_system;
        for cpu in cover.iter() {
            let cpu_logical = self.sys_to_logical[cpu];
            debug_assert!(cpu_logical >= 0, "stamping a CPU that was never placed");
            let mut walk: Vec<(usize, usize)> = Vec::with_capacity(LEVEL_COUNT);
            {
                let rec = &self.levels[Level::Cpu.index()][cpu_logical as usize];
                walk.push((Level::Cpu.index(), cpu_logical as usize));
                for finer in (level.index() + 1)..Level::Cpu.index() {
                    let p = rec.parents[finer];
                    if p >= 0 {
                        walk.push((finer, p as usize));
                    }
                }
            }
            for (lvl, idx) in walk {
                let slot = &mut self.levels[lvl][idx].parents[level.index()];
                if *slot == NO_PARENT {
                    *slot = logical as i32;
                } else if *slot != logical as i32 {
                    return Err(Error::Config(format!(
                        "cpu {cpu}: {} domain {idx} is claimed by two {} domains ({} and {logical})",
                        Level::from_index(lvl).unwrap(),
                        level,
                        *slot,
                    )));
                }
            }
        }
        Ok(())
    }

    /// Fills in every domain's logical CPU set from its system set.
    fn finish_logical_covers(&mut self) {
        let map = self.sys_to_logical.clone();
        for level in &mut self.levels {
            for rec in level {
                let mut logical = CpuSet::empty();
                for cpu in rec.cpus_system.iter() {
                    debug_assert!(map[cpu] >= 0);
                    logical.insert(map[cpu] as usize);
                }
                rec.cpus_logical = logical;
            }
        }
    }

    /// Post-conditions, checked by assertion: ancestry total, sibling
    /// covers disjoint, child unions exact.
    fn verify(&self, valid: &CpuSet) {
        assert_eq!(self.levels[Level::Node.index()].len(), 1);
        assert_eq!(self.levels[Level::Node.index()][0].cpus_system, *valid);

        for level in Level::ALL {
            let mut seen = CpuSet::empty();
            for rec in &self.levels[level.index()] {
                assert!(
                    seen.is_disjoint(&rec.cpus_system),
                    "{level} siblings overlap"
                );
                seen = seen.union(&rec.cpus_system);
                for coarser in 0..level.index() {
                    assert!(
                        rec.parents[coarser] >= 0,
                        "{level} domain {} missing its {} parent",
                        rec.logical_id,
                        Level::from_index(coarser).unwrap(),
                    );
                }
            }
            assert_eq!(seen, *valid, "{level} does not cover the binding");

            // Child unions are exact.
            if let Some(finer) = level.finer() {
                for rec in &self.levels[level.index()] {
                    let mut union = CpuSet::empty();
                    for child in &self.levels[finer.index()] {
                        if child.parents[level.index()] == rec.logical_id as i32 {
                            union = union.union(&child.cpus_system);
                        }
                    }
                    assert_eq!(
                        union, rec.cpus_system,
                        "{level} domain {} does not equal its children's union",
                        rec.logical_id
                    );
                }
            }
        }

        // Every CPU of a domain's cover reports that domain as its parent.
        for level in Level::ALL {
            for rec in &self.levels[level.index()] {
                for cpu in rec.cpus_system.iter() {
                    let cl = self.sys_to_logical[cpu] as usize;
                    let cpu_rec = &self.levels[Level::Cpu.index()][cl];
                    assert_eq!(
                        cpu_rec.parents[level.index()],
                        rec.logical_id as i32,
                        "cpu {cpu} disagrees about its {level} parent"
                    );
                }
            }
        }
    }

    pub fn ncpus(&self) -> usize {
        self.levels[Level::Cpu.index()].len()
    }

    /// Freezes the plan into the region and returns the offset of the
    /// [`TopologyShared`] index block.
    pub fn write_into(&self, region: &Region) -> Result<Off> {
        let shared_off = region.alloc(
            core::mem::size_of::<TopologyShared>(),
            core::mem::align_of::<TopologyShared>(),
        )?;
        let mut shared = TopologyShared {
            level_count: [0; LEVEL_COUNT],
            level_off: [0; LEVEL_COUNT],
            sys_map_off: 0,
        };
        for level in Level::ALL {
            let domains = &self.levels[level.index()];
            let off = region.alloc(
                core::mem::size_of::<DomainRecord>() * domains.len(),
                core::mem::align_of::<DomainRecord>(),
            )?;
            for (i, rec) in domains.iter().enumerate() {
                // Safety: freshly allocated, correctly aligned space inside
                // the region; only the initializer is running.
                unsafe {
                    region
                        .at_ptr::<DomainRecord>(
                            off + (i * core::mem::size_of::<DomainRecord>()) as u64,
                        )
                        .write(*rec);
                }
            }
            shared.level_count[level.index()] = domains.len() as u32;
            shared.level_off[level.index()] = off;
        }

        let map_off = region.alloc(
            core::mem::size_of::<i32>() * self.sys_to_logical.len(),
            core::mem::align_of::<i32>(),
        )?;
        for (i, v) in self.sys_to_logical.iter().enumerate() {
            unsafe {
                region
                    .at_ptr::<i32>(map_off + (i * 4) as u64)
                    .write(*v);
            }
        }
        shared.sys_map_off = map_off;

        // Safety: as above.
        unsafe { region.at_ptr::<TopologyShared>(shared_off).write(shared) };
        Ok(shared_off)
    }
}

/// Region-resident index of the frozen tree.
#[repr(C)]
pub struct TopologyShared {
    pub level_count: [u32; LEVEL_COUNT],
    pub level_off: [Off; LEVEL_COUNT],
    pub sys_map_off: Off,
}

/// Read access to a frozen tree.
#[derive(Copy, Clone)]
pub struct TopologyView<'r> {
    region: &'r Region,
    shared: &'r TopologyShared,
}

impl<'r> TopologyView<'r> {
    /// # Safety
    ///
    /// `off` must be the offset written by `TopologyPlan::write_into` on a
    /// READY region.
    pub unsafe fn from_region(region: &'r Region, off: Off) -> Self {
        Self {
            region,
            shared: region.at(off),
        }
    }

    pub fn domains(&self, level: Level) -> &'r [DomainRecord] {
        // Safety: written by `write_into`, immutable since.
        unsafe {
            self.region.slice(
                self.shared.level_off[level.index()],
                self.shared.level_count[level.index()] as usize,
            )
        }
    }

    pub fn domain(&self, level: Level, logical: u32) -> Option<&'r DomainRecord> {
        self.domains(level).get(logical as usize)
    }

    pub fn ncpus(&self) -> usize {
        self.shared.level_count[Level::Cpu.index()] as usize
    }

    /// The cpu-level domain for a logical CPU id.
    pub fn cpu(&self, logical: u32) -> &'r DomainRecord {
        &self.domains(Level::Cpu)[logical as usize]
    }

    pub fn logical_to_system(&self, logical: u32) -> u32 {
        self.cpu(logical).system_id
    }

    pub fn system_to_logical(&self, system: u32) -> Option<u32> {
        // Safety: written by `write_into`, immutable since.
        let map: &[i32] =
            unsafe { self.region.slice(self.shared.sys_map_off, CpuSet::CAPACITY) };
        match map.get(system as usize) {
            Some(&v) if v >= 0 => Some(v as u32),
            _ => None,
        }
    }

    /// Does the domain `(level, logical)` cover the logical CPU `cpu`?
    pub fn covers(&self, level: Level, logical: u32, cpu: u32) -> bool {
        self.cpu(cpu).parents[level.index()] == logical as i32
    }

    /// Locality closeness of two logical CPUs: 4 = same core, 3 = same
    /// complex set, 2 = same NUMA node, 1 = same node (always true), used
    /// as a dispatch tie-break.
    pub fn closeness(&self, a: u32, b: u32) -> u32 {
        if a == b {
            return 5;
        }
        let pa = &self.cpu(a).parents;
        let pb = &self.cpu(b).parents;
        for level in [Level::Core, Level::ComplexSet, Level::Numa, Level::Node] {
            if pa[level.index()] == pb[level.index()] {
                return match level {
                    Level::Core => 4,
                    Level::ComplexSet => 3,
                    Level::Numa => 2,
                    _ => 1,
                };
            }
        }
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two sockets of two cores with two threads each:
    /// core {0,4}, {1,5} on node 0; core {2,6}, {3,7} on node 1.
    fn smt_host() -> HostInfo {
        let mut siblings = vec![CpuSet::empty(); CpuSet::CAPACITY];
        for cpu in 0..8usize {
            let pair = [cpu % 4, cpu % 4 + 4];
            siblings[cpu] = pair.into_iter().collect();
        }
        HostInfo {
            online: CpuSet::first_n(8),
            affinity: CpuSet::first_n(8),
            siblings,
            numa_nodes: Some(vec![
                "0-1,4-5".parse().unwrap(),
                "2-3,6-7".parse().unwrap(),
            ]),
        }
    }

    fn build(host: &HostInfo, binding: &str, lists: TopologyLists) -> Result<TopologyPlan> {
        let valid = Binding::parse(binding)?.resolve(host)?;
        TopologyPlan::build(host, &valid, &lists)
    }

    #[test]
    fn interleaved_logical_ids_span_cores_first() {
        let plan = build(&smt_host(), "inherit", TopologyLists::default()).unwrap();
        assert_eq!(plan.ncpus(), 8);
        // Pass 0 numbers the first sibling of each core (0,1,2,3), pass 1
        // the second (4,5,6,7): system order happens to match here, but
        // the first four logical ids must hit four distinct cores.
        let cores_of_first_four: Vec<i32> = (0..4)
            .map(|l| plan.levels[Level::Cpu.index()][l].parents[Level::Core.index()])
            .collect();
        let mut unique = cores_of_first_four.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 4, "{cores_of_first_four:?}");
    }

    #[test]
    fn logical_system_round_trip() {
        let plan = build(&smt_host(), "inherit", TopologyLists::default()).unwrap();
        for rec in &plan.levels[Level::Cpu.index()] {
            assert_eq!(
                plan.sys_to_logical[rec.system_id as usize],
                rec.logical_id as i32
            );
        }
    }

    #[test]
    fn cores_binding_picks_one_thread_per_core() {
        let host = smt_host();
        let valid = Binding::parse("cores").unwrap().resolve(&host).unwrap();
        let v: Vec<usize> = valid.iter().collect();
        assert_eq!(v, [0, 1, 2, 3]);
        let plan = TopologyPlan::build(&host, &valid, &TopologyLists::default()).unwrap();
        assert_eq!(plan.levels[Level::Core.index()].len(), 4);
        assert_eq!(plan.ncpus(), 4);
    }

    #[test]
    fn single_cpu_binding() {
        let host = smt_host();
        let valid = Binding::parse("3").unwrap().resolve(&host).unwrap();
        let plan = TopologyPlan::build(&host, &valid, &TopologyLists::default()).unwrap();
        assert_eq!(plan.ncpus(), 1);
        assert_eq!(plan.levels[Level::Core.index()].len(), 1);
        assert_eq!(plan.levels[Level::Numa.index()].len(), 1);
        let cpu = &plan.levels[Level::Cpu.index()][0];
        assert_eq!(cpu.system_id, 3);
        assert_eq!(cpu.logical_id, 0);
    }

    #[test]
    fn numa_from_config_overrides_host() {
        let lists = TopologyLists {
            complex_sets: None,
            numa_nodes: Some(vec![
                "0,4".parse().unwrap(),
                "1-3,5-7".parse().unwrap(),
            ]),
        };
        let plan = build(&smt_host(), "inherit", lists).unwrap();
        let numa = &plan.levels[Level::Numa.index()];
        assert_eq!(numa.len(), 2);
        assert_eq!(numa[0].cpus_system, "0,4".parse().unwrap());
    }

    #[test]
    fn complex_sets_expand_to_whole_cores() {
        let lists = TopologyLists {
            // Entry names only cpu 0; its sibling 4 rides along.
            complex_sets: Some(vec!["0-1".parse().unwrap()]),
            numa_nodes: None,
        };
        let plan = build(&smt_host(), "inherit", lists).unwrap();
        let complexes = &plan.levels[Level::ComplexSet.index()];
        assert_eq!(complexes[0].cpus_system, "0-1,4-5".parse().unwrap());
        // The other two cores got singleton wrappers.
        assert_eq!(complexes.len(), 3);
    }

    #[test]
    fn complex_set_conflicts_are_fatal() {
        let overlapping = TopologyLists {
            complex_sets: Some(vec!["0-1".parse().unwrap(), "1-2".parse().unwrap()]),
            numa_nodes: None,
        };
        assert!(matches!(
            build(&smt_host(), "inherit", overlapping),
            Err(Error::Config(_))
        ));

        let no_valid = TopologyLists {
            complex_sets: Some(vec!["200-210".parse().unwrap()]),
            numa_nodes: None,
        };
        assert!(matches!(
            build(&smt_host(), "inherit", no_valid),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn numa_coverage_gaps_are_fatal() {
        let partial = TopologyLists {
            complex_sets: None,
            numa_nodes: Some(vec!["0,4".parse().unwrap()]),
        };
        assert!(matches!(
            build(&smt_host(), "inherit", partial),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn complex_set_split_across_numa_is_fatal() {
        // Cores {1,5} and {2,6} fused into one complex set, but the host
        // places them on different NUMA nodes.
        let lists = TopologyLists {
            complex_sets: Some(vec!["1-2".parse().unwrap()]),
            numa_nodes: None,
        };
        assert!(matches!(
            build(&smt_host(), "inherit", lists),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn missing_numa_info_yields_one_node() {
        let mut host = smt_host();
        host.numa_nodes = None;
        let plan = build(&host, "inherit", TopologyLists::default()).unwrap();
        assert_eq!(plan.levels[Level::Numa.index()].len(), 1);
        assert_eq!(
            plan.levels[Level::Numa.index()][0].cpus_system,
            CpuSet::first_n(8)
        );
    }

    #[test]
    fn parents_are_total_and_consistent() {
        let plan = build(&smt_host(), "inherit", TopologyLists::default()).unwrap();
        for level in Level::ALL {
            for rec in &plan.levels[level.index()] {
                for coarser in 0..level.index() {
                    assert!(rec.parents[coarser] >= 0);
                }
                // Cover subset of parent cover.
                if let Some(up) = level.coarser() {
                    let p = rec.parents[up.index()] as usize;
                    assert!(rec
                        .cpus_system
                        .is_subset(&plan.levels[up.index()][p].cpus_system));
                }
            }
        }
    }
}
