// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end scenarios: live workers, real pinning, one process.
//!
//! Every test runs against its own region (unique name, private scope
//! derived from the test tag), sized to the machine it runs on: bindings
//! are built from the process's affinity mask so the suite passes on a
//! one-CPU container as well as a big box. Bodies never assert — they
//! record, and the test asserts from outside — so a failure cannot strand
//! a worker mid-panic.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use corral::topology::HostInfo;
use corral::{Affinity, AffinityPolicy, Config, GovernorPolicy, Level, Runtime, Status, TaskHandle};

fn config(tag: &str, cpus: usize) -> Config {
    let mut c = Config::default();
    c.shared_memory.name = format!("corral-it-{}-{tag}", std::process::id());
    c.shared_memory.isolation_level = corral::IsolationLevel::Process;
    let host = HostInfo::probe().unwrap();
    let picked: Vec<String> = host
        .affinity
        .iter()
        .take(cpus.max(1))
        .map(|c| c.to_string())
        .collect();
    c.topology.binding = picked.join(",");
    c
}

fn wait_done(rt: &Runtime, handle: &TaskHandle, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !rt.is_completed(handle) {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn eight_tasks_all_complete() {
    let rt = Runtime::attach(&config("fanout", 4)).unwrap();
    let ran = Arc::new(AtomicU32::new(0));
    let ran2 = Arc::clone(&ran);
    let ty = rt
        .register_type("fanout", move |_ctx| {
            ran2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    let tasks: Vec<TaskHandle> = (0..8)
        .map(|_| rt.create_task(&ty, 1).unwrap())
        .collect();
    for t in &tasks {
        rt.submit(t).unwrap();
    }
    for (i, t) in tasks.iter().enumerate() {
        wait_done(&rt, t, &format!("task {i}"));
        rt.destroy_task(*t).unwrap();
    }
    assert_eq!(ran.load(Ordering::SeqCst), 8);
    rt.detach().unwrap();
}

#[test]
fn parallel_degree_three_gets_distinct_execution_ids() {
    let rt = Runtime::attach(&config("parallel", 4)).unwrap();
    let ids = Arc::new(StdMutex::new(Vec::new()));
    let ids2 = Arc::clone(&ids);
    let ty = rt
        .register_type("parallel", move |ctx| {
            ids2.lock().unwrap().push(ctx.execution_id());
        })
        .unwrap();

    let t = rt.create_task(&ty, 3).unwrap();
    rt.submit(&t).unwrap();
    wait_done(&rt, &t, "parallel task");
    rt.destroy_task(t).unwrap();

    let mut got = ids.lock().unwrap().clone();
    got.sort();
    assert_eq!(got, [1, 2, 3]);
    rt.detach().unwrap();
}

#[test]
fn pause_then_submit_unblocked_resumes_exactly_once() {
    let rt = Runtime::attach(&config("pause", 2)).unwrap();
    let resumed = Arc::new(AtomicU32::new(0));
    let resumed2 = Arc::clone(&resumed);
    let ty = rt
        .register_type("pauser", move |ctx| {
            if ctx.pause().is_ok() {
                resumed2.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

    let t = rt.create_task(&ty, 1).unwrap();
    rt.submit(&t).unwrap();

    // The blocking count is raised before the task parks; once we see it
    // we owe exactly one unblock.
    let deadline = Instant::now() + Duration::from_secs(10);
    while !rt.is_blocked(&t) {
        assert!(Instant::now() < deadline, "task never blocked");
        std::thread::sleep(Duration::from_millis(1));
    }
    rt.submit_unblocked(&t).unwrap();

    wait_done(&rt, &t, "paused task");
    assert_eq!(resumed.load(Ordering::SeqCst), 1);
    rt.destroy_task(t).unwrap();
    rt.detach().unwrap();
}

#[test]
fn yield_returns_to_the_task() {
    let rt = Runtime::attach(&config("yield", 1)).unwrap();
    let phases = Arc::new(AtomicU32::new(0));
    let phases2 = Arc::clone(&phases);
    let ty = rt
        .register_type("yielder", move |ctx| {
            phases2.fetch_add(1, Ordering::SeqCst);
            if ctx.yield_now().is_ok() {
                phases2.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

    let t = rt.create_task(&ty, 1).unwrap();
    rt.submit(&t).unwrap();
    wait_done(&rt, &t, "yielding task");
    assert_eq!(phases.load(Ordering::SeqCst), 2);
    rt.destroy_task(t).unwrap();
    rt.detach().unwrap();
}

#[test]
fn contended_mutex_is_exclusive_and_everyone_gets_in() {
    let rt = Runtime::attach(&config("mutex", 2)).unwrap();
    let m = Arc::new(rt.mutex().unwrap());
    let entries = Arc::new(AtomicU32::new(0));
    let violations = Arc::new(AtomicU32::new(0));
    let in_crit = Arc::new(AtomicBool::new(false));

    let (m2, e2, v2, c2) = (
        Arc::clone(&m),
        Arc::clone(&entries),
        Arc::clone(&violations),
        Arc::clone(&in_crit),
    );
    let ty = rt
        .register_type("locker", move |_ctx| {
            if m2.lock().is_err() {
                v2.fetch_add(1, Ordering::SeqCst);
                return;
            }
            if c2.swap(true, Ordering::SeqCst) {
                v2.fetch_add(1, Ordering::SeqCst);
            }
            // Stay in the critical section long enough for contenders to
            // pile onto the wait list.
            let until = Instant::now() + Duration::from_micros(500);
            while Instant::now() < until {
                std::hint::spin_loop();
            }
            c2.store(false, Ordering::SeqCst);
            e2.fetch_add(1, Ordering::SeqCst);
            if m2.unlock().is_err() {
                v2.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

    let tasks: Vec<TaskHandle> = (0..4)
        .map(|_| rt.create_task(&ty, 1).unwrap())
        .collect();
    for t in &tasks {
        rt.submit(t).unwrap();
    }
    for t in &tasks {
        wait_done(&rt, t, "mutex task");
        rt.destroy_task(*t).unwrap();
    }
    assert_eq!(entries.load(Ordering::SeqCst), 4);
    assert_eq!(violations.load(Ordering::SeqCst), 0);
    assert!(!m.is_taken());
    rt.detach().unwrap();
}

#[test]
fn parked_worker_is_woken_by_submission() {
    // Hybrid with a small spin budget on one CPU: after the first task
    // the worker runs out of spins and parks on its futex; the second
    // submission must wake it through wake-one.
    let mut cfg = config("governor", 1);
    cfg.governor.policy = GovernorPolicy::Hybrid;
    cfg.governor.spins = 50;
    let rt = Runtime::attach(&cfg).unwrap();
    let ran = Arc::new(AtomicU32::new(0));
    let ran2 = Arc::clone(&ran);
    let ty = rt
        .register_type("sleepy", move |_ctx| {
            ran2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    let a = rt.create_task(&ty, 1).unwrap();
    rt.submit(&a).unwrap();
    wait_done(&rt, &a, "first task");

    // Give the worker ample time to burn its spins and park.
    std::thread::sleep(Duration::from_millis(100));

    let b = rt.create_task(&ty, 1).unwrap();
    rt.submit(&b).unwrap();
    wait_done(&rt, &b, "task after park");
    assert_eq!(ran.load(Ordering::SeqCst), 2);
    rt.destroy_task(a).unwrap();
    rt.destroy_task(b).unwrap();
    rt.detach().unwrap();
}

#[test]
fn immediate_successor_runs_on_the_same_worker() {
    let rt = Runtime::attach(&config("successor", 2)).unwrap();
    let threads = Arc::new(StdMutex::new(Vec::new()));

    let t2 = Arc::clone(&threads);
    let succ_ty = rt
        .register_type("successor", move |_ctx| {
            t2.lock()
                .unwrap()
                .push(format!("{:?}", std::thread::current().id()));
        })
        .unwrap();
    let b = rt.create_task(&succ_ty, 1).unwrap();
    // The node domain covers every CPU, so the successor is affine to
    // whichever CPU the parent lands on.
    rt.set_affinity(
        &b,
        Some(Affinity {
            level: Level::Node,
            domain: 0,
            policy: AffinityPolicy::Preferred,
        }),
    )
    .unwrap();

    let t3 = Arc::clone(&threads);
    let parent_ty = rt
        .register_type("parent", move |ctx| {
            t3.lock()
                .unwrap()
                .push(format!("{:?}", std::thread::current().id()));
            let _ = ctx.submit(&b);
        })
        .unwrap();

    let a = rt.create_task(&parent_ty, 1).unwrap();
    rt.submit(&a).unwrap();
    wait_done(&rt, &a, "parent");
    wait_done(&rt, &b, "successor");

    let got = threads.lock().unwrap().clone();
    assert_eq!(got.len(), 2);
    assert_eq!(got[0], got[1], "successor should reuse the parent's CPU");
    rt.destroy_task(a).unwrap();
    rt.destroy_task(b).unwrap();
    rt.detach().unwrap();
}

#[test]
fn in_task_wait_blocks_until_target_completes() {
    let rt = Runtime::attach(&config("wait", 2)).unwrap();
    let order = Arc::new(StdMutex::new(Vec::new()));

    let o2 = Arc::clone(&order);
    let slow_ty = rt
        .register_type("slow", move |_ctx| {
            std::thread::sleep(Duration::from_millis(20));
            o2.lock().unwrap().push("slow-done");
        })
        .unwrap();
    let slow = rt.create_task(&slow_ty, 1).unwrap();

    let o3 = Arc::clone(&order);
    let waiter_ty = rt
        .register_type("waiter", move |ctx| {
            if ctx.wait_for(&slow).is_ok() {
                o3.lock().unwrap().push("waiter-done");
            }
        })
        .unwrap();
    let waiter = rt.create_task(&waiter_ty, 1).unwrap();

    rt.submit(&slow).unwrap();
    rt.submit(&waiter).unwrap();
    wait_done(&rt, &waiter, "waiter");
    assert_eq!(*order.lock().unwrap(), ["slow-done", "waiter-done"]);
    rt.destroy_task(slow).unwrap();
    rt.destroy_task(waiter).unwrap();
    rt.detach().unwrap();
}

#[test]
fn single_cpu_instance_runs_tasks() {
    let rt = Runtime::attach(&config("onecpu", 1)).unwrap();
    assert_eq!(rt.cpu_count(), 1);
    assert_eq!(rt.domain_count(Level::Node), 1);
    assert_eq!(rt.domain_count(Level::Core), 1);

    let ran = Arc::new(AtomicU32::new(0));
    let ran2 = Arc::clone(&ran);
    let ty = rt
        .register_type("solo", move |_ctx| {
            ran2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    let tasks: Vec<TaskHandle> = (0..3)
        .map(|_| rt.create_task(&ty, 1).unwrap())
        .collect();
    for t in &tasks {
        rt.submit(t).unwrap();
    }
    for t in &tasks {
        wait_done(&rt, t, "solo task");
        rt.destroy_task(*t).unwrap();
    }
    assert_eq!(ran.load(Ordering::SeqCst), 3);
    rt.detach().unwrap();
}

#[test]
fn topology_queries_and_outside_task_errors() {
    let rt = Runtime::attach(&config("queries", 2)).unwrap();
    assert_eq!(rt.domain_count(Level::Node), 1);
    assert!(rt.domain_count(Level::Cpu) >= 1);
    assert_eq!(
        rt.domain_system_ids(Level::Cpu).len(),
        rt.domain_count(Level::Cpu)
    );

    // No task context on this thread.
    assert_eq!(
        rt.current_domain_id(Level::Numa).unwrap_err().status(),
        Status::OutsideTask
    );
    let m = rt.mutex().unwrap();
    assert_eq!(m.lock().unwrap_err().status(), Status::OutsideTask);

    // Inside a body the queries work.
    let saw = Arc::new(AtomicBool::new(false));
    let saw2 = Arc::clone(&saw);
    let rt_probe = Arc::new(StdMutex::new(None::<u32>));
    let probe2 = Arc::clone(&rt_probe);
    let ty = rt
        .register_type("prober", move |ctx| {
            saw2.store(!ctx.metadata().is_empty(), Ordering::SeqCst);
            *probe2.lock().unwrap() = Some(ctx.execution_id());
        })
        .unwrap();
    let t = rt
        .create_task_with_metadata(&ty, 1, b"probe-metadata")
        .unwrap();
    rt.submit(&t).unwrap();
    wait_done(&rt, &t, "prober");
    assert!(saw.load(Ordering::SeqCst));
    assert_eq!(*rt_probe.lock().unwrap(), Some(1));
    rt.destroy_task(t).unwrap();
    rt.detach().unwrap();
}

#[test]
fn api_error_codes() {
    let rt = Runtime::attach(&config("errors", 1)).unwrap();

    // Bodyless types cannot be submitted.
    let marker = rt.register_bodyless_type("marker").unwrap();
    let t = rt.create_task(&marker, 1).unwrap();
    assert_eq!(
        rt.submit(&t).unwrap_err().status(),
        Status::InvalidCallback
    );
    rt.destroy_task(t).unwrap();

    // Degree zero and oversized metadata are rejected at create.
    let ty = rt.register_type("real", |_ctx| {}).unwrap();
    assert_eq!(
        rt.create_task(&ty, 0).unwrap_err().status(),
        Status::InvalidParameter
    );
    let big = vec![0u8; abi::TASK_METADATA_MAX + 1];
    assert_eq!(
        rt.create_task_with_metadata(&ty, 1, &big)
            .unwrap_err()
            .status(),
        Status::InvalidMetadataSize
    );

    // Double submission is an invalid operation.
    let t = rt.create_task(&ty, 1).unwrap();
    rt.submit(&t).unwrap();
    assert_eq!(
        rt.submit(&t).unwrap_err().status(),
        Status::InvalidOperation
    );
    wait_done(&rt, &t, "error-path task");
    rt.destroy_task(t).unwrap();

    // Unknown affinity domain is an invalid parameter.
    let t = rt.create_task(&ty, 1).unwrap();
    assert_eq!(
        rt.set_affinity(
            &t,
            Some(Affinity {
                level: Level::Numa,
                domain: 999,
                policy: AffinityPolicy::Strict,
            })
        )
        .unwrap_err()
        .status(),
        Status::InvalidParameter
    );
    rt.destroy_task(t).unwrap();
    rt.detach().unwrap();
}

#[test]
fn external_wait_blocks_until_completion() {
    let rt = Runtime::attach(&config("extwait", 1)).unwrap();
    let ty = rt
        .register_type("napper", |_ctx| {
            std::thread::sleep(Duration::from_millis(10));
        })
        .unwrap();
    let t = rt.create_task(&ty, 1).unwrap();
    rt.submit(&t).unwrap();
    rt.wait(&t).unwrap();
    assert!(rt.is_completed(&t));
    rt.destroy_task(t).unwrap();
    rt.detach().unwrap();
}
