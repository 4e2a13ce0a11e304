//! Scheduler behavior: op-budget preemption, fiber state transitions and
//! the four re-entrancy modes.

mod common;

use std::sync::Arc;

use common::{body, runtime, runtime_with_budget};
use skein::{
    ClassDef, ClassId, Constant, ImageBuilder, MethodBody, MethodDecl, MethodId, NoopTracer, Op, RecordingTracer,
    Reentrancy, RetSlot, TypeId,
    composition::{MethodImpl, methods},
    op::{NativeOp, SlotVec},
};

fn spin_body(limit_pool: u32) -> Arc<MethodBody> {
    body(
        "spin",
        vec![
            Op::LoadConst { pool: 1, dst: RetSlot::Slot(0) },
            Op::LoadConst { pool: limit_pool, dst: RetSlot::Slot(1) },
            Op::Native(NativeOp::new("inc", |cx, st| {
                let current = match st.cur().get_argument(0) {
                    Ok(Some(handle)) => handle.as_int().unwrap_or(0),
                    _ => 0,
                };
                let next = cx.int_handle(current + 1);
                st.cur().assign_slot(0, next)
            })),
            Op::IsEq {
                left: 0,
                right: 1,
                types: (TypeId::new(0), TypeId::new(0)),
                dst: RetSlot::Slot(2),
            },
            Op::JumpIfFalse { cond: 2, target: 2 },
            Op::Return1 { src: 0 },
        ],
        3,
    )
}

fn bounce_body() -> Arc<MethodBody> {
    body(
        "bounce",
        vec![
            Op::LoadConst { pool: 0, dst: RetSlot::Slot(0) },
            Op::Yield,
            Op::Yield,
            Op::Yield,
            Op::Return1 { src: 0 },
        ],
        1,
    )
}

fn two_entry_image() -> skein::ModuleImage {
    ImageBuilder::new("sched")
        .constant(Constant::Int(9))
        .constant(Constant::Int(0))
        .constant(Constant::Int(1000))
        .entry("spin", spin_body(2))
        .entry("bounce", bounce_body())
        .build()
        .unwrap()
}

#[test]
fn op_budget_interleaves_fibers_under_open() {
    // A tight 1,000-iteration loop and a yielding sibling on one Open
    // service with a budget of 10 ops per slice: the loop is preempted
    // roughly every three iterations and the sibling runs in between.
    let rt = runtime_with_budget(two_entry_image(), 10);
    let svc = rt.create_service("svc", Reentrancy::Open).unwrap();
    let svc_id = svc.as_service().unwrap();

    let spin = rt.submit(&svc, "spin", vec![]).unwrap();
    let bounce = rt.submit(&svc, "bounce", vec![]).unwrap();

    let mut tracer = RecordingTracer::new();
    rt.run_until_idle(&mut tracer);

    assert_eq!(spin.try_get().unwrap().unwrap().as_int(), Some(1000));
    assert_eq!(bounce.try_get().unwrap().unwrap().as_int(), Some(9));

    let log = tracer.schedule_log(svc_id);
    let running: Vec<u64> = log
        .iter()
        .filter(|(_, status)| *status == "Running")
        .map(|(fiber, _)| *fiber)
        .collect();
    let spin_fiber = running[0];
    let spin_slices = running.iter().filter(|&&f| f == spin_fiber).count();
    assert!(
        (250..=400).contains(&spin_slices),
        "loop should be preempted ~300 times, got {spin_slices}"
    );

    // The sibling ran between two of the loop's slices.
    let interleaved = running
        .windows(3)
        .any(|w| w[0] == spin_fiber && w[1] != spin_fiber && w[2] == spin_fiber);
    assert!(interleaved, "yielding fiber never ran between loop slices: {running:?}");
}

#[test]
fn fiber_states_follow_the_machine() {
    let rt = runtime(two_entry_image());
    let svc = rt.create_service("svc", Reentrancy::Open).unwrap();
    let svc_id = svc.as_service().unwrap();

    let future = rt.submit(&svc, "bounce", vec![]).unwrap();
    let mut tracer = RecordingTracer::new();
    rt.run_until_idle(&mut tracer);
    assert_eq!(future.try_get().unwrap().unwrap().as_int(), Some(9));

    let log = tracer.schedule_log(svc_id);
    let statuses: Vec<&str> = log.iter().map(|(_, status)| *status).collect();
    assert_eq!(
        statuses,
        vec![
            "Running",
            "Yielded",
            "Running",
            "Yielded",
            "Running",
            "Yielded",
            "Running",
            "terminated"
        ]
    );
}

#[test]
fn prioritized_prefers_started_fibers_over_new_ones() {
    let rt = runtime(two_entry_image());
    let svc = rt.create_service("svc", Reentrancy::Prioritized).unwrap();
    let svc_id = svc.as_service().unwrap();

    let first = rt.submit(&svc, "bounce", vec![]).unwrap();
    let second = rt.submit(&svc, "bounce", vec![]).unwrap();

    let mut tracer = RecordingTracer::new();
    rt.run_until_idle(&mut tracer);
    assert!(first.try_get().unwrap().is_ok());
    assert!(second.try_get().unwrap().is_ok());

    let log = tracer.schedule_log(svc_id);
    let running: Vec<u64> = log
        .iter()
        .filter(|(_, status)| *status == "Running")
        .map(|(fiber, _)| *fiber)
        .collect();
    let first_fiber = running[0];
    let last_of_first = running.iter().rposition(|&f| f == first_fiber).unwrap();
    let first_of_second = running.iter().position(|&f| f != first_fiber).unwrap();
    assert!(
        last_of_first < first_of_second,
        "a started fiber must run to completion before a new one is admitted: {running:?}"
    );
}

#[test]
fn exclusive_rejects_initial_fibers_until_pinned_otherwise() {
    let rt = runtime(two_entry_image());
    let svc = rt.create_service("svc", Reentrancy::Exclusive).unwrap();
    let svc_id = svc.as_service().unwrap();

    let future = rt.submit(&svc, "bounce", vec![]).unwrap();
    rt.run_until_idle(&mut NoopTracer);
    // The pinned semantics: message-born fibers are not eligible under
    // Exclusive, so the call never starts.
    assert!(future.try_get().is_none(), "Initial fiber must not start under Exclusive");

    // Tests may flip the documented switch to pin the other choice.
    rt.container()
        .service(svc_id)
        .unwrap()
        .borrow_mut()
        .flags
        .exclusive_admits_initial = true;
    rt.run_until_idle(&mut NoopTracer);
    assert_eq!(future.try_get().unwrap().unwrap().as_int(), Some(9));
}

fn worker_class_image() -> skein::ModuleImage {
    let ctor = Arc::new(MethodBody::new("Worker.construct", vec![Op::Return0], 1, 1, 0));
    let slow = Arc::new(MethodBody::new(
        "Worker.slow",
        vec![
            Op::LoadConst { pool: 0, dst: RetSlot::Slot(1) },
            Op::Yield,
            Op::Return1 { src: 1 },
        ],
        2,
        1,
        1,
    ));
    let relay = body(
        "relay",
        vec![
            Op::CallMethod {
                target: 0,
                method: MethodId::new(16),
                args: SlotVec::new(),
                ret: RetSlot::Slot(1),
            },
            Op::Return1 { src: 1 },
        ],
        2,
    );
    let quick = body(
        "quick",
        vec![Op::LoadConst { pool: 1, dst: RetSlot::Slot(0) }, Op::Return1 { src: 0 }],
        1,
    );
    ImageBuilder::new("workers")
        .constant(Constant::Int(42))
        .constant(Constant::Int(5))
        .class(ClassDef {
            id: ClassId::new(10),
            name: "Worker".to_owned(),
            superclass: None,
            type_of: TypeId::new(10),
            properties: Vec::new(),
            methods: vec![
                MethodDecl {
                    id: methods::CONSTRUCT,
                    imp: MethodImpl::Body(ctor),
                },
                MethodDecl {
                    id: MethodId::new(16),
                    imp: MethodImpl::Body(slow),
                },
            ],
            default_ctor: None,
            auto_init: None,
            singleton: false,
            immutable: false,
        })
        .entry("relay", relay)
        .entry("quick", quick)
        .build()
        .unwrap()
}

#[test]
fn forbidden_pins_the_waiting_fiber_and_queues_newcomers() {
    let rt = runtime(worker_class_image());
    let (worker, ctor_future) = rt
        .create_service_of("worker", ClassId::new(10), methods::CONSTRUCT, vec![], Reentrancy::Open)
        .unwrap();
    let gate = rt.create_service("gate", Reentrancy::Forbidden).unwrap();
    let gate_id = gate.as_service().unwrap();

    let relay = rt.submit(&gate, "relay", vec![worker.clone()]).unwrap();
    let quick = rt.submit(&gate, "quick", vec![]).unwrap();

    let mut tracer = RecordingTracer::new();
    rt.run_until_idle(&mut tracer);

    assert!(ctor_future.try_get().unwrap().is_ok());
    assert_eq!(relay.try_get().unwrap().unwrap().as_int(), Some(42));
    assert_eq!(quick.try_get().unwrap().unwrap().as_int(), Some(5));

    // The queued fiber only started after the pinned one terminated.
    let log = tracer.schedule_log(gate_id);
    let running: Vec<u64> = log
        .iter()
        .filter(|(_, status)| *status == "Running")
        .map(|(fiber, _)| *fiber)
        .collect();
    let relay_fiber = running[0];
    let last_relay = running.iter().rposition(|&f| f == relay_fiber).unwrap();
    let first_quick = running.iter().position(|&f| f != relay_fiber).unwrap();
    assert!(
        last_relay < first_quick,
        "Forbidden must not start a new fiber while one is pinned: {running:?}"
    );

    // Runtime metrics accumulated and the queues drained.
    let context = rt.container().service(gate_id).unwrap();
    assert!(!context.borrow().is_contended());
}
