//! Cross-service messaging: response routing, failure propagation,
//! deadlines, fire-and-forget and multi-return futures.

mod common;

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    sync::Arc,
    time::{Duration, Instant},
};

use common::{body, drive, image_of, runtime};
use skein::{
    ClassDef, ClassId, Constant, ExcKind, ImageBuilder, MethodBody, MethodDecl, MethodId, NoopTracer, Op, OpResult,
    Reentrancy, RetSlot, ServiceStatus, TypeId,
    composition::{MethodImpl, methods},
    op::{NativeOp, SlotVec},
    value::Payload,
};

fn relay_body(method: u32) -> Arc<MethodBody> {
    body(
        "relay",
        vec![
            Op::CallMethod {
                target: 0,
                method: MethodId::new(method),
                args: SlotVec::new(),
                ret: RetSlot::Slot(1),
            },
            Op::Return1 { src: 1 },
        ],
        2,
    )
}

fn worker_class(methods_decl: Vec<MethodDecl>) -> ClassDef {
    ClassDef {
        id: ClassId::new(10),
        name: "Worker".to_owned(),
        superclass: None,
        type_of: TypeId::new(10),
        properties: Vec::new(),
        methods: methods_decl,
        default_ctor: None,
        auto_init: None,
        singleton: false,
        immutable: false,
    }
}

fn ctor_decl() -> MethodDecl {
    MethodDecl {
        id: methods::CONSTRUCT,
        imp: MethodImpl::Body(Arc::new(MethodBody::new("Worker.construct", vec![Op::Return0], 1, 1, 0))),
    }
}

#[test]
fn failing_remote_call_completes_the_future_exceptionally() {
    // S1 invokes a method on S2 that raises Bounds: S1's awaiting future
    // completes exceptionally, the resume site re-raises, and S2 stays
    // alive with an empty queue.
    let boom = Arc::new(MethodBody::new(
        "Worker.boom",
        vec![Op::Native(NativeOp::new("boom", |_, st| {
            st.cur().raise_msg(ExcKind::Bounds, "index 4 out of range")
        }))],
        1,
        1,
        1,
    ));
    let image = ImageBuilder::new("msg")
        .class(worker_class(vec![
            ctor_decl(),
            MethodDecl {
                id: MethodId::new(16),
                imp: MethodImpl::Body(boom),
            },
        ]))
        .entry("relay", relay_body(16))
        .build()
        .unwrap();

    let rt = runtime(image);
    let (worker, _ctor) = rt
        .create_service_of("worker", ClassId::new(10), methods::CONSTRUCT, vec![], Reentrancy::Open)
        .unwrap();
    let caller = rt.create_service("caller", Reentrancy::Open).unwrap();

    let future = rt.submit(&caller, "relay", vec![worker.clone()]).unwrap();
    let exc = drive(&rt, &future).unwrap_err();
    assert_eq!(exc.kind, ExcKind::Bounds);

    let worker_ctx = rt.container().service(worker.as_service().unwrap()).unwrap();
    assert_eq!(worker_ctx.borrow().status(), ServiceStatus::Idle);
    assert!(!worker_ctx.borrow().is_contended());
}

#[test]
fn deadline_raises_timeout_and_drops_the_late_response() {
    // The remote side spins (cooperatively) behind a gate; the caller's
    // 30 ms deadline fires first. When the gate opens, the late response
    // finds the caller-side future already failed and is dropped.
    let gate = Rc::new(Cell::new(false));
    let gate_in_op = Rc::clone(&gate);
    let stall = Arc::new(MethodBody::new(
        "Worker.stall",
        vec![
            Op::Native(NativeOp::new("gate", move |_, _| {
                if gate_in_op.get() {
                    OpResult::Jump(2)
                } else {
                    OpResult::Yield
                }
            })),
            Op::Jump(0),
            Op::LoadConst { pool: 0, dst: RetSlot::Slot(1) },
            Op::Return1 { src: 1 },
        ],
        2,
        1,
        1,
    ));
    let image = ImageBuilder::new("msg")
        .constant(Constant::Int(42))
        .class(worker_class(vec![
            ctor_decl(),
            MethodDecl {
                id: MethodId::new(17),
                imp: MethodImpl::Body(stall),
            },
        ]))
        .entry("relay", relay_body(17))
        .build()
        .unwrap();

    let rt = runtime(image);
    let (worker, _ctor) = rt
        .create_service_of("worker", ClassId::new(10), methods::CONSTRUCT, vec![], Reentrancy::Open)
        .unwrap();
    let caller = rt.create_service("caller", Reentrancy::Open).unwrap();
    rt.set_timeout(&caller, Some(Duration::from_millis(30))).unwrap();

    let future = rt.submit(&caller, "relay", vec![worker.clone()]).unwrap();
    let started = Instant::now();
    while !future.is_done() {
        assert!(started.elapsed() < Duration::from_secs(5), "deadline never fired");
        rt.tick(&mut NoopTracer);
    }
    let exc = future.try_get().unwrap().unwrap_err();
    assert_eq!(exc.kind, ExcKind::Timeout);

    // Open the gate: the remote completes, responds, and the response is
    // dropped on the caller's side.
    gate.set(true);
    rt.run_until_idle(&mut NoopTracer);
    assert_eq!(future.try_get().unwrap().unwrap_err().kind, ExcKind::Timeout);
    let worker_ctx = rt.container().service(worker.as_service().unwrap()).unwrap();
    assert!(!worker_ctx.borrow().is_contended());
}

#[test]
fn fire_and_forget_failures_reach_the_unhandled_hook() {
    let entry = body(
        "kaboom",
        vec![Op::Native(NativeOp::new("boom", |_, st| {
            st.cur().raise_msg(ExcKind::ConcurrentModification, "mutated during iteration")
        }))],
        1,
    );
    let rt = runtime(image_of(vec![("kaboom", entry)]));
    let svc = rt.create_service("svc", Reentrancy::Open).unwrap();
    let svc_id = svc.as_service().unwrap();

    let seen: Rc<RefCell<Vec<(u32, ExcKind)>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    rt.container().set_unhandled_hook(Box::new(move |service, exc| {
        sink.borrow_mut().push((service.raw(), exc.kind));
    }));

    rt.call_later(&svc, "kaboom", vec![]).unwrap();
    rt.run_until_idle(&mut NoopTracer);

    assert_eq!(*seen.borrow(), vec![(svc_id.raw(), ExcKind::ConcurrentModification)]);
}

#[test]
fn multi_return_future_completes_with_a_tuple() {
    let pair = Arc::new(MethodBody::new(
        "pair",
        vec![
            Op::LoadConst { pool: 0, dst: RetSlot::Slot(0) },
            Op::LoadConst { pool: 1, dst: RetSlot::Slot(1) },
            Op::ReturnN { srcs: SlotVec::from_iter([0, 1]) },
        ],
        2,
        0,
        2,
    ));
    let image = ImageBuilder::new("msg")
        .constant(Constant::Int(3))
        .constant(Constant::Str("three".into()))
        .entry("pair", pair)
        .build()
        .unwrap();
    let rt = runtime(image);
    let svc = rt.create_service("svc", Reentrancy::Open).unwrap();

    let future = rt.submit_multi(&svc, "pair", vec![], 2).unwrap();
    let result = drive(&rt, &future).unwrap();
    let Payload::Tuple(values) = result.payload() else {
        panic!("expected tuple, got {result:?}");
    };
    assert_eq!(values[0].as_int(), Some(3));
    assert_eq!(values[1].as_str(), Some("three"));
}

#[test]
fn shutdown_refuses_new_messages_and_terminates() {
    let entry = body(
        "noop",
        vec![
            Op::Native(NativeOp::new("one", |cx, st| {
                let value = cx.int_handle(1);
                st.cur().assign_slot(0, value)
            })),
            Op::Return1 { src: 0 },
        ],
        1,
    );
    let rt = runtime(image_of(vec![("noop", entry)]));
    let svc = rt.create_service("svc", Reentrancy::Open).unwrap();

    let accepted = rt.submit(&svc, "noop", vec![]).unwrap();
    rt.shutdown(&mut NoopTracer);
    assert!(accepted.try_get().unwrap().is_ok(), "queued work drains during shutdown");

    let refused = rt.submit(&svc, "noop", vec![]);
    assert!(refused.is_err(), "new messages are refused after shutdown");
    assert!(rt.container().is_terminated());
}
