//! Interpreter-level behavior: the conditional-return adapter, deferred
//! argument resolution, guard matching and scoped finalizers.

mod common;

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    sync::Arc,
};

use common::{body, drive, image_of, runtime};
use skein::{
    Constant, ExcKind, ImageBuilder, Op, RetSlot,
    composition::MethodImpl,
    container::builtin,
    frame::{Frame, GuardDef, GuardMatcher},
    op::{NativeOp, SlotVec},
    value::{Deferred, FnHandle, ObjHandle, Payload, Value},
};

fn slots(indices: impl IntoIterator<Item = u16>) -> SlotVec {
    SlotVec::from_iter(indices)
}

fn fn_value(target: &Arc<skein::MethodBody>) -> ObjHandle {
    ObjHandle::new(
        builtin::FN,
        Payload::Fn(FnHandle::new(MethodImpl::Body(Arc::clone(target)))),
    )
}

#[test]
fn conditional_receiver_gets_true_and_value() {
    // A function returning a single string, called into a two-slot
    // conditional receiver: slot 0 becomes `true`, slot 1 the string.
    let callee = body(
        "callee",
        vec![
            Op::Native(NativeOp::new("mk-str", |cx, st| {
                let value = cx.str_handle("payload");
                st.cur().assign_slot(0, value)
            })),
            Op::Return1 { src: 0 },
        ],
        1,
    );
    let callee_ref = Arc::clone(&callee);
    let caller = body(
        "caller",
        vec![
            Op::Native(NativeOp::new("mk-fn", move |_, st| {
                let f = fn_value(&callee_ref);
                st.cur().assign_slot(2, f)
            })),
            Op::CallFn {
                callee: 2,
                args: slots([]),
                ret: RetSlot::Cond(slots([0, 1])),
            },
            Op::ReturnN { srcs: slots([0, 1]) },
        ],
        3,
    );

    let rt = runtime(image_of(vec![("caller", caller)]));
    let svc = rt.create_service("svc", skein::Reentrancy::Open).unwrap();
    let future = rt.submit_multi(&svc, "caller", vec![], 2).unwrap();
    let result = drive(&rt, &future).unwrap();

    let Payload::Tuple(values) = result.payload() else {
        panic!("expected tuple, got {result:?}");
    };
    assert_eq!(values[0].as_bool(), Some(true));
    assert_eq!(values[1].as_str(), Some("payload"));
}

#[test]
fn conditional_receiver_untouched_when_callee_raises() {
    // If the callee raises, the exception propagates and neither receiver
    // slot is modified.
    let callee = body(
        "callee",
        vec![Op::Native(NativeOp::new("boom", |_, st| {
            st.cur().raise_msg(ExcKind::Bounds, "index 4 out of range")
        }))],
        1,
    );
    let callee_ref = Arc::clone(&callee);
    let caller = body(
        "caller",
        vec![
            Op::LoadConst { pool: 0, dst: RetSlot::Slot(0) },
            Op::LoadConst { pool: 1, dst: RetSlot::Slot(1) },
            Op::Native(NativeOp::new("mk-fn", move |_, st| {
                let f = fn_value(&callee_ref);
                st.cur().assign_slot(2, f)
            })),
            Op::GuardStart(Arc::new(GuardDef {
                matcher: GuardMatcher::Kind(ExcKind::Bounds),
                handler_pc: 6,
                capture: None,
            })),
            Op::CallFn {
                callee: 2,
                args: slots([]),
                ret: RetSlot::Cond(slots([0, 1])),
            },
            Op::GuardEnd,
            Op::ReturnN { srcs: slots([0, 1]) },
        ],
        3,
    );

    let image = ImageBuilder::new("test")
        .constant(Constant::Int(7))
        .constant(Constant::Int(8))
        .entry("caller", caller)
        .build()
        .unwrap();
    let rt = runtime(image);
    let svc = rt.create_service("svc", skein::Reentrancy::Open).unwrap();
    let future = rt.submit_multi(&svc, "caller", vec![], 2).unwrap();
    let result = drive(&rt, &future).unwrap();

    let Payload::Tuple(values) = result.payload() else {
        panic!("expected tuple, got {result:?}");
    };
    assert_eq!(values[0].as_int(), Some(7), "slot 0 must keep its sentinel");
    assert_eq!(values[1].as_int(), Some(8), "slot 1 must keep its sentinel");
}

#[test]
fn deferred_argument_resolves_before_the_call() {
    // A slot holding a deferred placeholder is resolved in place before
    // the callee observes it.
    let echo = body("echo", vec![Op::Return1 { src: 0 }], 1);
    let echo_ref = Arc::clone(&echo);
    let caller = body(
        "caller",
        vec![
            Op::Native(NativeOp::new("plant-deferred", |_, st| {
                let resolver = Frame::synthetic(
                    "resolver",
                    Arc::from(vec![Op::Native(NativeOp::new("resolve", |cx, st| {
                        let value = cx.str_handle("resolved");
                        st.return_value(value, false)
                    }))]),
                    0,
                    RetSlot::Stack,
                );
                st.cur().slots[1] = Some(Value::Deferred(Deferred::new(resolver)));
                skein::OpResult::Next
            })),
            Op::Native(NativeOp::new("mk-fn", move |_, st| {
                let f = fn_value(&echo_ref);
                st.cur().assign_slot(2, f)
            })),
            Op::CallFn {
                callee: 2,
                args: slots([1]),
                ret: RetSlot::Slot(0),
            },
            Op::Return1 { src: 0 },
        ],
        3,
    );

    let rt = runtime(image_of(vec![("caller", caller)]));
    let svc = rt.create_service("svc", skein::Reentrancy::Open).unwrap();
    let future = rt.submit(&svc, "caller", vec![]).unwrap();
    let result = drive(&rt, &future).unwrap();
    assert_eq!(result.as_str(), Some("resolved"));
}

#[test]
fn guard_captures_the_exception() {
    let entry = body(
        "entry",
        vec![
            Op::GuardStart(Arc::new(GuardDef {
                matcher: GuardMatcher::Kind(ExcKind::Bounds),
                handler_pc: 3,
                capture: Some(0),
            })),
            Op::Native(NativeOp::new("boom", |_, st| {
                st.cur().raise_msg(ExcKind::Bounds, "index 9")
            })),
            Op::GuardEnd,
            Op::Return1 { src: 0 },
        ],
        1,
    );

    let rt = runtime(image_of(vec![("entry", entry)]));
    let svc = rt.create_service("svc", skein::Reentrancy::Open).unwrap();
    let future = rt.submit(&svc, "entry", vec![]).unwrap();
    let result = drive(&rt, &future).unwrap();
    let Payload::Exception(exc) = result.payload() else {
        panic!("expected captured exception, got {result:?}");
    };
    assert_eq!(exc.kind, ExcKind::Bounds);
}

#[test]
fn fault_born_exceptions_pass_every_guard() {
    let entry = body(
        "entry",
        vec![
            Op::GuardStart(Arc::new(GuardDef {
                matcher: GuardMatcher::Any,
                handler_pc: 3,
                capture: None,
            })),
            Op::Native(NativeOp::new("fault", |_, st| {
                st.cur()
                    .raise(skein::VmException::fault(ExcKind::CircularInitialization, "singleton #1"))
            })),
            Op::GuardEnd,
            Op::Return0,
        ],
        1,
    );

    let rt = runtime(image_of(vec![("entry", entry)]));
    let svc = rt.create_service("svc", skein::Reentrancy::Open).unwrap();
    let future = rt.submit(&svc, "entry", vec![]).unwrap();
    let result = drive(&rt, &future);
    let exc = result.unwrap_err();
    assert_eq!(exc.kind, ExcKind::CircularInitialization);
}

#[test]
fn scoped_finalizers_run_in_reverse_on_both_paths() {
    let log: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

    let close_body = |tag: &'static str, log: &Rc<RefCell<Vec<&'static str>>>| {
        let log = Rc::clone(log);
        body(
            tag,
            vec![
                Op::Native(NativeOp::new("record", move |_, _| {
                    log.borrow_mut().push(tag);
                    skein::OpResult::Next
                })),
                Op::Return0,
            ],
            1,
        )
    };

    let first = close_body("close-first", &log);
    let second = close_body("close-second", &log);
    let register = move |st: &mut skein::frame::FrameStack<'_>, target: &Arc<skein::MethodBody>| {
        st.cur()
            .defer_cleanup(FnHandle::new(MethodImpl::Body(Arc::clone(target))));
        skein::OpResult::Next
    };

    // Success path.
    let (f1, f2) = (Arc::clone(&first), Arc::clone(&second));
    let ok_entry = body(
        "ok",
        vec![
            Op::Native(NativeOp::new("defer-1", move |_, st| register(st, &f1))),
            Op::Native(NativeOp::new("defer-2", move |_, st| register(st, &f2))),
            Op::Native(NativeOp::new("mk", |cx, st| {
                let value = cx.int_handle(1);
                st.cur().assign_slot(0, value)
            })),
            Op::Return1 { src: 0 },
        ],
        1,
    );

    // Exception path.
    let (f1, f2) = (Arc::clone(&first), Arc::clone(&second));
    let err_entry = body(
        "err",
        vec![
            Op::Native(NativeOp::new("defer-1", move |_, st| register(st, &f1))),
            Op::Native(NativeOp::new("defer-2", move |_, st| register(st, &f2))),
            Op::Native(NativeOp::new("boom", |_, st| {
                st.cur().raise_msg(ExcKind::Unsupported, "resource failure")
            })),
        ],
        1,
    );

    let rt = runtime(image_of(vec![("ok", ok_entry), ("err", err_entry)]));
    let svc = rt.create_service("svc", skein::Reentrancy::Open).unwrap();

    let future = rt.submit(&svc, "ok", vec![]).unwrap();
    drive(&rt, &future).unwrap();
    assert_eq!(*log.borrow(), vec!["close-second", "close-first"]);

    log.borrow_mut().clear();
    let future = rt.submit(&svc, "err", vec![]).unwrap();
    let exc = drive(&rt, &future).unwrap_err();
    assert_eq!(exc.kind, ExcKind::Unsupported);
    assert_eq!(*log.borrow(), vec!["close-second", "close-first"]);
}

#[test]
fn assert_severity_is_honored() {
    let entry = body(
        "entry",
        vec![
            Op::Native(NativeOp::new("mk-false", |cx, st| {
                let value = cx.bool_handle(false);
                st.cur().assign_slot(0, value)
            })),
            Op::Assert { cond: 0 },
            Op::Native(NativeOp::new("mk-ok", |cx, st| {
                let value = cx.str_handle("survived");
                st.cur().assign_slot(1, value)
            })),
            Op::Return1 { src: 1 },
        ],
        2,
    );

    // Default severity raises.
    let rt = runtime(image_of(vec![("entry", Arc::clone(&entry))]));
    let svc = rt.create_service("svc", skein::Reentrancy::Open).unwrap();
    let future = rt.submit(&svc, "entry", vec![]).unwrap();
    assert_eq!(drive(&rt, &future).unwrap_err().kind, ExcKind::AssertionFailed);

    // Ignore continues.
    let rt = skein::RuntimeBuilder::new(image_of(vec![("entry", entry)]))
        .options(skein::ExecOptions {
            assert: skein::AssertSeverity::Ignore,
            ..skein::ExecOptions::default()
        })
        .build()
        .unwrap();
    let svc = rt.create_service("svc", skein::Reentrancy::Open).unwrap();
    let future = rt.submit(&svc, "entry", vec![]).unwrap();
    assert_eq!(drive(&rt, &future).unwrap().as_str(), Some("survived"));
}

#[test]
fn future_completion_preserves_identity() {
    // Completing and then awaiting a future yields the identical handle.
    let cell = skein::value::FutureCell::new();
    let payload = ObjHandle::new(builtin::INT, Payload::Native(skein::NativeValue::Int(11)));
    cell.complete(payload.clone());
    let observed = cell.peek().unwrap().unwrap();
    assert!(observed.same_identity(&payload));
}
