//! The construction pipeline and singleton initialization.

mod common;

use std::{cell::RefCell, rc::Rc, sync::Arc};

use common::{body, drive, runtime};
use skein::{
    ClassDef, ClassId, Constant, ExcKind, ImageBuilder, MethodBody, MethodDecl, Op, PropertyId, Reentrancy, RetSlot,
    SingletonDef, SingletonId, SingletonKind, TypeId,
    composition::{MethodImpl, PropertyDef, methods},
    frame::{GuardDef, GuardMatcher},
    op::NativeOp,
    value::{Access, ArgVec},
};

const X: PropertyId = PropertyId::new(100);

fn field(id: PropertyId, name: &str) -> PropertyDef {
    PropertyDef {
        id,
        name: name.to_owned(),
        declared: TypeId::new(0),
        is_ref: false,
        read_only: false,
        atomic: false,
        getter: None,
        setter: None,
        has_field: true,
    }
}

fn recording_finalizer(tag: &'static str, log: &Rc<RefCell<Vec<&'static str>>>) -> Arc<MethodBody> {
    let log = Rc::clone(log);
    Arc::new(MethodBody::new(
        tag,
        vec![
            Op::Native(NativeOp::new("record", move |_, _| {
                log.borrow_mut().push(tag);
                skein::OpResult::Next
            })),
            Op::Return0,
        ],
        1,
        1,
        0,
    ))
}

/// Base <- Thing, both with default constructors carrying finalizers; the
/// primary constructor either initializes `x` or raises.
fn lineage_image(log: &Rc<RefCell<Vec<&'static str>>>, throwing_primary: bool) -> skein::ModuleImage {
    let base_default = Arc::new(
        MethodBody::new("Base.default", vec![Op::Return0], 1, 1, 0)
            .with_finalizer(recording_finalizer("base.finally", log)),
    );
    let thing_default = Arc::new(
        MethodBody::new("Thing.default", vec![Op::Return0], 1, 1, 0)
            .with_finalizer(recording_finalizer("thing.finally", log)),
    );
    let primary = if throwing_primary {
        Arc::new(MethodBody::new(
            "Thing.construct",
            vec![Op::Native(NativeOp::new("boom", |_, st| {
                st.cur().raise_msg(ExcKind::Unsupported, "constructor rejected input")
            }))],
            1,
            1,
            0,
        ))
    } else {
        Arc::new(MethodBody::new(
            "Thing.construct",
            vec![
                Op::LoadConst { pool: 0, dst: RetSlot::Slot(1) },
                Op::SetProp { target: 0, prop: X, src: 1 },
                Op::Return0,
            ],
            2,
            1,
            0,
        ))
    };

    let make = body(
        "make",
        vec![
            Op::LoadConst { pool: 1, dst: RetSlot::Slot(0) },
            Op::GuardStart(Arc::new(GuardDef {
                matcher: GuardMatcher::Any,
                handler_pc: 4,
                capture: None,
            })),
            Op::Native(NativeOp::new("construct", |cx, st| {
                skein::vm::construct::construct(
                    cx,
                    st,
                    ClassId::new(11),
                    methods::CONSTRUCT,
                    ArgVec::new(),
                    RetSlot::Slot(0),
                )
            })),
            Op::GuardEnd,
            Op::Return1 { src: 0 },
        ],
        1,
    );

    ImageBuilder::new("construct")
        .constant(Constant::Int(5))
        .constant(Constant::Str("sentinel".into()))
        .class(ClassDef {
            id: ClassId::new(10),
            name: "Base".to_owned(),
            superclass: None,
            type_of: TypeId::new(10),
            properties: Vec::new(),
            methods: Vec::new(),
            default_ctor: Some(base_default),
            auto_init: None,
            singleton: false,
            immutable: false,
        })
        .class(ClassDef {
            id: ClassId::new(11),
            name: "Thing".to_owned(),
            superclass: Some(ClassId::new(10)),
            type_of: TypeId::new(11),
            properties: vec![field(X, "x")],
            methods: vec![MethodDecl {
                id: methods::CONSTRUCT,
                imp: MethodImpl::Body(primary),
            }],
            default_ctor: Some(thing_default),
            auto_init: None,
            singleton: false,
            immutable: false,
        })
        .entry("make", make)
        .build()
        .unwrap()
}

#[test]
fn construction_runs_defaults_primary_and_finalizers() {
    let log = Rc::new(RefCell::new(Vec::new()));
    let rt = runtime(lineage_image(&log, false));
    let svc = rt.create_service("svc", Reentrancy::Open).unwrap();

    let future = rt.submit(&svc, "make", vec![]).unwrap();
    let result = drive(&rt, &future).unwrap();

    // The handle flipped to public access and the primary's field write
    // stuck.
    assert_eq!(result.access(), Access::Public);
    assert_eq!(result.field(X).unwrap().as_int(), Some(5));
    // Finalizers ran leaf-to-root.
    assert_eq!(*log.borrow(), vec!["thing.finally", "base.finally"]);
}

#[test]
fn throwing_primary_still_runs_registered_finalizers() {
    // The default chain completed and registered two finalizers before the
    // primary raised: both run, in reverse order; the declared assignment
    // target keeps its sentinel; the exception surfaces at the call site.
    let log = Rc::new(RefCell::new(Vec::new()));
    let rt = runtime(lineage_image(&log, true));
    let svc = rt.create_service("svc", Reentrancy::Open).unwrap();

    let future = rt.submit(&svc, "make", vec![]).unwrap();
    let result = drive(&rt, &future).unwrap();

    assert_eq!(result.as_str(), Some("sentinel"), "assignment target must not be written");
    assert_eq!(*log.borrow(), vec!["thing.finally", "base.finally"]);
}

fn singleton_image(circular: bool) -> skein::ModuleImage {
    // Constant pool: [0] -> singleton #0, [1] -> Int(99).
    let init = if circular {
        // The initializer reads its own singleton constant.
        Arc::new(MethodBody::new(
            "P.init",
            vec![Op::LoadConst { pool: 0, dst: RetSlot::Slot(0) }, Op::Return1 { src: 0 }],
            1,
            0,
            1,
        ))
    } else {
        Arc::new(MethodBody::new(
            "P.init",
            vec![Op::LoadConst { pool: 1, dst: RetSlot::Slot(0) }, Op::Return1 { src: 0 }],
            1,
            0,
            1,
        ))
    };
    let read = body(
        "read",
        vec![Op::LoadConst { pool: 0, dst: RetSlot::Slot(0) }, Op::Return1 { src: 0 }],
        1,
    );
    ImageBuilder::new("singletons")
        .constant(Constant::Singleton(SingletonId::new(0)))
        .constant(Constant::Int(99))
        .singleton(SingletonDef {
            id: SingletonId::new(0),
            name: "P".to_owned(),
            kind: SingletonKind::StaticProperty { init },
        })
        .entry("read", read)
        .build()
        .unwrap()
}

#[test]
fn singleton_initializes_once_and_keeps_identity() {
    let rt = runtime(singleton_image(false));
    let svc = rt.create_service("svc", Reentrancy::Open).unwrap();

    let first = rt.submit(&svc, "read", vec![]).unwrap();
    let first = drive(&rt, &first).unwrap();
    assert_eq!(first.as_int(), Some(99));

    // A second read (from another service) observes the identical handle.
    let other = rt.create_service("other", Reentrancy::Open).unwrap();
    let second = rt.submit(&other, "read", vec![]).unwrap();
    let second = drive(&rt, &second).unwrap();
    assert!(first.same_identity(&second));
}

#[test]
fn circular_singleton_initialization_raises() {
    // A static property whose initializer reads itself: the nested entry
    // raises CircularInitialization and no partial handle is published.
    let rt = runtime(singleton_image(true));
    let svc = rt.create_service("svc", Reentrancy::Open).unwrap();

    let future = rt.submit(&svc, "read", vec![]).unwrap();
    let exc = drive(&rt, &future).unwrap_err();
    assert_eq!(exc.kind, ExcKind::CircularInitialization);
    assert!(
        rt.container().singleton_value(SingletonId::new(0)).is_none(),
        "no partial handle may be published"
    );
}

#[test]
fn batch_initialization_routes_through_the_main_context() {
    // Reading the constant from a non-main service ships an InitSingletons
    // batch to the main context and suspends until it completes.
    let rt = runtime(singleton_image(false));
    let svc = rt.create_service("svc", Reentrancy::Open).unwrap();
    assert_ne!(svc.as_service(), rt.main_service().as_service());

    let future = rt.submit(&svc, "read", vec![]).unwrap();
    let mut tracer = skein::RecordingTracer::new();
    rt.run_until_idle(&mut tracer);
    assert_eq!(future.try_get().unwrap().unwrap().as_int(), Some(99));

    let main_id = rt.main_service().as_service().unwrap();
    let saw_batch = tracer.events().iter().any(|event| {
        matches!(event, skein::TraceEvent::Message { to, kind } if *to == main_id.raw() && *kind == "init-singletons")
    });
    assert!(saw_batch, "initialization must be batched to the main context");
}
