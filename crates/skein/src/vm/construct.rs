//! The construction pipeline and singleton initialization.
//!
//! Construction builds the inheritance-ordered sequence around a struct
//! handle: auto-initializer, default constructors root-to-leaf, the primary
//! constructor, then finalizers leaf-to-root under private access, and
//! finally the flip to public access and the assignment. Finalizers hang on
//! a shared anchor and run on the exception path too.

use std::{cell::RefCell, rc::Rc, sync::Arc};

use indexmap::IndexMap;

use crate::{
    composition::{ClassId, MethodId, MethodImpl, methods},
    exception::{ExcKind, VmException},
    fiber::CallerRef,
    frame::{Frame, FrameStack},
    image::{SingletonId, SingletonKind},
    op::{NativeOp, Op, OpResult, RetSlot},
    service::Message,
    value::{Access, ArgVec, FnHandle, FutureCell, ObjHandle, Payload, Value},
    vm::{
        Exec,
        deferred::{self, Continuation},
    },
};

/// Runs the construction pipeline for `class` with primary constructor
/// `ctor`, assigning the finished public handle into `ret`.
pub fn construct(
    cx: &mut Exec<'_>,
    st: &mut FrameStack<'_>,
    class: ClassId,
    ctor: MethodId,
    args: ArgVec,
    ret: RetSlot,
) -> OpResult {
    construct_impl(cx, st, class, ctor, args, ret, false)
}

/// Service-entry variant: additionally installs the constructed handle as
/// the executing service's instance.
pub fn construct_service(
    cx: &mut Exec<'_>,
    st: &mut FrameStack<'_>,
    class: ClassId,
    ctor: MethodId,
    args: ArgVec,
) -> OpResult {
    construct_impl(cx, st, class, ctor, args, RetSlot::Slot(0), true)
}

fn construct_impl(
    cx: &mut Exec<'_>,
    st: &mut FrameStack<'_>,
    class: ClassId,
    ctor: MethodId,
    args: ArgVec,
    ret: RetSlot,
    install: bool,
) -> OpResult {
    let comp_id = match cx.container.registry.ensure_canonical(class) {
        Ok(id) => id,
        Err(fault) => {
            return st
                .cur()
                .raise(VmException::fault(ExcKind::Unsupported, fault.to_string()));
        }
    };
    let comp = cx.container.registry.get(comp_id);
    let Some(chain) = comp.method_chain(ctor) else {
        return st
            .cur()
            .raise_msg(ExcKind::Unsupported, format!("no constructor #{} on {}", ctor.raw(), comp.class_name));
    };
    let MethodImpl::Body(ctor_body) = chain.top().clone() else {
        return st
            .cur()
            .raise_msg(ExcKind::Unsupported, "primary constructor must be interpreted");
    };

    // this:struct — every field present, none initialized, mutable.
    let fields: IndexMap<_, _> = comp.field_order.iter().map(|&prop| (prop, None)).collect();
    let struct_handle = ObjHandle::new_struct(comp_id, Payload::Fields(RefCell::new(fields)));

    deferred::resolve_args(
        cx,
        st,
        args,
        Box::new(move |_, st, args| {
            // The call sequence, built in reverse: the primary-constructor
            // frame carries the finalizer anchor and the assign step; each
            // default constructor is chained ahead of it.
            let mut ctor_args = ArgVec::from_iter([Some(Value::Obj(struct_handle.clone()))]);
            ctor_args.extend(args.iter().cloned());
            let mut frame_rc = Frame::for_body(&ctor_body, ctor_args, RetSlot::Discard);

            let private = struct_handle.with_access(Access::Private);
            let anchor = frame_rc.finalizers.clone();
            if let Some(finalizer) = &ctor_body.finalizer {
                // Finalizers run under private access with the original
                // constructor arguments in scope.
                let mut bound = ArgVec::from_iter([Some(Value::Obj(private.clone()))]);
                bound.extend(args);
                anchor.anchor_leaf(FnHandle::new(MethodImpl::Body(Arc::clone(finalizer))).bind_arguments(bound));
            }

            let immutable = comp.immutable;
            let assign_handle = struct_handle.clone();
            frame_rc.add_continuation(Box::new(move |cx: &mut Exec<'_>, st: &mut FrameStack<'_>| {
                // this:struct -> this:public
                let public = assign_handle.with_access(Access::Public);
                if immutable {
                    public.freeze();
                }
                if install {
                    cx.container.set_instance(cx.service, public.clone());
                }
                st.cur().assign(&ret, public)
            }));

            let mut next = frame_rc;
            for default_ctor in comp.default_ctors.iter().rev() {
                let dc_args = ArgVec::from_iter([Some(Value::Obj(struct_handle.clone()))]);
                let mut frame_dc = Frame::for_body(default_ctor, dc_args, RetSlot::Discard);
                // A default constructor registers its finalizer only once
                // it has completed.
                if let Some(finalizer) = &default_ctor.finalizer {
                    let anchor = anchor.clone();
                    let bound = FnHandle::new(MethodImpl::Body(Arc::clone(finalizer)))
                        .bind_arguments([Some(Value::Obj(private.clone()))]);
                    frame_dc.add_continuation(Box::new(move |_: &mut Exec<'_>, _: &mut FrameStack<'_>| {
                        anchor.chain(bound.clone());
                        OpResult::Next
                    }));
                }
                let mut staged = Some(next);
                frame_dc.add_continuation(Box::new(move |_: &mut Exec<'_>, st: &mut FrameStack<'_>| {
                    st.call(staged.take().expect("constructor chain resumed twice"))
                }));
                next = frame_dc;
            }

            if let Some(auto_init) = &comp.auto_init {
                let init_args = ArgVec::from_iter([Some(Value::Obj(struct_handle.clone()))]);
                let mut frame_init = Frame::for_body(auto_init, init_args, RetSlot::Discard);
                let mut staged = Some(next);
                frame_init.add_continuation(Box::new(move |_: &mut Exec<'_>, st: &mut FrameStack<'_>| {
                    st.call(staged.take().expect("constructor chain resumed twice"))
                }));
                next = frame_init;
            }

            st.call(next)
        }),
    )
}

type InitThen = Box<dyn FnOnce(&mut Exec<'_>, &mut FrameStack<'_>) -> OpResult>;

struct InitState {
    ids: Vec<SingletonId>,
    index: usize,
    /// Identity whose value is arriving on the stack.
    pending: Option<SingletonId>,
    then: Option<InitThen>,
}

/// Initializes a list of singleton identities in order.
///
/// On the main context each identity runs its initializer directly, with
/// re-entry on the same identity raising `CircularInitialization`. Off the
/// main context, a batch message is posted to the main context and the
/// calling fiber suspends until the aggregate completes.
#[derive(Clone)]
struct InitSingletons {
    state: Rc<RefCell<InitState>>,
}

impl InitSingletons {
    fn do_next(&self, cx: &mut Exec<'_>, st: &mut FrameStack<'_>) -> OpResult {
        loop {
            let next = {
                let mut state = self.state.borrow_mut();
                loop {
                    match state.ids.get(state.index) {
                        Some(&id) if cx.container.singleton_value(id).is_some() => state.index += 1,
                        Some(&id) => break Some(id),
                        None => break None,
                    }
                }
            };
            let Some(id) = next else {
                let then = self.state.borrow_mut().then.take().expect("tail continuation");
                return then(cx, st);
            };

            // Off the main context: ship the remaining batch there and wait.
            if let Some(main) = cx.container.main_service()
                && main != cx.service
            {
                let Some(endpoints) = cx.container.endpoints(main) else {
                    return st.cur().raise_msg(ExcKind::Unsupported, "main context is gone");
                };
                let remaining: Vec<SingletonId> = {
                    let state = self.state.borrow();
                    state.ids[state.index..].to_vec()
                };
                let future = FutureCell::new();
                let caller = cx.fiber.map(|fiber| CallerRef {
                    service: cx.service,
                    fiber,
                });
                let message = Message::InitSingletons {
                    caller,
                    ids: remaining,
                    future: future.clone(),
                };
                if endpoints.post_message(message).is_err() {
                    return st.cur().raise_msg(ExcKind::Unsupported, "main context refused the request");
                }
                let mut wait = deferred::wait_frame(&future, RetSlot::Discard);
                wait.add_continuation(Box::new(self.clone()));
                return st.call(wait);
            }

            if !cx.container.mark_initializing(id) {
                return st.cur().raise(VmException::fault(
                    ExcKind::CircularInitialization,
                    format!("singleton #{} re-entered its own initialization", id.raw()),
                ));
            }
            let Some(def) = cx.container.singleton_def(id).cloned() else {
                cx.container.clear_initializing(id);
                return st
                    .cur()
                    .raise_msg(ExcKind::Unsupported, format!("unknown singleton #{}", id.raw()));
            };

            match def.kind {
                SingletonKind::Module(class) | SingletonKind::Package(class) => {
                    let comp = match cx.container.registry.ensure_canonical(class) {
                        Ok(comp) => comp,
                        Err(fault) => {
                            cx.container.clear_initializing(id);
                            return st
                                .cur()
                                .raise(VmException::fault(ExcKind::Unsupported, fault.to_string()));
                        }
                    };
                    let handle = ObjHandle::new(comp, Payload::Fields(RefCell::new(IndexMap::new())));
                    cx.container.set_singleton(id, handle);
                    self.state.borrow_mut().index += 1;
                }
                SingletonKind::Class(class) => {
                    self.state.borrow_mut().pending = Some(id);
                    match construct(cx, st, class, methods::CONSTRUCT, ArgVec::new(), RetSlot::Stack) {
                        OpResult::Call => {
                            let callee = st
                                .cur()
                                .next_frame
                                .as_mut()
                                .expect("Call outcome without a staged callee");
                            callee.add_continuation(Box::new(self.clone()));
                            return OpResult::Call;
                        }
                        OpResult::Exception => return OpResult::Exception,
                        other => {
                            return st.cur().raise(VmException::fault(
                                ExcKind::Unsupported,
                                format!("singleton construction reported {other:?}"),
                            ));
                        }
                    }
                }
                SingletonKind::StaticProperty { init } => {
                    self.state.borrow_mut().pending = Some(id);
                    let mut frame = Frame::for_body(&init, ArgVec::new(), RetSlot::Stack);
                    frame.add_continuation(Box::new(self.clone()));
                    return st.call(frame);
                }
            }
        }
    }
}

impl Continuation for InitSingletons {
    fn proceed(&mut self, cx: &mut Exec<'_>, st: &mut FrameStack<'_>) -> OpResult {
        let pending = self.state.borrow_mut().pending.take();
        if let Some(id) = pending {
            let Some(value) = st.cur().pop_stack() else {
                return st.cur().raise(VmException::fault(
                    ExcKind::Unsupported,
                    "singleton initializer produced no value",
                ));
            };
            cx.container.set_singleton(id, value);
            self.state.borrow_mut().index += 1;
        }
        self.do_next(cx, st)
    }
}

/// Entry point: ensure every listed identity is initialized, then proceed
/// with `then`.
pub fn init_singletons(
    cx: &mut Exec<'_>,
    st: &mut FrameStack<'_>,
    ids: Vec<SingletonId>,
    then: InitThen,
) -> OpResult {
    let driver = InitSingletons {
        state: Rc::new(RefCell::new(InitState {
            ids,
            index: 0,
            pending: None,
            then: Some(then),
        })),
    };
    driver.do_next(cx, st)
}

/// The op body of a batch-initialization service message: initialize, then
/// acknowledge into the proto-frame's return slot.
pub fn init_singletons_op(cx: &mut Exec<'_>, st: &mut FrameStack<'_>, ids: Vec<SingletonId>) -> OpResult {
    init_singletons(
        cx,
        st,
        ids,
        Box::new(|cx, st| {
            let ack = cx.bool_handle(true);
            st.cur().assign(&RetSlot::Slot(0), ack)
        }),
    )
}

/// The resolver frame behind a deferred singleton constant: initialize on
/// first use, then leave the handle on the resolving frame's stack.
pub fn singleton_resolver_frame(id: SingletonId) -> Frame {
    let op = NativeOp::new("singleton-resolve", move |cx, st| {
        if let Some(handle) = cx.container.singleton_value(id) {
            return st.return_value(handle, false);
        }
        init_singletons(
            cx,
            st,
            vec![id],
            Box::new(move |cx, st| match cx.container.singleton_value(id) {
                Some(handle) => st.return_value(handle, false),
                None => st.cur().raise(VmException::fault(
                    ExcKind::Unsupported,
                    format!("singleton #{} failed to initialize", id.raw()),
                )),
            }),
        )
    });
    Frame::synthetic("singleton-init", Arc::from(vec![Op::Native(op)]), 0, RetSlot::Stack)
}
