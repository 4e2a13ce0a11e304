//! Property and method dispatch surface.
//!
//! Reads and writes follow the access rules: struct access (or a missing
//! accessor) touches the backing field directly, reference-wrapped fields
//! delegate to the wrapper, everything else dispatches the resolved
//! accessor — which may be a registered native fast path. Invocations on a
//! service reference owned by another context route through its message
//! queue and park the caller on a wait frame.

use std::{cell::RefCell, rc::Rc};

use crate::{
    composition::{MethodImpl, PropertyId, methods},
    exception::{ExcKind, VmException},
    fiber::CallerRef,
    frame::{Frame, FrameStack},
    op::{OpResult, RetSlot},
    service::{Callee, Message, PropertyMsg},
    value::{ArgVec, FnHandle, FutureCell, NativeValue, ObjHandle, Payload, Value},
    vm::{
        Exec,
        deferred::{self, Continuation},
    },
};

/// Reads a property of `target` into `dst`.
pub fn get_property(cx: &mut Exec<'_>, st: &mut FrameStack<'_>, target: &ObjHandle, prop: PropertyId, dst: RetSlot) -> OpResult {
    if let Some(service) = target.as_service()
        && service != cx.service
    {
        return remote_property_get(cx, st, target, prop, dst);
    }

    let comp = cx.container.registry.get(target.composition());
    let Some(def) = comp.property(prop).cloned() else {
        return st
            .cur()
            .raise_msg(ExcKind::Unsupported, format!("no property #{} on {}", prop.raw(), comp.class_name));
    };

    let getter = if target.is_struct() { None } else { def.getter.clone() };
    match getter {
        None => get_field(cx, st, target, &def, dst),
        Some(MethodImpl::Native(native)) => native(cx, st, Some(target.clone()), ArgVec::new(), dst),
        Some(MethodImpl::Body(body)) => {
            let args = ArgVec::from_iter([Some(Value::Obj(target.clone()))]);
            st.call(Frame::for_body(&body, args, dst))
        }
    }
}

/// Direct field read, dereferencing reference wrappers.
fn get_field(
    cx: &mut Exec<'_>,
    st: &mut FrameStack<'_>,
    target: &ObjHandle,
    def: &crate::composition::PropertyDef,
    dst: RetSlot,
) -> OpResult {
    if !target.has_field(def.id) {
        return st
            .cur()
            .raise_msg(ExcKind::Unsupported, format!("invalid property `{}`", def.name));
    }
    let Some(value) = target.field(def.id) else {
        return st
            .cur()
            .raise_msg(ExcKind::Unsupported, format!("uninitialized property `{}`", def.name));
    };
    if def.is_ref {
        return ref_get(cx, st, &value, dst);
    }
    st.cur().assign(&dst, value)
}

/// Dereferences a reference wrapper; a pending future parks the reader.
pub fn ref_get(_cx: &mut Exec<'_>, st: &mut FrameStack<'_>, wrapper: &ObjHandle, dst: RetSlot) -> OpResult {
    match wrapper.payload() {
        Payload::Ref(cell) => match cell.borrow().clone() {
            Some(value) => st.cur().assign(&dst, value),
            None => st.cur().raise_msg(ExcKind::Unsupported, "unassigned reference"),
        },
        Payload::Future(cell) => match cell.peek() {
            Some(Ok(value)) => st.cur().assign(&dst, value),
            Some(Err(exc)) => st.cur().raise(exc),
            None => st.call(deferred::wait_frame(cell, dst)),
        },
        _ => st.cur().raise_msg(ExcKind::Unsupported, "target is not a reference"),
    }
}

/// Stores through a reference wrapper.
pub fn ref_set(_cx: &mut Exec<'_>, st: &mut FrameStack<'_>, wrapper: &ObjHandle, value: ObjHandle) -> OpResult {
    match wrapper.payload() {
        Payload::Ref(cell) => {
            *cell.borrow_mut() = Some(value);
            OpResult::Next
        }
        Payload::Future(cell) => {
            // Writing a future-backed reference completes it.
            cell.complete(value);
            OpResult::Next
        }
        _ => st.cur().raise_msg(ExcKind::Unsupported, "target is not a reference"),
    }
}

/// Writes a property of `target`.
pub fn set_property(
    cx: &mut Exec<'_>,
    st: &mut FrameStack<'_>,
    target: &ObjHandle,
    prop: PropertyId,
    value: ObjHandle,
) -> OpResult {
    if let Some(service) = target.as_service()
        && service != cx.service
    {
        return remote_property_set(cx, st, target, prop, value);
    }

    let comp = cx.container.registry.get(target.composition());
    let Some(def) = comp.property(prop).cloned() else {
        return st
            .cur()
            .raise_msg(ExcKind::Unsupported, format!("no property #{} on {}", prop.raw(), comp.class_name));
    };

    if !target.is_mutable() {
        return st
            .cur()
            .raise_msg(ExcKind::ReadOnly, format!("immutable target for `{}`", def.name));
    }
    // Struct access writes are construction-time initialization and bypass
    // the read-only check.
    if def.read_only && !target.is_struct() {
        return st
            .cur()
            .raise_msg(ExcKind::ReadOnly, format!("read-only property `{}`", def.name));
    }

    let setter = if target.is_struct() { None } else { def.setter.clone() };
    match setter {
        None => {
            if def.is_ref {
                if let Some(wrapper) = target.field(def.id) {
                    return ref_set(cx, st, &wrapper, value);
                }
                // First write installs the wrapper's referent directly.
                let wrapper = ObjHandle::new(
                    crate::container::builtin::REF,
                    Payload::Ref(RefCell::new(Some(value))),
                );
                target.set_field(def.id, wrapper);
                return OpResult::Next;
            }
            target.set_field(def.id, value);
            OpResult::Next
        }
        Some(MethodImpl::Native(native)) => {
            let args = ArgVec::from_iter([Some(Value::Obj(value))]);
            native(cx, st, Some(target.clone()), args, RetSlot::Discard)
        }
        Some(MethodImpl::Body(body)) => {
            let args = ArgVec::from_iter([Some(Value::Obj(target.clone())), Some(Value::Obj(value))]);
            st.call(Frame::for_body(&body, args, RetSlot::Discard))
        }
    }
}

fn caller_ref(cx: &Exec<'_>) -> Option<CallerRef> {
    cx.fiber.map(|fiber| CallerRef {
        service: cx.service,
        fiber,
    })
}

fn remote_property_get(cx: &mut Exec<'_>, st: &mut FrameStack<'_>, target: &ObjHandle, prop: PropertyId, dst: RetSlot) -> OpResult {
    let service = target.as_service().expect("remote target is a service ref");
    let comp = cx.container.registry.get(target.composition());
    if let Some(def) = comp.property(prop)
        && !def.atomic
    {
        return st
            .cur()
            .raise_msg(ExcKind::Unsupported, format!("property `{}` is not atomic", def.name));
    }
    let Some(endpoints) = cx.container.endpoints(service) else {
        return st.cur().raise_msg(ExcKind::Unsupported, "target service is gone");
    };
    let future = FutureCell::new();
    let message = Message::PropertyOp {
        caller: caller_ref(cx),
        prop,
        op: PropertyMsg::Get,
        future: Some(future.clone()),
    };
    if endpoints.post_message(message).is_err() {
        return st.cur().raise_msg(ExcKind::Unsupported, "target service refused the request");
    }
    st.call(deferred::wait_frame(&future, dst))
}

fn remote_property_set(
    cx: &mut Exec<'_>,
    st: &mut FrameStack<'_>,
    target: &ObjHandle,
    prop: PropertyId,
    value: ObjHandle,
) -> OpResult {
    let service = target.as_service().expect("remote target is a service ref");
    let Some(endpoints) = cx.container.endpoints(service) else {
        return st.cur().raise_msg(ExcKind::Unsupported, "target service is gone");
    };
    // Writes are posted fire-and-forget, matching the one-way property-op
    // message shape.
    let message = Message::PropertyOp {
        caller: None,
        prop,
        op: PropertyMsg::Set(value),
        future: None,
    };
    if endpoints.post_message(message).is_err() {
        return st.cur().raise_msg(ExcKind::Unsupported, "target service refused the request");
    }
    OpResult::Next
}

/// Invokes a method on `target`, routing cross-service when the target is a
/// remote service reference.
pub fn invoke_method(
    cx: &mut Exec<'_>,
    st: &mut FrameStack<'_>,
    target: &ObjHandle,
    method: crate::composition::MethodId,
    args: ArgVec,
    ret: RetSlot,
) -> OpResult {
    if let Some(service) = target.as_service()
        && service != cx.service
    {
        return invoke_remote(cx, st, service, method, args, ret);
    }
    invoke_method_local(cx, st, target, method, args, ret)
}

/// Dispatches a method against the local composition's call chain. The
/// chain's top entry decides: a native handler bypasses bytecode.
pub fn invoke_method_local(
    cx: &mut Exec<'_>,
    st: &mut FrameStack<'_>,
    target: &ObjHandle,
    method: crate::composition::MethodId,
    args: ArgVec,
    ret: RetSlot,
) -> OpResult {
    let comp = cx.container.registry.get(target.composition());
    let Some(chain) = comp.method_chain(method) else {
        return st
            .cur()
            .raise_msg(ExcKind::Unsupported, format!("no method #{} on {}", method.raw(), comp.class_name));
    };
    let target = target.clone();
    match chain.top().clone() {
        MethodImpl::Native(native) => deferred::resolve_args(
            cx,
            st,
            args,
            Box::new(move |cx, st, args| native(cx, st, Some(target), args, ret)),
        ),
        MethodImpl::Body(body) => deferred::resolve_args(
            cx,
            st,
            args,
            Box::new(move |_, st, mut args| {
                args.insert(0, Some(Value::Obj(target)));
                st.call(Frame::for_body(&body, args, ret))
            }),
        ),
    }
}

/// Ships an invocation to another service and parks the caller on the
/// returned future(s). A `Discard` destination is fire-and-forget.
fn invoke_remote(
    cx: &mut Exec<'_>,
    st: &mut FrameStack<'_>,
    service: crate::service::ServiceId,
    method: crate::composition::MethodId,
    args: ArgVec,
    ret: RetSlot,
) -> OpResult {
    let caller = caller_ref(cx);
    // Deferred placeholders never cross a service boundary.
    deferred::resolve_args(
        cx,
        st,
        args,
        Box::new(move |cx, st, args| {
            let Some(endpoints) = cx.container.endpoints(service) else {
                return st.cur().raise_msg(ExcKind::Unsupported, "target service is gone");
            };
            let outcome = match &ret {
                RetSlot::Discard => {
                    let message = Message::Invoke1 {
                        caller: None,
                        callee: Callee::Method(method),
                        args,
                        returns: 0,
                        future: None,
                    };
                    endpoints.post_message(message).map(|()| None)
                }
                RetSlot::Multi(slots) | RetSlot::Cond(slots) => {
                    let returns = slots.len();
                    let future = FutureCell::new();
                    let message = Message::InvokeN {
                        caller,
                        callee: Callee::Method(method),
                        args,
                        returns,
                        future: future.clone(),
                    };
                    endpoints
                        .post_message(message)
                        .map(|()| Some(deferred::wait_frame_multi(&future, returns, ret.clone())))
                }
                scalar => {
                    let future = FutureCell::new();
                    let message = Message::Invoke1 {
                        caller,
                        callee: Callee::Method(method),
                        args,
                        returns: 1,
                        future: Some(future.clone()),
                    };
                    endpoints
                        .post_message(message)
                        .map(|()| Some(deferred::wait_frame(&future, scalar.clone())))
                }
            };
            match outcome {
                Ok(Some(wait)) => st.call(wait),
                Ok(None) => OpResult::Next,
                Err(_) => st.cur().raise_msg(ExcKind::Unsupported, "target service refused the request"),
            }
        }),
    )
}

/// Invokes a callable value.
pub fn call_fn(cx: &mut Exec<'_>, st: &mut FrameStack<'_>, handle: FnHandle, args: ArgVec, ret: RetSlot) -> OpResult {
    let mut full = ArgVec::from_iter(handle.bound.iter().cloned());
    full.extend(args);
    match handle.imp {
        MethodImpl::Native(native) => deferred::resolve_args(
            cx,
            st,
            full,
            Box::new(move |cx, st, args| native(cx, st, None, args, ret)),
        ),
        MethodImpl::Body(body) => deferred::resolve_args(
            cx,
            st,
            full,
            Box::new(move |_, st, args| st.call(Frame::for_body(&body, args, ret))),
        ),
    }
}

/// Unary in-place actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InPlaceAction {
    Inc,
    Dec,
}

/// Binary compound-assignment actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryAction {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    And,
    Or,
    Xor,
    Shl,
    Shr,
}

fn apply_unary(action: InPlaceAction, value: &ObjHandle) -> Result<ObjHandle, VmException> {
    let result = match value.payload() {
        Payload::Native(NativeValue::Int(i)) => {
            let next = match action {
                InPlaceAction::Inc => i.checked_add(1),
                InPlaceAction::Dec => i.checked_sub(1),
            };
            let next = next.ok_or_else(|| VmException::new(ExcKind::Bounds, "integer overflow"))?;
            Payload::Native(NativeValue::Int(next))
        }
        Payload::Native(NativeValue::Float(f)) => {
            let next = match action {
                InPlaceAction::Inc => f + 1.0,
                InPlaceAction::Dec => f - 1.0,
            };
            Payload::Native(NativeValue::Float(next))
        }
        _ => return Err(VmException::new(ExcKind::Unsupported, "value does not support sequencing")),
    };
    Ok(ObjHandle::new(value.composition(), result))
}

fn apply_binary(action: BinaryAction, value: &ObjHandle, arg: &ObjHandle) -> Result<ObjHandle, VmException> {
    use BinaryAction::*;
    let payload = match (value.payload(), arg.payload()) {
        (Payload::Native(NativeValue::Int(a)), Payload::Native(NativeValue::Int(b))) => {
            let (a, b) = (*a, *b);
            let out = match action {
                Add => a.checked_add(b),
                Sub => a.checked_sub(b),
                Mul => a.checked_mul(b),
                Div => {
                    if b == 0 {
                        return Err(VmException::new(ExcKind::Unsupported, "division by zero"));
                    }
                    a.checked_div(b)
                }
                Mod => {
                    if b == 0 {
                        return Err(VmException::new(ExcKind::Unsupported, "division by zero"));
                    }
                    a.checked_rem(b)
                }
                And => Some(a & b),
                Or => Some(a | b),
                Xor => Some(a ^ b),
                Shl => a.checked_shl(u32::try_from(b).unwrap_or(u32::MAX)),
                Shr => a.checked_shr(u32::try_from(b).unwrap_or(u32::MAX)),
            };
            let out = out.ok_or_else(|| VmException::new(ExcKind::Bounds, "integer overflow"))?;
            Payload::Native(NativeValue::Int(out))
        }
        (Payload::Native(NativeValue::Float(a)), Payload::Native(NativeValue::Float(b))) => {
            let out = match action {
                Add => a + b,
                Sub => a - b,
                Mul => a * b,
                Div => a / b,
                Mod => a % b,
                _ => return Err(VmException::new(ExcKind::Unsupported, "bitwise action on Float")),
            };
            Payload::Native(NativeValue::Float(out))
        }
        (Payload::Native(NativeValue::Str(a)), Payload::Native(NativeValue::Str(b))) if action == Add => {
            Payload::Native(NativeValue::Str(format!("{a}{b}").into()))
        }
        (Payload::Native(NativeValue::Bool(a)), Payload::Native(NativeValue::Bool(b))) => {
            let out = match action {
                And => a & b,
                Or => a | b,
                Xor => a ^ b,
                _ => return Err(VmException::new(ExcKind::Unsupported, "arithmetic action on Boolean")),
            };
            Payload::Native(NativeValue::Bool(out))
        }
        _ => return Err(VmException::new(ExcKind::Unsupported, "mismatched operands")),
    };
    Ok(ObjHandle::new(value.composition(), payload))
}

/// Where an in-place driver reads and writes.
enum IpTarget {
    Property(ObjHandle, PropertyId),
    Reference(ObjHandle),
}

enum IpAction {
    Unary(InPlaceAction),
    Binary(BinaryAction, ObjHandle),
}

struct IpState {
    target: IpTarget,
    action: IpAction,
    /// Post-form returns the pre-value; pre-form the post-value.
    post: bool,
    dst: RetSlot,
    step: i8,
    old: Option<ObjHandle>,
    new: Option<ObjHandle>,
}

/// The fixed three-step in-place state machine: read, act, write — each
/// step may independently report `Next`/`Call`/`Exception`, threaded via
/// continuations.
#[derive(Clone)]
struct InPlaceDriver {
    state: Rc<RefCell<IpState>>,
}

impl InPlaceDriver {
    fn update_result(&self, st: &mut FrameStack<'_>) -> Result<(), VmException> {
        let step = self.state.borrow().step;
        match step {
            0 => {
                let value = st
                    .cur()
                    .pop_stack()
                    .ok_or_else(|| VmException::fault(ExcKind::Unsupported, "in-place read produced no value"))?;
                self.state.borrow_mut().old = Some(value);
            }
            1 | 2 => {}
            _ => return Err(VmException::fault(ExcKind::Unsupported, "in-place driver out of sequence")),
        }
        Ok(())
    }

    fn do_next(&self, cx: &mut Exec<'_>, st: &mut FrameStack<'_>) -> OpResult {
        loop {
            let step = {
                let mut state = self.state.borrow_mut();
                state.step += 1;
                state.step
            };
            let result = match step {
                0 => {
                    let state = self.state.borrow();
                    match &state.target {
                        IpTarget::Property(target, prop) => {
                            let (target, prop) = (target.clone(), *prop);
                            drop(state);
                            get_property(cx, st, &target, prop, RetSlot::Stack)
                        }
                        IpTarget::Reference(wrapper) => {
                            let wrapper = wrapper.clone();
                            drop(state);
                            ref_get(cx, st, &wrapper, RetSlot::Stack)
                        }
                    }
                }
                1 => {
                    let computed = {
                        let state = self.state.borrow();
                        let old = state.old.as_ref().expect("in-place read complete");
                        match &state.action {
                            IpAction::Unary(action) => apply_unary(*action, old),
                            IpAction::Binary(action, arg) => apply_binary(*action, old, arg),
                        }
                    };
                    match computed {
                        Ok(value) => {
                            self.state.borrow_mut().new = Some(value);
                            OpResult::Next
                        }
                        Err(exc) => return st.cur().raise(exc),
                    }
                }
                2 => {
                    let (target, value) = {
                        let state = self.state.borrow();
                        (
                            match &state.target {
                                IpTarget::Property(t, p) => IpTarget::Property(t.clone(), *p),
                                IpTarget::Reference(w) => IpTarget::Reference(w.clone()),
                            },
                            state.new.clone().expect("in-place action complete"),
                        )
                    };
                    match target {
                        IpTarget::Property(target, prop) => set_property(cx, st, &target, prop, value),
                        IpTarget::Reference(wrapper) => ref_set(cx, st, &wrapper, value),
                    }
                }
                _ => {
                    let state = self.state.borrow();
                    let result = if state.post {
                        state.old.clone()
                    } else {
                        state.new.clone()
                    };
                    let dst = state.dst.clone();
                    drop(state);
                    let value = result.expect("in-place sequence complete");
                    return st.cur().assign(&dst, value);
                }
            };
            match result {
                OpResult::Next => {
                    if let Err(exc) = self.update_result(st) {
                        return st.cur().raise(exc);
                    }
                }
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
                        format!("in-place step reported {other:?}"),
                    ));
                }
            }
        }
    }
}

impl Continuation for InPlaceDriver {
    fn proceed(&mut self, cx: &mut Exec<'_>, st: &mut FrameStack<'_>) -> OpResult {
        if let Err(exc) = self.update_result(st) {
            return st.cur().raise(exc);
        }
        self.do_next(cx, st)
    }
}

/// Pre-/post-increment or -decrement of a property.
pub fn in_place_property(
    cx: &mut Exec<'_>,
    st: &mut FrameStack<'_>,
    target: ObjHandle,
    prop: PropertyId,
    action: InPlaceAction,
    post: bool,
    dst: RetSlot,
) -> OpResult {
    let driver = InPlaceDriver {
        state: Rc::new(RefCell::new(IpState {
            target: IpTarget::Property(target, prop),
            action: IpAction::Unary(action),
            post,
            dst,
            step: -1,
            old: None,
            new: None,
        })),
    };
    driver.do_next(cx, st)
}

/// Compound binary assignment on a property (`+=` and friends).
pub fn in_place_property_binary(
    cx: &mut Exec<'_>,
    st: &mut FrameStack<'_>,
    target: ObjHandle,
    prop: PropertyId,
    action: BinaryAction,
    arg: ObjHandle,
    dst: RetSlot,
) -> OpResult {
    let driver = InPlaceDriver {
        state: Rc::new(RefCell::new(IpState {
            target: IpTarget::Property(target, prop),
            action: IpAction::Binary(action, arg),
            post: false,
            dst,
            step: -1,
            old: None,
            new: None,
        })),
    };
    driver.do_next(cx, st)
}

/// Pre-/post-increment or -decrement through a reference wrapper.
pub fn in_place_ref(
    cx: &mut Exec<'_>,
    st: &mut FrameStack<'_>,
    wrapper: ObjHandle,
    action: InPlaceAction,
    post: bool,
    dst: RetSlot,
) -> OpResult {
    let driver = InPlaceDriver {
        state: Rc::new(RefCell::new(IpState {
            target: IpTarget::Reference(wrapper),
            action: IpAction::Unary(action),
            post,
            dst,
            step: -1,
            old: None,
            new: None,
        })),
    };
    driver.do_next(cx, st)
}

/// Compound binary assignment through a reference wrapper.
pub fn in_place_ref_binary(
    cx: &mut Exec<'_>,
    st: &mut FrameStack<'_>,
    wrapper: ObjHandle,
    action: BinaryAction,
    arg: ObjHandle,
    dst: RetSlot,
) -> OpResult {
    let driver = InPlaceDriver {
        state: Rc::new(RefCell::new(IpState {
            target: IpTarget::Reference(wrapper),
            action: IpAction::Binary(action, arg),
            post: false,
            dst,
            step: -1,
            old: None,
            new: None,
        })),
    };
    driver.do_next(cx, st)
}

/// Output cap for diagnostics rendering.
const MAX_RENDER_LEN: usize = 16 * 1024;

/// Renders a handle into `dst` as a string for diagnostics.
///
/// Compositions that declare a `describe` method get a full call;
/// everything else renders structurally (field-by-field for compounds,
/// composing through the outcome protocol and bounded in size).
pub fn describe(cx: &mut Exec<'_>, st: &mut FrameStack<'_>, handle: &ObjHandle, dst: RetSlot) -> OpResult {
    let comp = cx.container.registry.get(handle.composition());
    if comp.method_chain(methods::DESCRIBE).is_some() && !handle.is_struct() {
        return invoke_method_local(cx, st, handle, methods::DESCRIBE, ArgVec::new(), dst);
    }

    match handle.payload() {
        Payload::Native(native) => {
            let text = match native {
                NativeValue::Bool(b) => b.to_string(),
                NativeValue::Int(i) => i.to_string(),
                NativeValue::Float(f) => f.to_string(),
                NativeValue::Str(s) => s.to_string(),
            };
            let value = cx.str_handle(&text);
            st.cur().assign(&dst, value)
        }
        Payload::Service(id) => {
            let value = cx.str_handle(&format!("Service#{}", id.raw()));
            st.cur().assign(&dst, value)
        }
        Payload::Exception(exc) => {
            let value = cx.str_handle(&exc.to_string());
            st.cur().assign(&dst, value)
        }
        Payload::Fn(_) => {
            let value = cx.str_handle("<function>");
            st.cur().assign(&dst, value)
        }
        Payload::Future(cell) => {
            let value = cx.str_handle(&format!("{cell:?}"));
            st.cur().assign(&dst, value)
        }
        Payload::Ref(_) => {
            let value = cx.str_handle("<ref>");
            st.cur().assign(&dst, value)
        }
        Payload::Tuple(values) => {
            let entries: Vec<(Option<String>, ObjHandle)> = values.iter().map(|v| (None, v.clone())).collect();
            render_entries(cx, st, "".to_owned(), entries, dst)
        }
        Payload::Fields(map) => {
            let entries: Vec<(Option<String>, ObjHandle)> = {
                let map = map.borrow();
                map.iter()
                    .filter_map(|(id, value)| {
                        value.clone().map(|v| {
                            let name = comp.property(*id).map(|p| p.name.clone());
                            (name, v)
                        })
                    })
                    .collect()
            };
            render_entries(cx, st, comp.class_name.clone(), entries, dst)
        }
    }
}

struct RenderState {
    label: String,
    entries: Vec<(Option<String>, ObjHandle)>,
    index: usize,
    buf: String,
    truncated: bool,
    dst: RetSlot,
}

/// Composes per-entry `describe` calls through the outcome protocol.
#[derive(Clone)]
struct RenderEntries {
    state: Rc<RefCell<RenderState>>,
}

impl RenderEntries {
    fn update_result(&self, st: &mut FrameStack<'_>) -> bool {
        let Some(value) = st.cur().pop_stack() else {
            self.state.borrow_mut().index += 1;
            return true;
        };
        let mut state = self.state.borrow_mut();
        let index = state.index;
        if let Some(name) = state.entries[index].0.clone() {
            state.buf.push_str(&name);
            state.buf.push('=');
        }
        state.buf.push_str(value.as_str().unwrap_or("<opaque>"));
        state.index += 1;
        if state.buf.len() >= MAX_RENDER_LEN {
            state.buf.push_str("...");
            state.truncated = true;
            return false;
        }
        state.buf.push_str(", ");
        true
    }

    fn do_next(&self, cx: &mut Exec<'_>, st: &mut FrameStack<'_>) -> OpResult {
        loop {
            let next = {
                let state = self.state.borrow();
                if state.truncated || state.index >= state.entries.len() {
                    None
                } else {
                    Some(state.entries[state.index].1.clone())
                }
            };
            let Some(value) = next else {
                return self.finish(cx, st);
            };
            match describe(cx, st, &value, RetSlot::Stack) {
                OpResult::Next => {
                    if !self.update_result(st) {
                        return self.finish(cx, st);
                    }
                }
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
                        format!("describe reported {other:?}"),
                    ));
                }
            }
        }
    }

    fn finish(&self, cx: &mut Exec<'_>, st: &mut FrameStack<'_>) -> OpResult {
        let (text, dst) = {
            let mut state = self.state.borrow_mut();
            let mut buf = std::mem::take(&mut state.buf);
            if buf.ends_with(", ") {
                buf.truncate(buf.len() - 2);
            }
            (format!("{}({buf})", state.label), state.dst.clone())
        };
        let value = cx.str_handle(&text);
        st.cur().assign(&dst, value)
    }
}

impl Continuation for RenderEntries {
    fn proceed(&mut self, cx: &mut Exec<'_>, st: &mut FrameStack<'_>) -> OpResult {
        if !self.update_result(st) {
            return self.finish(cx, st);
        }
        self.do_next(cx, st)
    }
}

fn render_entries(
    cx: &mut Exec<'_>,
    st: &mut FrameStack<'_>,
    label: String,
    entries: Vec<(Option<String>, ObjHandle)>,
    dst: RetSlot,
) -> OpResult {
    let driver = RenderEntries {
        state: Rc::new(RefCell::new(RenderState {
            label,
            entries,
            index: 0,
            buf: String::new(),
            truncated: false,
            dst,
        })),
    };
    driver.do_next(cx, st)
}
