//! Equality and ordering.
//!
//! Compound values defer to their declared type: compositions that declare
//! an `equals`/`compare` method get a full call; ordinary composites
//! compare field by field. Identity-equal handles short-circuit. The
//! two-type sequences consult the second type only when the first reports
//! equality (ordering tie-breaks the same way).

use std::cmp::Ordering;

use crate::{
    composition::{TypeId, methods},
    exception::{ExcKind, VmException},
    frame::FrameStack,
    op::{OpResult, RetSlot},
    value::{ArgVec, ObjHandle, Payload, Value},
    vm::{Exec, property},
};

/// Structural equality; never runs user code.
pub fn structural_equals(cx: &Exec<'_>, a: &ObjHandle, b: &ObjHandle) -> Result<bool, VmException> {
    if a.same_identity(b) {
        return Ok(true);
    }
    if a.composition() != b.composition() {
        return Ok(false);
    }
    match (a.payload(), b.payload()) {
        (Payload::Native(x), Payload::Native(y)) => x
            .eq_native(y)
            .ok_or_else(|| VmException::new(ExcKind::Unsupported, "mismatched native payloads")),
        (Payload::Tuple(xs), Payload::Tuple(ys)) => {
            if xs.len() != ys.len() {
                return Ok(false);
            }
            for (x, y) in xs.iter().zip(ys) {
                if !structural_equals(cx, x, y)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        (Payload::Fields(xs), Payload::Fields(ys)) => {
            let xs = xs.borrow();
            let ys = ys.borrow();
            for (field, x) in xs.iter() {
                let y = ys.get(field);
                match (x, y) {
                    (Some(x), Some(Some(y))) => {
                        if !structural_equals(cx, x, y)? {
                            return Ok(false);
                        }
                    }
                    (None, Some(None)) => {}
                    _ => return Ok(false),
                }
            }
            Ok(true)
        }
        // Functions, futures, refs and services compare by identity only,
        // which the short circuit above already decided.
        _ => Ok(false),
    }
}

/// Structural ordering; never runs user code.
pub fn structural_compare(cx: &Exec<'_>, a: &ObjHandle, b: &ObjHandle) -> Result<Ordering, VmException> {
    if a.same_identity(b) {
        return Ok(Ordering::Equal);
    }
    match (a.payload(), b.payload()) {
        (Payload::Native(x), Payload::Native(y)) => x
            .cmp_native(y)
            .ok_or_else(|| VmException::new(ExcKind::Unsupported, "mismatched native payloads")),
        (Payload::Tuple(xs), Payload::Tuple(ys)) => {
            for (x, y) in xs.iter().zip(ys) {
                let ord = structural_compare(cx, x, y)?;
                if ord != Ordering::Equal {
                    return Ok(ord);
                }
            }
            Ok(xs.len().cmp(&ys.len()))
        }
        (Payload::Fields(xs), Payload::Fields(ys)) => {
            let xs = xs.borrow();
            let ys = ys.borrow();
            for (field, x) in xs.iter() {
                let (Some(x), Some(Some(y))) = (x, ys.get(field)) else {
                    return Err(VmException::new(ExcKind::Unsupported, "uncomparable composite"));
                };
                let ord = structural_compare(cx, x, y)?;
                if ord != Ordering::Equal {
                    return Ok(ord);
                }
            }
            Ok(Ordering::Equal)
        }
        _ => Err(VmException::new(ExcKind::Unsupported, "values do not support ordering")),
    }
}

/// An `Ordered` handle: -1, 0 or 1.
pub fn ordered_handle(cx: &Exec<'_>, ordering: Ordering) -> ObjHandle {
    cx.int_handle(match ordering {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    })
}

/// Equality under one declared type: a declared `equals` method gets a full
/// call, otherwise the structural rule applies.
pub fn call_equals(
    cx: &mut Exec<'_>,
    st: &mut FrameStack<'_>,
    _declared: TypeId,
    a: &ObjHandle,
    b: &ObjHandle,
    dst: RetSlot,
) -> OpResult {
    let comp = cx.container.registry.get(a.composition());
    if comp.method_chain(methods::EQUALS).is_some() {
        let args = ArgVec::from_iter([Some(Value::Obj(b.clone()))]);
        return property::invoke_method_local(cx, st, a, methods::EQUALS, args, dst);
    }
    match structural_equals(cx, a, b) {
        Ok(eq) => {
            let value = cx.bool_handle(eq);
            st.cur().assign(&dst, value)
        }
        Err(exc) => st.cur().raise(exc),
    }
}

/// Ordering under one declared type, mirroring [`call_equals`].
pub fn call_compare(
    cx: &mut Exec<'_>,
    st: &mut FrameStack<'_>,
    _declared: TypeId,
    a: &ObjHandle,
    b: &ObjHandle,
    dst: RetSlot,
) -> OpResult {
    let comp = cx.container.registry.get(a.composition());
    if comp.method_chain(methods::COMPARE).is_some() {
        let args = ArgVec::from_iter([Some(Value::Obj(b.clone()))]);
        return property::invoke_method_local(cx, st, a, methods::COMPARE, args, dst);
    }
    match structural_compare(cx, a, b) {
        Ok(ord) => {
            let value = ordered_handle(cx, ord);
            st.cur().assign(&dst, value)
        }
        Err(exc) => st.cur().raise(exc),
    }
}

/// Adapts equality across two declared types: the first type is consulted,
/// the second only if the first reported equal.
pub fn call_equals_sequence(
    cx: &mut Exec<'_>,
    st: &mut FrameStack<'_>,
    type1: TypeId,
    type2: TypeId,
    a: &ObjHandle,
    b: &ObjHandle,
    dst: RetSlot,
) -> OpResult {
    if a.same_identity(b) {
        let value = cx.bool_handle(true);
        return st.cur().assign(&dst, value);
    }
    match call_equals(cx, st, type1, a, b, RetSlot::Stack) {
        OpResult::Next => complete_equals(cx, st, type2, a, b, dst),
        OpResult::Call => {
            let (a, b) = (a.clone(), b.clone());
            let callee = st
                .cur()
                .next_frame
                .as_mut()
                .expect("Call outcome without a staged callee");
            callee.add_continuation(Box::new(move |cx: &mut Exec<'_>, st: &mut FrameStack<'_>| {
                complete_equals(cx, st, type2, &a, &b, dst.clone())
            }));
            OpResult::Call
        }
        OpResult::Exception => OpResult::Exception,
        other => st.cur().raise(VmException::fault(
            ExcKind::Unsupported,
            format!("equality reported {other:?}"),
        )),
    }
}

fn complete_equals(
    cx: &mut Exec<'_>,
    st: &mut FrameStack<'_>,
    type2: TypeId,
    a: &ObjHandle,
    b: &ObjHandle,
    dst: RetSlot,
) -> OpResult {
    let Some(result) = st.cur().pop_stack() else {
        return st
            .cur()
            .raise(VmException::fault(ExcKind::Unsupported, "equality produced no value"));
    };
    if result.as_bool() == Some(false) {
        return st.cur().assign(&dst, result);
    }
    call_equals(cx, st, type2, a, b, dst)
}

/// Adapts ordering across two declared types: the second tie-breaks.
pub fn call_compare_sequence(
    cx: &mut Exec<'_>,
    st: &mut FrameStack<'_>,
    type1: TypeId,
    type2: TypeId,
    a: &ObjHandle,
    b: &ObjHandle,
    dst: RetSlot,
) -> OpResult {
    if a.same_identity(b) {
        let value = ordered_handle(cx, Ordering::Equal);
        return st.cur().assign(&dst, value);
    }
    match call_compare(cx, st, type1, a, b, RetSlot::Stack) {
        OpResult::Next => complete_compare(cx, st, type2, a, b, dst),
        OpResult::Call => {
            let (a, b) = (a.clone(), b.clone());
            let callee = st
                .cur()
                .next_frame
                .as_mut()
                .expect("Call outcome without a staged callee");
            callee.add_continuation(Box::new(move |cx: &mut Exec<'_>, st: &mut FrameStack<'_>| {
                complete_compare(cx, st, type2, &a, &b, dst.clone())
            }));
            OpResult::Call
        }
        OpResult::Exception => OpResult::Exception,
        other => st.cur().raise(VmException::fault(
            ExcKind::Unsupported,
            format!("ordering reported {other:?}"),
        )),
    }
}

fn complete_compare(
    cx: &mut Exec<'_>,
    st: &mut FrameStack<'_>,
    type2: TypeId,
    a: &ObjHandle,
    b: &ObjHandle,
    dst: RetSlot,
) -> OpResult {
    let Some(result) = st.cur().pop_stack() else {
        return st
            .cur()
            .raise(VmException::fault(ExcKind::Unsupported, "ordering produced no value"));
    };
    if result.as_int() != Some(0) {
        return st.cur().assign(&dst, result);
    }
    call_compare(cx, st, type2, a, b, dst)
}
