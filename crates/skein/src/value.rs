//! Value handles and slot values.
//!
//! Every in-memory object is a boxed [`ObjHandle`]: a cheap-to-copy view
//! carrying the access marker, over shared payload data that knows its
//! composition and mutability. Slot contents are [`Value`]s — a tagged
//! variant that lets an argument slot temporarily hold a deferred
//! placeholder or an unresolved future without coloring the operations
//! that read it.

use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::Rc,
};

use indexmap::IndexMap;
use smallvec::SmallVec;

use crate::{
    composition::{CompositionId, MethodImpl, PropertyId},
    exception::VmException,
    frame::Frame,
    service::ServiceId,
};

/// Argument vectors are short in practice; four inline slots cover the
/// common case.
pub type ArgVec = SmallVec<[Option<Value>; 4]>;

/// Access level of a handle view.
///
/// `Struct` exposes raw fields during construction, `Private` is the level
/// finalizers run under, `Public` is what user code observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// All fields visible and writable; the handle is mid-construction.
    Struct,
    /// Accessor methods are bypassed for the declaring class.
    Private,
    /// Normal access; property methods apply.
    Public,
}

/// Native scalar payloads.
#[derive(Debug, Clone)]
pub enum NativeValue {
    /// Boolean.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// Immutable string.
    Str(Rc<str>),
}

impl NativeValue {
    /// Structural equality between two native scalars of the same shape.
    #[must_use]
    pub fn eq_native(&self, other: &Self) -> Option<bool> {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => Some(a == b),
            (Self::Int(a), Self::Int(b)) => Some(a == b),
            (Self::Float(a), Self::Float(b)) => Some(a == b),
            (Self::Str(a), Self::Str(b)) => Some(a == b),
            _ => None,
        }
    }

    /// Total order between two native scalars of the same shape.
    #[must_use]
    pub fn cmp_native(&self, other: &Self) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            (Self::Int(a), Self::Int(b)) => Some(a.cmp(b)),
            (Self::Float(a), Self::Float(b)) => a.partial_cmp(b),
            (Self::Str(a), Self::Str(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

/// Payload of a handle.
pub enum Payload {
    /// A native scalar.
    Native(NativeValue),
    /// Compound value: ordered field map, keyed by property id. Declared
    /// field order is the map's insertion order; `None` marks a field that
    /// is present but not yet initialized (mid-construction).
    Fields(RefCell<IndexMap<PropertyId, Option<ObjHandle>>>),
    /// An immutable tuple of handles (multi-return packing).
    Tuple(Vec<ObjHandle>),
    /// A callable.
    Fn(FnHandle),
    /// A deferred result.
    Future(FutureCell),
    /// A reference wrapper around another handle (reference-typed
    /// properties store one of these in their backing field).
    Ref(RefCell<Option<ObjHandle>>),
    /// A service reference; invocations route through its message queue.
    Service(ServiceId),
    /// An exception carrier observed by guard capture slots.
    Exception(Box<VmException>),
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native(v) => write!(f, "Native({v:?})"),
            Self::Fields(map) => write!(f, "Fields({} fields)", map.borrow().len()),
            Self::Tuple(vs) => write!(f, "Tuple({} values)", vs.len()),
            Self::Fn(_) => write!(f, "Fn"),
            Self::Future(cell) => write!(f, "Future({})", cell.state_name()),
            Self::Ref(_) => write!(f, "Ref"),
            Self::Service(id) => write!(f, "Service({id:?})"),
            Self::Exception(exc) => write!(f, "Exception({})", exc.kind),
        }
    }
}

struct ObjData {
    composition: CompositionId,
    mutable: Cell<bool>,
    payload: Payload,
}

/// A uniform, reference-like value handle.
///
/// Copying a handle copies the view (access marker) and shares the payload.
/// Identity comparison is payload identity, not view identity.
#[derive(Clone)]
pub struct ObjHandle {
    data: Rc<ObjData>,
    access: Access,
}

impl ObjHandle {
    /// Creates a public, immutable handle.
    pub fn new(composition: CompositionId, payload: Payload) -> Self {
        Self {
            data: Rc::new(ObjData {
                composition,
                mutable: Cell::new(false),
                payload,
            }),
            access: Access::Public,
        }
    }

    /// Creates a struct-access, mutable handle (construction entry state).
    pub fn new_struct(composition: CompositionId, payload: Payload) -> Self {
        Self {
            data: Rc::new(ObjData {
                composition,
                mutable: Cell::new(true),
                payload,
            }),
            access: Access::Struct,
        }
    }

    /// Creates a public, mutable handle.
    pub fn new_mutable(composition: CompositionId, payload: Payload) -> Self {
        let handle = Self::new_struct(composition, payload);
        handle.with_access(Access::Public)
    }

    /// The composition this handle was created from.
    #[inline]
    pub fn composition(&self) -> CompositionId {
        self.data.composition
    }

    /// The access marker of this view.
    #[inline]
    pub fn access(&self) -> Access {
        self.access
    }

    /// Returns a view of the same payload under a different access level.
    #[must_use]
    pub fn with_access(&self, access: Access) -> Self {
        Self {
            data: Rc::clone(&self.data),
            access,
        }
    }

    /// True while the handle is in `Struct` access.
    #[inline]
    pub fn is_struct(&self) -> bool {
        self.access == Access::Struct
    }

    #[inline]
    pub fn is_mutable(&self) -> bool {
        self.data.mutable.get()
    }

    /// Makes the payload immutable for every view.
    pub fn freeze(&self) {
        self.data.mutable.set(false);
    }

    #[inline]
    pub fn payload(&self) -> &Payload {
        &self.data.payload
    }

    /// Payload identity; drives the identity-equal short circuit.
    #[inline]
    pub fn same_identity(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.data, &other.data)
    }

    /// Reads a field by property id. `None` when the payload is not a
    /// field map, the field is absent, or the field is uninitialized.
    pub fn field(&self, prop: PropertyId) -> Option<ObjHandle> {
        match &self.data.payload {
            Payload::Fields(map) => map.borrow().get(&prop).cloned().flatten(),
            _ => None,
        }
    }

    /// Writes a field by property id, preserving declared field order.
    pub fn set_field(&self, prop: PropertyId, value: ObjHandle) {
        if let Payload::Fields(map) = &self.data.payload {
            map.borrow_mut().insert(prop, Some(value));
        }
    }

    /// True when the payload is a field map containing `prop` (initialized
    /// or not).
    pub fn has_field(&self, prop: PropertyId) -> bool {
        match &self.data.payload {
            Payload::Fields(map) => map.borrow().contains_key(&prop),
            _ => false,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match &self.data.payload {
            Payload::Native(NativeValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match &self.data.payload {
            Payload::Native(NativeValue::Int(i)) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.data.payload {
            Payload::Native(NativeValue::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_service(&self) -> Option<ServiceId> {
        match &self.data.payload {
            Payload::Service(id) => Some(*id),
            _ => None,
        }
    }
}

impl fmt::Debug for ObjHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjHandle")
            .field("composition", &self.data.composition)
            .field("access", &self.access)
            .field("payload", &self.data.payload)
            .finish()
    }
}

/// A callable: an implementation plus pre-bound leading arguments.
#[derive(Clone)]
pub struct FnHandle {
    /// The implementation to run.
    pub imp: MethodImpl,
    /// Pre-bound leading argument slots (a fully bound handle has every
    /// parameter here).
    pub bound: SmallVec<[Option<Value>; 2]>,
}

impl FnHandle {
    pub fn new(imp: MethodImpl) -> Self {
        Self {
            imp,
            bound: SmallVec::new(),
        }
    }

    /// Binds leading arguments, producing a new handle.
    #[must_use]
    pub fn bind_arguments(&self, args: impl IntoIterator<Item = Option<Value>>) -> Self {
        let mut bound = self.bound.clone();
        bound.extend(args);
        Self {
            imp: self.imp.clone(),
            bound,
        }
    }
}

impl fmt::Debug for FnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FnHandle({} bound)", self.bound.len())
    }
}

/// Result a future resolves to.
pub type FutureResult = Result<ObjHandle, VmException>;

/// Callback invoked when a future completes; registered by response
/// routing and by multi-return splitting.
pub type Waiter = Box<dyn FnOnce(&FutureResult)>;

enum FutureState {
    Pending(Vec<Waiter>),
    Done(FutureResult),
}

/// A one-shot completion cell.
///
/// Completion after the first is a no-op: a late response from a timed-out
/// call finds the cell already failed and is dropped.
#[derive(Clone)]
pub struct FutureCell(Rc<RefCell<FutureState>>);

impl Default for FutureCell {
    fn default() -> Self {
        Self::new()
    }
}

impl FutureCell {
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(FutureState::Pending(Vec::new()))))
    }

    /// Creates an already-completed cell.
    pub fn ready(handle: ObjHandle) -> Self {
        Self(Rc::new(RefCell::new(FutureState::Done(Ok(handle)))))
    }

    /// Completes the cell with a value. No-op if already done.
    pub fn complete(&self, handle: ObjHandle) {
        self.finish(Ok(handle));
    }

    /// Completes the cell exceptionally. No-op if already done.
    pub fn fail(&self, exc: VmException) {
        self.finish(Err(exc));
    }

    fn finish(&self, result: FutureResult) {
        let waiters = {
            let mut inner = self.0.borrow_mut();
            match &mut *inner {
                FutureState::Pending(waiters) => {
                    let drained = std::mem::take(waiters);
                    *inner = FutureState::Done(result);
                    drained
                }
                FutureState::Done(_) => return,
            }
        };
        let inner = self.0.borrow();
        let FutureState::Done(result) = &*inner else {
            unreachable!()
        };
        for waiter in waiters {
            waiter(result);
        }
    }

    /// Non-blocking view of the current state.
    pub fn peek(&self) -> Option<FutureResult> {
        match &*self.0.borrow() {
            FutureState::Pending(_) => None,
            FutureState::Done(result) => Some(result.clone()),
        }
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        matches!(&*self.0.borrow(), FutureState::Done(_))
    }

    /// Registers a completion callback; runs immediately if already done.
    pub fn when_done(&self, waiter: Waiter) {
        let run_now = {
            let mut inner = self.0.borrow_mut();
            match &mut *inner {
                FutureState::Pending(waiters) => {
                    waiters.push(waiter);
                    None
                }
                FutureState::Done(_) => Some(waiter),
            }
        };
        if let Some(waiter) = run_now {
            let inner = self.0.borrow();
            let FutureState::Done(result) = &*inner else {
                unreachable!()
            };
            waiter(result);
        }
    }

    fn state_name(&self) -> &'static str {
        match &*self.0.borrow() {
            FutureState::Pending(_) => "pending",
            FutureState::Done(Ok(_)) => "ready",
            FutureState::Done(Err(_)) => "failed",
        }
    }
}

impl fmt::Debug for FutureCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FutureCell({})", self.state_name())
    }
}

/// A deferred placeholder: resolving it means executing the carried frame,
/// whose completion leaves the real handle on the resolving frame's stack.
///
/// One-shot: the frame is taken by the first resolver.
#[derive(Clone)]
pub struct Deferred(Rc<RefCell<Option<Frame>>>);

impl Deferred {
    pub fn new(frame: Frame) -> Self {
        Self(Rc::new(RefCell::new(Some(frame))))
    }

    /// Takes the resolving frame; `None` if already taken.
    pub fn take_frame(&self) -> Option<Frame> {
        self.0.borrow_mut().take()
    }
}

impl fmt::Debug for Deferred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let taken = self.0.borrow().is_none();
        write!(f, "Deferred(taken: {taken})")
    }
}

/// A slot value.
///
/// `Obj` is the resolved common case. `Deferred` carries a resolver that
/// must run before an op may observe the slot. `Future` is a dynamic-ref
/// slot whose handle materializes when the future completes.
#[derive(Debug, Clone)]
pub enum Value {
    Obj(ObjHandle),
    Deferred(Deferred),
    Future(FutureCell),
}

impl Value {
    /// The resolved handle, if this value is resolved.
    pub fn as_obj(&self) -> Option<&ObjHandle> {
        match self {
            Self::Obj(h) => Some(h),
            _ => None,
        }
    }

    #[inline]
    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred(_))
    }

    pub fn into_obj(self) -> Option<ObjHandle> {
        match self {
            Self::Obj(h) => Some(h),
            _ => None,
        }
    }
}

impl From<ObjHandle> for Value {
    fn from(handle: ObjHandle) -> Self {
        Self::Obj(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composition::CompositionId;

    fn int_handle(i: i64) -> ObjHandle {
        ObjHandle::new(CompositionId::new(0), Payload::Native(NativeValue::Int(i)))
    }

    #[test]
    fn handle_views_share_payload() {
        let h = int_handle(42);
        let private = h.with_access(Access::Private);
        assert!(h.same_identity(&private));
        assert_eq!(private.access(), Access::Private);
        assert_eq!(h.access(), Access::Public);
    }

    #[test]
    fn freeze_applies_to_all_views() {
        let h = ObjHandle::new_struct(CompositionId::new(0), Payload::Fields(RefCell::new(IndexMap::new())));
        let public = h.with_access(Access::Public);
        assert!(public.is_mutable());
        h.freeze();
        assert!(!public.is_mutable());
    }

    #[test]
    fn future_completes_once() {
        let cell = FutureCell::new();
        assert!(cell.peek().is_none());
        cell.complete(int_handle(1));
        // A late completion is dropped, not an error.
        cell.complete(int_handle(2));
        let result = cell.peek().unwrap().unwrap();
        assert_eq!(result.as_int(), Some(1));
    }

    #[test]
    fn future_waiters_run_on_completion() {
        let cell = FutureCell::new();
        let seen = Rc::new(Cell::new(0_i64));
        let seen2 = Rc::clone(&seen);
        cell.when_done(Box::new(move |result| {
            seen2.set(result.as_ref().unwrap().as_int().unwrap());
        }));
        cell.complete(int_handle(7));
        assert_eq!(seen.get(), 7);
    }

    #[test]
    fn field_order_is_declaration_order() {
        let map: IndexMap<PropertyId, Option<ObjHandle>> = IndexMap::new();
        let h = ObjHandle::new_struct(CompositionId::new(1), Payload::Fields(RefCell::new(map)));
        let (a, b, c) = (PropertyId::new(10), PropertyId::new(3), PropertyId::new(7));
        h.set_field(a, int_handle(1));
        h.set_field(b, int_handle(2));
        h.set_field(c, int_handle(3));
        if let Payload::Fields(map) = h.payload() {
            let order: Vec<PropertyId> = map.borrow().keys().copied().collect();
            assert_eq!(order, vec![a, b, c]);
        } else {
            panic!("expected field map");
        }
    }
}
