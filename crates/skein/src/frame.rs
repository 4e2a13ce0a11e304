//! Activation records.
//!
//! A frame owns its local slots, program counter and op vector. Frames form
//! a stack per fiber; the callee under construction is staged in
//! `next_frame` until the dispatch loop splices it. Return-value routing
//! crosses frames and therefore lives on [`FrameStack`], the loop's view of
//! the whole stack.

use std::{cell::RefCell, fmt, rc::Rc, sync::Arc};

use smallvec::SmallVec;

use crate::{
    composition::{TypeId, TypeOracle},
    exception::{ExcKind, VmException},
    image::MethodBody,
    op::{Op, OpResult, RetSlot},
    value::{ArgVec, FnHandle, FutureCell, ObjHandle, Payload, Value},
    vm::{Exec, deferred::ContinuationChain},
};

/// Per-slot metadata.
#[derive(Debug, Clone, Copy)]
pub struct VarInfo {
    /// Declared type of the slot.
    pub declared: TypeId,
    /// The slot is a dynamic reference: it holds a future whose value
    /// materializes on completion.
    pub dynamic: bool,
}

impl VarInfo {
    pub const fn plain(declared: TypeId) -> Self {
        Self {
            declared,
            dynamic: false,
        }
    }

    pub const fn dynamic_ref(declared: TypeId) -> Self {
        Self {
            declared,
            dynamic: true,
        }
    }
}

/// How a guard decides whether it handles an exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardMatcher {
    /// Matches a built-in exception kind exactly.
    Kind(ExcKind),
    /// Matches when the raised exception's type is a subtype of the
    /// declared type (oracle query).
    Type(TypeId),
    /// Matches every catchable exception.
    Any,
}

/// A guarded region: matcher, handler entry point, and the slot the caught
/// exception is captured into.
#[derive(Debug, Clone)]
pub struct GuardDef {
    pub matcher: GuardMatcher,
    pub handler_pc: usize,
    pub capture: Option<u16>,
}

impl GuardDef {
    /// True when this guard handles `exc`. Fault-born exceptions match no
    /// guard.
    pub fn matches(&self, exc: &VmException, oracle: &dyn TypeOracle) -> bool {
        if exc.is_uncatchable() {
            return false;
        }
        match self.matcher {
            GuardMatcher::Any => true,
            GuardMatcher::Kind(kind) => exc.kind.is_caught_by(kind),
            GuardMatcher::Type(declared) => exc
                .type_of
                .is_some_and(|raised| oracle.is_subtype(raised, declared)),
        }
    }
}

/// Completion hook of a synthetic service-entry frame: posts the response
/// (or routes an unhandled exception) once the proto-frame unwinds.
pub type ProtoHook = Box<dyn FnOnce(&mut Exec<'_>, &mut Frame, Option<VmException>)>;

/// One-shot construction-finalizer anchor.
///
/// Shared between the primary-constructor frame and the default-constructor
/// chain: each constructor registers its finalizer as it completes, and the
/// whole set runs in reverse registration order when the anchored frame
/// unwinds (on either path). The primary constructor's own finalizer is
/// anchored at the leaf so it runs first.
#[derive(Clone, Default)]
pub struct FinalizerAnchor(Rc<RefCell<AnchorState>>);

#[derive(Default)]
struct AnchorState {
    chain: Vec<FnHandle>,
    leaf: Option<FnHandle>,
}

impl FinalizerAnchor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a superclass finalizer (runs after the leaf).
    pub fn chain(&self, finalizer: FnHandle) {
        self.0.borrow_mut().chain.push(finalizer);
    }

    /// Anchors the leaf finalizer.
    pub fn anchor_leaf(&self, finalizer: FnHandle) {
        self.0.borrow_mut().leaf = Some(finalizer);
    }

    /// Drains every registered finalizer in registration order (callers
    /// execute from the back).
    pub fn drain(&self) -> Vec<FnHandle> {
        let mut state = self.0.borrow_mut();
        let mut fns = std::mem::take(&mut state.chain);
        fns.extend(state.leaf.take());
        fns
    }

    pub fn is_empty(&self) -> bool {
        let state = self.0.borrow();
        state.chain.is_empty() && state.leaf.is_none()
    }
}

/// One activation record.
pub struct Frame {
    /// Method name, for diagnostics.
    pub name: String,
    /// Op vector being executed.
    pub ops: Arc<[Op]>,
    /// Program counter.
    pub pc: usize,
    /// Argument/variable/return slots, sized to the body's max-vars.
    pub slots: Vec<Option<Value>>,
    /// Per-slot metadata, parallel to `slots`.
    pub var_info: Vec<VarInfo>,
    /// Where this frame's return flows in the caller.
    pub ret: RetSlot,
    /// Frame-local stack for intermediate results.
    pub stack: Vec<Value>,
    /// Pending exception (at most one).
    pub exception: Option<VmException>,
    /// Active guarded regions, innermost last.
    pub guards: SmallVec<[Arc<GuardDef>; 2]>,
    /// Continuation chain run when this frame completes normally.
    pub continuation: Option<ContinuationChain>,
    /// Callee staged by a `Call` outcome.
    pub next_frame: Option<Box<Frame>>,
    /// One-shot finalizer anchor used by the construction pipeline;
    /// entries run in reverse registration order.
    pub finalizers: FinalizerAnchor,
    /// Scoped-finalizer chain; entries run in reverse registration order
    /// on both unwind paths.
    pub cleanups: Vec<FnHandle>,
    /// Completion hook of a proto-frame.
    pub on_complete: Option<ProtoHook>,
}

impl Frame {
    /// Creates a frame for an interpreted body, filling leading slots from
    /// the argument vector.
    pub fn for_body(body: &Arc<MethodBody>, args: ArgVec, ret: RetSlot) -> Self {
        let mut slots: Vec<Option<Value>> = Vec::with_capacity(body.max_vars);
        slots.extend(args);
        slots.resize(body.max_vars, None);
        let var_info = vec![VarInfo::plain(TypeId::new(0)); body.max_vars];
        Self {
            name: body.name.clone(),
            ops: Arc::clone(&body.ops),
            pc: 0,
            slots,
            var_info,
            ret,
            stack: Vec::new(),
            exception: None,
            guards: SmallVec::new(),
            continuation: None,
            next_frame: None,
            finalizers: FinalizerAnchor::new(),
            cleanups: Vec::new(),
            on_complete: None,
        }
    }

    /// Creates a synthetic frame over a native op vector.
    pub fn synthetic(name: impl Into<String>, ops: Arc<[Op]>, var_count: usize, ret: RetSlot) -> Self {
        Self {
            name: name.into(),
            ops,
            pc: 0,
            slots: vec![None; var_count],
            var_info: vec![VarInfo::plain(TypeId::new(0)); var_count],
            ret,
            stack: Vec::new(),
            exception: None,
            guards: SmallVec::new(),
            continuation: None,
            next_frame: None,
            finalizers: FinalizerAnchor::new(),
            cleanups: Vec::new(),
            on_complete: None,
        }
    }

    /// Marks slot `i` as a dynamic reference backed by `future`.
    pub fn introduce_dynamic(&mut self, i: usize, future: FutureCell) {
        self.var_info[i].dynamic = true;
        self.slots[i] = Some(Value::Future(future));
    }

    /// Reads argument slot `i`, dereferencing dynamic references.
    ///
    /// `Ok(None)` means the slot's future has not materialized yet (the op
    /// should report `Repeat`). An unassigned or still-deferred slot is an
    /// engine fault: deferred placeholders must be resolved before an op
    /// observes the slot.
    pub fn get_argument(&self, i: usize) -> Result<Option<ObjHandle>, VmException> {
        match self.slots.get(i).and_then(Option::as_ref) {
            None => Err(VmException::fault(
                ExcKind::Unsupported,
                format!("unassigned slot {i} in `{}`", self.name),
            )),
            Some(Value::Obj(h)) => Ok(Some(h.clone())),
            Some(Value::Future(cell)) => match cell.peek() {
                None => Ok(None),
                Some(Ok(h)) => Ok(Some(h)),
                Some(Err(exc)) => Err(exc),
            },
            Some(Value::Deferred(_)) => Err(VmException::fault(
                ExcKind::Unsupported,
                format!("unresolved deferred in slot {i} of `{}`", self.name),
            )),
        }
    }

    /// Assigns a resolved handle into slot `i`. Assigning into a dynamic
    /// reference completes its future instead of replacing the slot.
    pub fn assign_slot(&mut self, i: usize, value: ObjHandle) -> OpResult {
        if self.var_info[i].dynamic
            && let Some(Value::Future(cell)) = &self.slots[i]
        {
            cell.complete(value);
            return OpResult::Next;
        }
        self.slots[i] = Some(Value::Obj(value));
        OpResult::Next
    }

    /// Routes a result into this frame per a scalar destination.
    pub fn assign(&mut self, dst: &RetSlot, value: ObjHandle) -> OpResult {
        match dst {
            RetSlot::Discard => OpResult::Next,
            RetSlot::Stack => {
                self.stack.push(Value::Obj(value));
                OpResult::Next
            }
            RetSlot::Slot(i) => self.assign_slot(*i as usize, value),
            RetSlot::Tuple(_) | RetSlot::Multi(_) | RetSlot::Cond(_) => self.raise(VmException::fault(
                ExcKind::Unsupported,
                "scalar assignment into a multi-return destination",
            )),
        }
    }

    /// Sets the pending exception and reports it.
    pub fn raise(&mut self, exc: VmException) -> OpResult {
        self.exception = Some(exc);
        OpResult::Exception
    }

    /// Convenience: raise a kind with a message.
    pub fn raise_msg(&mut self, kind: ExcKind, message: impl Into<String>) -> OpResult {
        self.raise(VmException::new(kind, message))
    }

    pub fn push_stack(&mut self, value: Value) {
        self.stack.push(value);
    }

    /// Pops the top of the frame-local stack as a resolved handle.
    pub fn pop_stack(&mut self) -> Option<ObjHandle> {
        self.stack.pop().and_then(Value::into_obj)
    }

    /// Appends a continuation step to run when this frame completes.
    pub fn add_continuation(&mut self, step: Box<dyn crate::vm::deferred::Continuation>) {
        match &mut self.continuation {
            Some(chain) => chain.add(step),
            None => self.continuation = Some(ContinuationChain::new(step)),
        }
    }

    /// Registers a superclass construction finalizer on this frame's
    /// anchor.
    pub fn chain_finalizer(&mut self, finalizer: FnHandle) {
        self.finalizers.chain(finalizer);
    }

    /// Registers a scoped finalizer.
    pub fn defer_cleanup(&mut self, cleanup: FnHandle) {
        self.cleanups.push(cleanup);
    }

    /// Finds the innermost live guard matching `exc`; pops it and every
    /// guard above it. Returns the handler pc and capture slot.
    pub fn find_guard(&mut self, exc: &VmException, oracle: &dyn TypeOracle) -> Option<(usize, Option<u16>)> {
        let idx = self.guards.iter().rposition(|g| g.matches(exc, oracle))?;
        let guard = Arc::clone(&self.guards[idx]);
        self.guards.truncate(idx);
        Some((guard.handler_pc, guard.capture))
    }

    /// Revalidates dynamic-reference slots for a `Waiting` fiber.
    ///
    /// `Block` when at least one future is still pending; `Exception` when
    /// one has faulted (the exception becomes pending on this frame);
    /// `Next` when every waited slot is ready.
    pub fn check_waiting_slots(&mut self) -> OpResult {
        let mut failed: Option<VmException> = None;
        for (i, slot) in self.slots.iter().enumerate() {
            if !self.var_info[i].dynamic {
                continue;
            }
            if let Some(Value::Future(cell)) = slot {
                match cell.peek() {
                    None => return OpResult::Block,
                    Some(Err(exc)) if failed.is_none() => failed = Some(exc),
                    Some(_) => {}
                }
            }
        }
        match failed {
            Some(exc) => self.raise(exc),
            None => OpResult::Next,
        }
    }

    /// Fails every still-pending dynamic reference with a copy of `exc`.
    ///
    /// Used on deadline expiry so a late response finds the future already
    /// completed and is dropped.
    pub fn fail_pending_slots(&mut self, exc: &VmException) {
        for (i, slot) in self.slots.iter().enumerate() {
            if !self.var_info[i].dynamic {
                continue;
            }
            if let Some(Value::Future(cell)) = slot
                && !cell.is_done()
            {
                cell.fail(exc.clone());
            }
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("name", &self.name)
            .field("pc", &self.pc)
            .field("slots", &self.slots.len())
            .field("guards", &self.guards.len())
            .field("exception", &self.exception)
            .finish()
    }
}

/// The dispatch loop's view of a fiber's frame stack.
///
/// Owns the cross-frame operations: splicing callees, popping completed
/// frames, and routing return values into the caller.
pub struct FrameStack<'a> {
    frames: &'a mut Vec<Frame>,
}

impl<'a> FrameStack<'a> {
    pub fn new(frames: &'a mut Vec<Frame>) -> Self {
        Self { frames }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// The currently executing frame.
    pub fn cur(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("empty frame stack")
    }

    pub fn cur_ref(&self) -> &Frame {
        self.frames.last().expect("empty frame stack")
    }

    /// The current frame and its caller, when one exists.
    pub fn top_and_caller(&mut self) -> (&mut Frame, Option<&mut Frame>) {
        let len = self.frames.len();
        if len < 2 {
            let (frame, _) = self.frames.split_last_mut().expect("empty frame stack");
            (frame, None)
        } else {
            let (top, rest) = self.frames.split_last_mut().expect("empty frame stack");
            (top, rest.last_mut())
        }
    }

    pub fn push(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    pub fn pop(&mut self) -> Frame {
        self.frames.pop().expect("empty frame stack")
    }

    /// Stages `callee` on the current frame and reports `Call`.
    pub fn call(&mut self, callee: Frame) -> OpResult {
        self.cur().next_frame = Some(Box::new(callee));
        OpResult::Call
    }

    /// Routes a single return value from the current frame into its caller
    /// per the frame's return destination.
    ///
    /// `dynamic` returns deliver the raw future into the caller's slot
    /// instead of the materialized value.
    pub fn return_value(&mut self, value: ObjHandle, dynamic: bool) -> OpResult {
        let ret = self.cur().ret.clone();
        let (top, caller) = self.top_and_caller();
        let Some(caller) = caller else {
            // Proto-frames collect into their own slots and return unused.
            return OpResult::Return;
        };
        match &ret {
            RetSlot::Discard => OpResult::Return,
            RetSlot::Stack => {
                caller.stack.push(Value::Obj(value));
                OpResult::Return
            }
            RetSlot::Slot(i) => {
                let i = *i as usize;
                if dynamic && let Payload::Future(cell) = value.payload() {
                    caller.var_info[i].dynamic = true;
                    caller.slots[i] = Some(Value::Future(cell.clone()));
                    return OpResult::Return;
                }
                match caller.assign_slot(i, value) {
                    OpResult::Next => OpResult::Return,
                    other => other,
                }
            }
            RetSlot::Tuple(i) => {
                let tuple = ObjHandle::new(crate::container::builtin::TUPLE, Payload::Tuple(vec![value]));
                match caller.assign_slot(*i as usize, tuple) {
                    OpResult::Next => OpResult::Return,
                    other => other,
                }
            }
            RetSlot::Cond(slots) => {
                // Conditional-return adapter: a single natural value arrives
                // in a two-slot conditional receiver as `true` + the value.
                if slots.len() != 2 {
                    top.exception = Some(VmException::fault(
                        ExcKind::Unsupported,
                        "conditional receiver must declare two slots",
                    ));
                    return OpResult::ReturnException;
                }
                let truth = ObjHandle::new(
                    crate::container::builtin::BOOL,
                    Payload::Native(crate::value::NativeValue::Bool(true)),
                );
                caller.assign_slot(slots[0] as usize, truth);
                match caller.assign_slot(slots[1] as usize, value) {
                    OpResult::Next => OpResult::Return,
                    other => other,
                }
            }
            RetSlot::Multi(_) => {
                top.exception = Some(VmException::fault(
                    ExcKind::Unsupported,
                    "single return into a multi-return receiver",
                ));
                OpResult::ReturnException
            }
        }
    }

    /// Routes multiple return values from the current frame into its
    /// caller.
    pub fn return_values(&mut self, values: Vec<ObjHandle>) -> OpResult {
        let ret = self.cur().ret.clone();
        let (top, caller) = self.top_and_caller();
        let Some(caller) = caller else {
            return OpResult::Return;
        };
        match &ret {
            RetSlot::Discard => OpResult::Return,
            RetSlot::Tuple(i) => {
                let tuple = ObjHandle::new(crate::container::builtin::TUPLE, Payload::Tuple(values));
                match caller.assign_slot(*i as usize, tuple) {
                    OpResult::Next => OpResult::Return,
                    other => other,
                }
            }
            RetSlot::Multi(slots) | RetSlot::Cond(slots) => {
                if slots.len() != values.len() {
                    top.exception = Some(VmException::fault(
                        ExcKind::Unsupported,
                        format!("return arity mismatch: {} values into {} slots", values.len(), slots.len()),
                    ));
                    return OpResult::ReturnException;
                }
                for (slot, value) in slots.iter().zip(values) {
                    caller.assign_slot(*slot as usize, value);
                }
                OpResult::Return
            }
            RetSlot::Stack | RetSlot::Slot(_) => {
                top.exception = Some(VmException::fault(
                    ExcKind::Unsupported,
                    "multiple returns into a scalar receiver",
                ));
                OpResult::ReturnException
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composition::CompositionId;
    use crate::value::NativeValue;

    fn handle(i: i64) -> ObjHandle {
        ObjHandle::new(CompositionId::new(0), Payload::Native(NativeValue::Int(i)))
    }

    fn empty_frame(vars: usize, ret: RetSlot) -> Frame {
        Frame::synthetic("test", Arc::from(vec![Op::Return0]), vars, ret)
    }

    #[test]
    fn dynamic_slot_assignment_completes_future() {
        let mut frame = empty_frame(1, RetSlot::Discard);
        let cell = FutureCell::new();
        frame.introduce_dynamic(0, cell.clone());
        assert!(matches!(frame.get_argument(0), Ok(None)));
        frame.assign_slot(0, handle(5));
        assert_eq!(cell.peek().unwrap().unwrap().as_int(), Some(5));
        assert_eq!(frame.get_argument(0).unwrap().unwrap().as_int(), Some(5));
    }

    #[test]
    fn waiting_revalidation_reports_block_then_next() {
        let mut frame = empty_frame(2, RetSlot::Discard);
        let a = FutureCell::new();
        let b = FutureCell::new();
        frame.introduce_dynamic(0, a.clone());
        frame.introduce_dynamic(1, b.clone());
        assert_eq!(frame.check_waiting_slots(), OpResult::Block);
        a.complete(handle(1));
        assert_eq!(frame.check_waiting_slots(), OpResult::Block);
        b.complete(handle(2));
        assert_eq!(frame.check_waiting_slots(), OpResult::Next);
    }

    #[test]
    fn waiting_revalidation_routes_faults() {
        let mut frame = empty_frame(1, RetSlot::Discard);
        let cell = FutureCell::new();
        frame.introduce_dynamic(0, cell.clone());
        cell.fail(VmException::of(ExcKind::Bounds));
        assert_eq!(frame.check_waiting_slots(), OpResult::Exception);
        assert_eq!(frame.exception.as_ref().unwrap().kind, ExcKind::Bounds);
    }

    #[test]
    fn conditional_receiver_synthesizes_true_tag() {
        let mut frames = vec![
            empty_frame(3, RetSlot::Discard),
            empty_frame(0, RetSlot::Cond(SlotVecHelper::pair(0, 1))),
        ];
        let mut st = FrameStack::new(&mut frames);
        let outcome = st.return_value(handle(9), false);
        assert_eq!(outcome, OpResult::Return);
        let caller = &frames[0];
        let tag = caller.slots[0].as_ref().unwrap().as_obj().unwrap().as_bool();
        let val = caller.slots[1].as_ref().unwrap().as_obj().unwrap().as_int();
        assert_eq!(tag, Some(true));
        assert_eq!(val, Some(9));
    }

    #[test]
    fn guard_matching_pops_covered_guards() {
        let mut frame = empty_frame(1, RetSlot::Discard);
        frame.guards.push(Arc::new(GuardDef {
            matcher: GuardMatcher::Kind(ExcKind::Bounds),
            handler_pc: 4,
            capture: Some(0),
        }));
        frame.guards.push(Arc::new(GuardDef {
            matcher: GuardMatcher::Kind(ExcKind::Timeout),
            handler_pc: 8,
            capture: None,
        }));
        let oracle = crate::composition::SubtypeTable::new();
        let exc = VmException::of(ExcKind::Bounds);
        let (pc, capture) = frame.find_guard(&exc, &oracle).unwrap();
        assert_eq!(pc, 4);
        assert_eq!(capture, Some(0));
        assert!(frame.guards.is_empty());
    }

    /// Small helper because `SlotVec` literals are noisy in tests.
    struct SlotVecHelper;
    impl SlotVecHelper {
        fn pair(a: u16, b: u16) -> crate::op::SlotVec {
            crate::op::SlotVec::from_iter([a, b])
        }
    }
}
