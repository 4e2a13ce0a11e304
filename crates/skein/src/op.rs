//! The op set and the outcome protocol.
//!
//! Ops never throw to the interpreter; they *report* through [`OpResult`].
//! Only the dispatch loop manipulates frame and exception state in response.
//! The set below is the closed skeleton the interpreter itself recognizes;
//! everything richer is an external opcode that lowers onto these shapes or
//! a registered native handler.

use std::{fmt, rc::Rc, sync::Arc};

use smallvec::SmallVec;

use crate::{
    composition::{ClassId, MethodId, PropertyId, TypeId},
    frame::{FrameStack, GuardDef},
    value::{ArgVec, ObjHandle},
    vm::Exec,
};

/// Slot-index operand lists.
pub type SlotVec = SmallVec<[u16; 4]>;

/// Where a result flows.
///
/// `Slot`/`Stack`/`Discard` are the scalar cases; `Tuple` packs multiple
/// returns into one tuple handle; `Multi` spreads them across slots; `Cond`
/// is a boolean-tagged multi-return — when the callee returns a single
/// value, the conditional-return adapter synthesizes `true` ahead of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetSlot {
    /// Drop the result.
    Discard,
    /// Push the result onto the receiving frame's local stack.
    Stack,
    /// Assign the result to the given slot.
    Slot(u16),
    /// Pack multiple returns into a tuple assigned to the given slot.
    Tuple(u16),
    /// Spread multiple returns across the given slots.
    Multi(SlotVec),
    /// Boolean-tagged multi-return (conditional receiver).
    Cond(SlotVec),
}

/// Outcome reported by every op (and every continuation step).
///
/// `Jump` is the "branch to pc" outcome of conditional jumps; it is only
/// legal from an op or from the terminal step of a continuation chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpResult {
    /// Advance the program counter and continue.
    Next,
    /// A callee frame was staged at `next_frame`; switch to it.
    Call,
    /// Unwind the current frame, running its continuation.
    Return,
    /// Like `Return`, but the fiber enters `Waiting` first.
    BlockReturn,
    /// A pending exception was set on the frame; search guards.
    Exception,
    /// Propagate the pending exception after unwinding one frame.
    ReturnException,
    /// Re-execute the current op on the next scheduling tick.
    Repeat,
    /// Suspend the fiber in `Waiting`; resume at the next op.
    Block,
    /// Cooperative yield; resume at the next op.
    Yield,
    /// Branch to the given program counter.
    Jump(usize),
}

/// A synthetic native op, used by proto-frames and wait frames.
#[derive(Clone)]
pub struct NativeOp {
    name: &'static str,
    run: Rc<dyn Fn(&mut Exec<'_>, &mut FrameStack<'_>) -> OpResult>,
}

impl NativeOp {
    pub fn new(name: &'static str, run: impl Fn(&mut Exec<'_>, &mut FrameStack<'_>) -> OpResult + 'static) -> Self {
        Self { name, run: Rc::new(run) }
    }

    #[inline]
    pub fn run(&self, cx: &mut Exec<'_>, st: &mut FrameStack<'_>) -> OpResult {
        (self.run)(cx, st)
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for NativeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeOp({})", self.name)
    }
}

/// Signature of a native method handler registered on a composition.
///
/// Handlers receive the resolved target and arguments and obey the same
/// outcome protocol as interpreted bodies.
pub type NativeMethod =
    fn(cx: &mut Exec<'_>, st: &mut FrameStack<'_>, target: Option<ObjHandle>, args: ArgVec, ret: RetSlot) -> OpResult;

/// The closed op set.
#[derive(Debug, Clone)]
pub enum Op {
    Nop,
    /// Load a constant-pool entry. Singleton constants may resolve to a
    /// deferred placeholder that initializes on first use.
    LoadConst { pool: u32, dst: RetSlot },
    /// Copy a slot value.
    Move { src: u16, dst: RetSlot },
    /// Unconditional branch.
    Jump(usize),
    JumpIfTrue { cond: u16, target: usize },
    JumpIfFalse { cond: u16, target: usize },
    /// Invoke the callable held in `callee`.
    CallFn { callee: u16, args: SlotVec, ret: RetSlot },
    /// Invoke a method on the value in `target`; routes cross-service when
    /// the target is a service reference owned by another context.
    CallMethod { target: u16, method: MethodId, args: SlotVec, ret: RetSlot },
    /// Run the construction pipeline for `class` with primary constructor
    /// `ctor`.
    New { class: ClassId, ctor: MethodId, args: SlotVec, ret: RetSlot },
    GetProp { target: u16, prop: PropertyId, dst: RetSlot },
    SetProp { target: u16, prop: PropertyId, src: u16 },
    /// Pre-/post-increment of a property, via the in-place driver.
    IncProp { target: u16, prop: PropertyId, post: bool, dst: RetSlot },
    /// Pre-/post-decrement of a property, via the in-place driver.
    DecProp { target: u16, prop: PropertyId, post: bool, dst: RetSlot },
    /// Equality under two declared types (second consulted only when the
    /// first reports equal).
    IsEq { left: u16, right: u16, types: (TypeId, TypeId), dst: RetSlot },
    /// Ordering under two declared types (second tie-breaks).
    Cmp { left: u16, right: u16, types: (TypeId, TypeId), dst: RetSlot },
    /// Raise `AssertionFailed` when the slot holds false (subject to the
    /// configured assert severity).
    Assert { cond: u16 },
    /// Raise the exception carried by the slot value.
    Throw { src: u16 },
    /// Open a guarded region.
    GuardStart(Arc<GuardDef>),
    /// Close the innermost guarded region.
    GuardEnd,
    /// Register a scoped finalizer: `method` will be invoked on the slot's
    /// value when the frame unwinds, on both paths.
    Defer { src: u16, method: MethodId },
    Return0,
    Return1 { src: u16 },
    ReturnN { srcs: SlotVec },
    Yield,
    /// A synthetic native op (proto-frame invoke, wait-frame drain).
    Native(NativeOp),
}

impl Op {
    /// Branch targets referenced by this op, for load-time validation.
    pub fn jump_targets(&self) -> SmallVec<[usize; 2]> {
        match self {
            Self::Jump(target)
            | Self::JumpIfTrue { target, .. }
            | Self::JumpIfFalse { target, .. } => SmallVec::from_iter([*target]),
            Self::GuardStart(guard) => SmallVec::from_iter([guard.handler_pc]),
            _ => SmallVec::new(),
        }
    }

    /// Constant-pool index referenced by this op, for load-time validation.
    pub fn constant_ref(&self) -> Option<u32> {
        match self {
            Self::LoadConst { pool, .. } => Some(*pool),
            _ => None,
        }
    }

    /// Stable name for tracing.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Nop => "Nop",
            Self::LoadConst { .. } => "LoadConst",
            Self::Move { .. } => "Move",
            Self::Jump(_) => "Jump",
            Self::JumpIfTrue { .. } => "JumpIfTrue",
            Self::JumpIfFalse { .. } => "JumpIfFalse",
            Self::CallFn { .. } => "CallFn",
            Self::CallMethod { .. } => "CallMethod",
            Self::New { .. } => "New",
            Self::GetProp { .. } => "GetProp",
            Self::SetProp { .. } => "SetProp",
            Self::IncProp { .. } => "IncProp",
            Self::DecProp { .. } => "DecProp",
            Self::IsEq { .. } => "IsEq",
            Self::Cmp { .. } => "Cmp",
            Self::Assert { .. } => "Assert",
            Self::Throw { .. } => "Throw",
            Self::GuardStart(_) => "GuardStart",
            Self::GuardEnd => "GuardEnd",
            Self::Defer { .. } => "Defer",
            Self::Return0 => "Return0",
            Self::Return1 { .. } => "Return1",
            Self::ReturnN { .. } => "ReturnN",
            Self::Yield => "Yield",
            Self::Native(op) => op.name(),
        }
    }
}
