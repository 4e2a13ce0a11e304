//! Deferred-value machinery.
//!
//! Any argument slot may temporarily hold a deferred placeholder. The
//! helpers here resolve placeholders in place before an operation proceeds,
//! threading `Call`/`Exception` outcomes through continuations so native
//! operations compose with interpreted control flow without blocking.
//!
//! Continuations carry shared (`Rc`) state: when a step causes a call, the
//! driver attaches a clone of itself to the callee and resumes from the
//! same state once the callee completes. Resolution never blocks another
//! fiber — it either completes synchronously or reports `Call`.

use std::{cell::RefCell, rc::Rc, sync::Arc};

use crate::{
    container::builtin,
    exception::{ExcKind, VmException},
    frame::{Frame, FrameStack},
    op::{NativeOp, Op, OpResult, RetSlot, SlotVec},
    value::{ArgVec, FnHandle, FutureCell, ObjHandle, Payload, Value},
    vm::Exec,
};

/// One resumable step of deferred work.
pub trait Continuation {
    fn proceed(&mut self, cx: &mut Exec<'_>, st: &mut FrameStack<'_>) -> OpResult;
}

impl<F> Continuation for F
where
    F: FnMut(&mut Exec<'_>, &mut FrameStack<'_>) -> OpResult,
{
    fn proceed(&mut self, cx: &mut Exec<'_>, st: &mut FrameStack<'_>) -> OpResult {
        self(cx, st)
    }
}

struct ChainState {
    steps: Vec<Option<Box<dyn Continuation>>>,
    pos: usize,
}

/// An ordered list of continuations executed in sequence.
///
/// `Call` outcomes re-attach the chain to the callee so the remaining steps
/// run after it completes. If a step's callee installs its own
/// continuation, that inner chain is spliced in at the current position so
/// it runs to completion before the outer chain resumes.
///
/// Terminal outcomes (`Return`, `ReturnException`, `BlockReturn`, `Jump`)
/// stop the chain and are handed back to the dispatcher; `Jump` is only
/// legal from the final step.
#[derive(Clone)]
pub struct ContinuationChain {
    state: Rc<RefCell<ChainState>>,
}

impl ContinuationChain {
    pub fn new(step: Box<dyn Continuation>) -> Self {
        Self {
            state: Rc::new(RefCell::new(ChainState {
                steps: vec![Some(step)],
                pos: 0,
            })),
        }
    }

    /// Appends a step.
    pub fn add(&self, step: Box<dyn Continuation>) {
        self.state.borrow_mut().steps.push(Some(step));
    }

    /// Inserts a step to run before the remaining ones.
    pub fn prepend(&self, step: Box<dyn Continuation>) {
        let mut state = self.state.borrow_mut();
        let pos = state.pos;
        state.steps.insert(pos, Some(step));
    }

    /// Runs steps until one defers or the chain is exhausted.
    pub fn proceed(&mut self, cx: &mut Exec<'_>, st: &mut FrameStack<'_>) -> OpResult {
        loop {
            let (mut step, pos) = {
                let mut state = self.state.borrow_mut();
                let pos = state.pos;
                if pos >= state.steps.len() {
                    return OpResult::Next;
                }
                (state.steps[pos].take().expect("chain step in flight"), pos)
            };
            let result = step.proceed(cx, st);
            self.state.borrow_mut().steps[pos] = Some(step);
            match result {
                OpResult::Next => {
                    self.state.borrow_mut().pos += 1;
                }
                OpResult::Call => {
                    let callee = st
                        .cur()
                        .next_frame
                        .as_mut()
                        .expect("Call outcome without a staged callee");
                    if let Some(inner) = callee.continuation.take() {
                        // The step's callee has its own continuations; they
                        // must run before our chain resumes. Splice the
                        // inner chain in at the current position.
                        self.state.borrow_mut().steps[pos] = Some(Box::new(inner));
                    } else {
                        self.state.borrow_mut().pos += 1;
                    }
                    callee.add_continuation(Box::new(self.clone()));
                    return OpResult::Call;
                }
                OpResult::Exception => return OpResult::Exception,
                OpResult::Jump(target) => {
                    // Only the very last continuation may branch.
                    debug_assert_eq!(pos + 1, self.state.borrow().steps.len());
                    return OpResult::Jump(target);
                }
                OpResult::Return | OpResult::BlockReturn | OpResult::ReturnException => return result,
                OpResult::Repeat | OpResult::Block | OpResult::Yield => {
                    return st.cur().raise(VmException::fault(
                        ExcKind::Unsupported,
                        "continuation reported a scheduling outcome",
                    ));
                }
            }
        }
    }
}

impl Continuation for ContinuationChain {
    fn proceed(&mut self, cx: &mut Exec<'_>, st: &mut FrameStack<'_>) -> OpResult {
        ContinuationChain::proceed(self, cx, st)
    }
}

/// Tail continuation invoked with the fully resolved argument vector.
pub type ArgsThen = Box<dyn FnOnce(&mut Exec<'_>, &mut FrameStack<'_>, ArgVec) -> OpResult>;

struct GetArgsState {
    args: ArgVec,
    index: usize,
    then: Option<ArgsThen>,
}

/// Walks an argument vector, resolving each deferred entry in place; when
/// every entry is resolved the tail continuation runs. Empty (`None`)
/// entries terminate the walk — they may only appear at the tail.
#[derive(Clone)]
struct GetArguments {
    state: Rc<RefCell<GetArgsState>>,
}

impl GetArguments {
    fn do_next(&self, cx: &mut Exec<'_>, st: &mut FrameStack<'_>) -> OpResult {
        let deferred = {
            let mut state = self.state.borrow_mut();
            let mut found = None;
            while state.index < state.args.len() {
                match &state.args[state.index] {
                    None => {
                        // Nulls can only be at the tail of the vector.
                        state.index = state.args.len();
                        break;
                    }
                    Some(Value::Deferred(deferred)) => {
                        found = Some(deferred.clone());
                        break;
                    }
                    Some(_) => state.index += 1,
                }
            }
            found
        };
        match deferred {
            Some(deferred) => {
                let Some(mut frame) = deferred.take_frame() else {
                    return st.cur().raise(VmException::fault(
                        ExcKind::Unsupported,
                        "deferred placeholder resolved twice",
                    ));
                };
                frame.add_continuation(Box::new(self.clone()));
                st.call(frame)
            }
            None => {
                let (args, then) = {
                    let mut state = self.state.borrow_mut();
                    (std::mem::take(&mut state.args), state.then.take().expect("tail continuation"))
                };
                then(cx, st, args)
            }
        }
    }
}

impl Continuation for GetArguments {
    fn proceed(&mut self, cx: &mut Exec<'_>, st: &mut FrameStack<'_>) -> OpResult {
        // The resolver frame left the real handle on our frame's stack.
        let Some(value) = st.cur().pop_stack() else {
            return st.cur().raise(VmException::fault(
                ExcKind::Unsupported,
                "deferred resolver produced no value",
            ));
        };
        {
            let mut state = self.state.borrow_mut();
            let index = state.index;
            state.args[index] = Some(Value::Obj(value));
            state.index += 1;
        }
        self.do_next(cx, st)
    }
}

/// Resolves every deferred entry of `args`, then runs `then`.
///
/// The common case — no deferred entries — runs `then` synchronously.
pub fn resolve_args(cx: &mut Exec<'_>, st: &mut FrameStack<'_>, args: ArgVec, then: ArgsThen) -> OpResult {
    let has_deferred = args.iter().flatten().any(Value::is_deferred);
    if !has_deferred {
        return then(cx, st, args);
    }
    let driver = GetArguments {
        state: Rc::new(RefCell::new(GetArgsState {
            args,
            index: 0,
            then: Some(then),
        })),
    };
    driver.do_next(cx, st)
}

/// Assigns a (possibly deferred) value into a scalar destination of the
/// current frame. The deferred-tolerant single-value form used by native
/// code.
pub fn assign_resolved(cx: &mut Exec<'_>, st: &mut FrameStack<'_>, dst: RetSlot, value: Value) -> OpResult {
    match value {
        Value::Obj(handle) => st.cur().assign(&dst, handle),
        Value::Future(cell) => match cell.peek() {
            Some(Ok(handle)) => st.cur().assign(&dst, handle),
            Some(Err(exc)) => st.cur().raise(exc),
            None => st.call(wait_frame(&cell, dst)),
        },
        Value::Deferred(_) => {
            let args = ArgVec::from_iter([Some(value)]);
            resolve_args(
                cx,
                st,
                args,
                Box::new(move |_, st, mut args| {
                    let handle = args[0].take().and_then(Value::into_obj).expect("resolved argument");
                    st.cur().assign(&dst, handle)
                }),
            )
        }
    }
}

/// Writes values into multiple slots of the current frame, resolving
/// deferred entries first.
pub fn assign_values(cx: &mut Exec<'_>, st: &mut FrameStack<'_>, targets: SlotVec, values: ArgVec) -> OpResult {
    resolve_args(
        cx,
        st,
        values,
        Box::new(move |_, st, values| {
            for (target, value) in targets.iter().zip(values) {
                let Some(handle) = value.and_then(Value::into_obj) else {
                    return st.cur().raise(VmException::fault(
                        ExcKind::Unsupported,
                        "missing value in multi-assignment",
                    ));
                };
                match st.cur().assign_slot(*target as usize, handle) {
                    OpResult::Next => {}
                    other => return other,
                }
            }
            OpResult::Next
        }),
    )
}

/// Returns multiple values out of the current frame, resolving deferred
/// entries first. Futures must already be materialized (the caller reports
/// `Repeat` otherwise).
pub fn return_resolved(cx: &mut Exec<'_>, st: &mut FrameStack<'_>, values: ArgVec) -> OpResult {
    resolve_args(
        cx,
        st,
        values,
        Box::new(move |_, st, values| {
            let mut handles = Vec::with_capacity(values.len());
            for value in values {
                match value {
                    Some(Value::Obj(handle)) => handles.push(handle),
                    Some(Value::Future(cell)) => match cell.peek() {
                        Some(Ok(handle)) => handles.push(handle),
                        Some(Err(exc)) => return st.cur().raise(exc),
                        None => {
                            return st.cur().raise(VmException::fault(
                                ExcKind::Unsupported,
                                "unmaterialized future in return",
                            ));
                        }
                    },
                    _ => {
                        return st.cur().raise(VmException::fault(
                            ExcKind::Unsupported,
                            "missing value in multi-return",
                        ));
                    }
                }
            }
            st.return_values(handles)
        }),
    )
}

/// Adapts a natural single-value execution to a caller that declared a
/// conditional (boolean-tagged) two-slot return.
///
/// The three dispatch outcomes map exactly: `Next` assigns immediately,
/// `Call` attaches a continuation that assigns on completion, `Exception`
/// propagates.
pub fn assign_conditional_result(
    cx: &mut Exec<'_>,
    st: &mut FrameStack<'_>,
    result: OpResult,
    targets: SlotVec,
) -> OpResult {
    fn assign_pair(cx: &mut Exec<'_>, st: &mut FrameStack<'_>, targets: &SlotVec) -> OpResult {
        let Some(value) = st.cur().pop_stack() else {
            return st.cur().raise(VmException::fault(
                ExcKind::Unsupported,
                "conditional adapter found no value on the stack",
            ));
        };
        let truth = cx.container.bool_handle(true);
        st.cur().assign_slot(targets[0] as usize, truth);
        st.cur().assign_slot(targets[1] as usize, value)
    }

    match result {
        OpResult::Next => assign_pair(cx, st, &targets),
        OpResult::Call => {
            let callee = st
                .cur()
                .next_frame
                .as_mut()
                .expect("Call outcome without a staged callee");
            callee.add_continuation(Box::new(move |cx: &mut Exec<'_>, st: &mut FrameStack<'_>| {
                assign_pair(cx, st, &targets)
            }));
            OpResult::Call
        }
        OpResult::Exception => OpResult::Exception,
        other => st.cur().raise(VmException::fault(
            ExcKind::Unsupported,
            format!("conditional adapter cannot map {other:?}"),
        )),
    }
}

/// Drives scoped finalizers (and construction finalizers) in reverse
/// registration order, threading `Call` outcomes; once the list is drained
/// it re-raises a pending exception, if one was being unwound.
#[derive(Clone)]
pub struct CleanupDriver {
    state: Rc<RefCell<CleanupState>>,
}

struct CleanupState {
    /// Remaining cleanups; executed from the back.
    fns: Vec<FnHandle>,
    /// Exception to re-raise once every cleanup ran (unwind path).
    reraise: Option<VmException>,
}

impl CleanupDriver {
    pub fn new(fns: Vec<FnHandle>, reraise: Option<VmException>) -> Self {
        Self {
            state: Rc::new(RefCell::new(CleanupState { fns, reraise })),
        }
    }
}

impl Continuation for CleanupDriver {
    fn proceed(&mut self, cx: &mut Exec<'_>, st: &mut FrameStack<'_>) -> OpResult {
        loop {
            let next = self.state.borrow_mut().fns.pop();
            let Some(cleanup) = next else {
                return match self.state.borrow_mut().reraise.take() {
                    Some(exc) => st.cur().raise(exc),
                    None => OpResult::Next,
                };
            };
            match crate::vm::property::call_fn(cx, st, cleanup, ArgVec::new(), RetSlot::Discard) {
                OpResult::Next => {}
                OpResult::Call => {
                    let callee = st
                        .cur()
                        .next_frame
                        .as_mut()
                        .expect("Call outcome without a staged callee");
                    callee.add_continuation(Box::new(self.clone()));
                    return OpResult::Call;
                }
                // A throwing finalizer replaces the in-flight exception.
                OpResult::Exception => return OpResult::Exception,
                other => {
                    return st.cur().raise(VmException::fault(
                        ExcKind::Unsupported,
                        format!("finalizer reported {other:?}"),
                    ));
                }
            }
        }
    }
}

fn get_and_return_op() -> NativeOp {
    NativeOp::new("get-and-return", |_, st| {
        let count = st.cur().slots.len();
        if count == 1 {
            return match st.cur().get_argument(0) {
                Ok(None) => OpResult::Repeat,
                Ok(Some(handle)) => st.return_value(handle, false),
                Err(exc) => st.cur().raise(exc),
            };
        }
        let mut values = Vec::with_capacity(count);
        for i in 0..count {
            match st.cur().get_argument(i) {
                Ok(None) => return OpResult::Repeat,
                Ok(Some(handle)) => values.push(handle),
                Err(exc) => return st.cur().raise(exc),
            }
        }
        st.return_values(values)
    })
}

fn wait_ops() -> Arc<[Op]> {
    Arc::from(vec![Op::Native(get_and_return_op())])
}

/// A pseudo frame that waits on one future and returns its value into
/// `ret`.
pub fn wait_frame(future: &FutureCell, ret: RetSlot) -> Frame {
    let mut frame = Frame::synthetic("wait", wait_ops(), 1, ret);
    frame.introduce_dynamic(0, future.clone());
    frame
}

/// A pseudo frame that waits on an aggregate future carrying a tuple of
/// `count` values and spreads them into `ret`.
///
/// Each slot gets its own member future; the aggregate's completion splits
/// the tuple (or fans the failure out) into the members.
pub fn wait_frame_multi(aggregate: &FutureCell, count: usize, ret: RetSlot) -> Frame {
    let mut frame = Frame::synthetic("wait-multi", wait_ops(), count, ret);
    let members: Vec<FutureCell> = (0..count).map(|_| FutureCell::new()).collect();
    for (i, member) in members.iter().enumerate() {
        frame.introduce_dynamic(i, member.clone());
    }
    aggregate.when_done(Box::new(move |result| match result {
        Ok(handle) => match handle.payload() {
            Payload::Tuple(values) if values.len() == count => {
                for (member, value) in members.iter().zip(values) {
                    member.complete(value.clone());
                }
            }
            _ => {
                let exc = VmException::fault(ExcKind::Unsupported, "malformed multi-return response");
                for member in &members {
                    member.fail(exc.clone());
                }
            }
        },
        Err(exc) => {
            for member in &members {
                member.fail(exc.clone());
            }
        }
    }));
    frame
}

/// Wraps a raw future cell as a handle value.
pub fn future_handle(cell: FutureCell) -> ObjHandle {
    ObjHandle::new(builtin::FUTURE, Payload::Future(cell))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        composition::SubtypeTable,
        container::{Container, ExecOptions},
        image::ImageBuilder,
        tracer::NoopTracer,
        value::NativeValue,
    };

    fn test_container() -> Container {
        let image = ImageBuilder::new("test").build().unwrap();
        Container::new(image, Box::new(SubtypeTable::new()), ExecOptions::default()).unwrap()
    }

    fn int(value: i64) -> ObjHandle {
        ObjHandle::new(builtin::INT, Payload::Native(NativeValue::Int(value)))
    }

    #[test]
    fn conditional_adapter_maps_next_to_an_immediate_assign() {
        let container = test_container();
        let mut tracer = NoopTracer;
        let mut cx = Exec {
            container: &container,
            service: crate::service::ServiceId::new(0),
            fiber: None,
            tracer: &mut tracer,
        };
        let mut frames = vec![Frame::synthetic(
            "host",
            Arc::from(vec![Op::Return0]),
            2,
            RetSlot::Discard,
        )];
        let mut st = FrameStack::new(&mut frames);

        // The natural execution left its value on the stack.
        st.cur().push_stack(Value::Obj(int(31)));
        let outcome = assign_conditional_result(&mut cx, &mut st, OpResult::Next, SlotVec::from_iter([0, 1]));
        assert_eq!(outcome, OpResult::Next);
        assert_eq!(st.cur().get_argument(0).unwrap().unwrap().as_bool(), Some(true));
        assert_eq!(st.cur().get_argument(1).unwrap().unwrap().as_int(), Some(31));
    }

    #[test]
    fn conditional_adapter_propagates_exceptions() {
        let container = test_container();
        let mut tracer = NoopTracer;
        let mut cx = Exec {
            container: &container,
            service: crate::service::ServiceId::new(0),
            fiber: None,
            tracer: &mut tracer,
        };
        let mut frames = vec![Frame::synthetic(
            "host",
            Arc::from(vec![Op::Return0]),
            2,
            RetSlot::Discard,
        )];
        let mut st = FrameStack::new(&mut frames);
        let outcome = assign_conditional_result(&mut cx, &mut st, OpResult::Exception, SlotVec::from_iter([0, 1]));
        assert_eq!(outcome, OpResult::Exception);
        assert!(st.cur().slots[0].is_none());
        assert!(st.cur().slots[1].is_none());
    }

    #[test]
    fn assign_values_fills_every_target_slot() {
        let container = test_container();
        let mut tracer = NoopTracer;
        let mut cx = Exec {
            container: &container,
            service: crate::service::ServiceId::new(0),
            fiber: None,
            tracer: &mut tracer,
        };
        let mut frames = vec![Frame::synthetic(
            "host",
            Arc::from(vec![Op::Return0]),
            3,
            RetSlot::Discard,
        )];
        let mut st = FrameStack::new(&mut frames);
        let values = ArgVec::from_iter([Some(Value::Obj(int(1))), Some(Value::Obj(int(2)))]);
        let outcome = assign_values(&mut cx, &mut st, SlotVec::from_iter([2, 0]), values);
        assert_eq!(outcome, OpResult::Next);
        assert_eq!(st.cur().get_argument(2).unwrap().unwrap().as_int(), Some(1));
        assert_eq!(st.cur().get_argument(0).unwrap().unwrap().as_int(), Some(2));
    }

    #[test]
    fn continuation_chain_runs_steps_in_sequence() {
        let container = test_container();
        let mut tracer = NoopTracer;
        let mut cx = Exec {
            container: &container,
            service: crate::service::ServiceId::new(0),
            fiber: None,
            tracer: &mut tracer,
        };
        let mut frames = vec![Frame::synthetic(
            "host",
            Arc::from(vec![Op::Return0]),
            2,
            RetSlot::Discard,
        )];
        let mut st = FrameStack::new(&mut frames);

        let mut chain = ContinuationChain::new(Box::new(|cx: &mut Exec<'_>, st: &mut FrameStack<'_>| {
            let value = cx.int_handle(1);
            st.cur().assign_slot(0, value)
        }));
        chain.add(Box::new(|cx: &mut Exec<'_>, st: &mut FrameStack<'_>| {
            let value = cx.int_handle(2);
            st.cur().assign_slot(1, value)
        }));
        assert_eq!(chain.proceed(&mut cx, &mut st), OpResult::Next);
        assert_eq!(st.cur().get_argument(0).unwrap().unwrap().as_int(), Some(1));
        assert_eq!(st.cur().get_argument(1).unwrap().unwrap().as_int(), Some(2));
    }
}
