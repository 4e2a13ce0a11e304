//! The frame interpreter.
//!
//! [`execute`] drives one fiber: dispatch ops in a tight loop, honoring the
//! outcome protocol, the per-tick op budget and the fiber's deadline.
//! Call/return/exception-unwind all happen here — ops only report.

pub mod compare;
pub mod construct;
pub mod deferred;
pub mod property;

use crate::{
    container::{AssertSeverity, Container, builtin},
    exception::{ExcKind, VmException},
    fiber::{Fiber, FiberId, FiberStatus},
    frame::FrameStack,
    op::{Op, OpResult},
    service::ServiceId,
    tracer::VmTracer,
    value::{ArgVec, NativeValue, ObjHandle, Payload, Value},
};

/// Execution context handed to ops and continuations.
///
/// Ops receive the frame stack separately; the context carries what is
/// process- or service-scoped.
pub struct Exec<'a> {
    pub container: &'a Container,
    /// The service whose fiber is executing.
    pub service: ServiceId,
    /// The fiber being driven; set by the scheduler before dispatch.
    pub fiber: Option<FiberId>,
    pub tracer: &'a mut dyn VmTracer,
}

impl Exec<'_> {
    pub fn int_handle(&self, value: i64) -> ObjHandle {
        ObjHandle::new(builtin::INT, Payload::Native(NativeValue::Int(value)))
    }

    pub fn str_handle(&self, value: &str) -> ObjHandle {
        ObjHandle::new(builtin::STR, Payload::Native(NativeValue::Str(value.into())))
    }

    pub fn bool_handle(&self, value: bool) -> ObjHandle {
        self.container.bool_handle(value)
    }

    /// Routes an exception that reached a proto-frame with no handler.
    pub fn report_unhandled(&mut self, exc: VmException) {
        self.tracer.on_unhandled(self.service, &exc);
        self.container.run_unhandled_hook(self.service, &exc);
    }
}

/// What the dispatch loop tells the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecSignal {
    /// The fiber suspended (`Paused`, `Yielded` or `Waiting`).
    Suspended,
    /// Every frame unwound; the fiber terminated.
    Done,
}

/// Control handed back by frame-completion processing.
enum Ctl {
    Continue,
    Suspend,
    Done,
    /// The current frame has a pending exception.
    Unwind,
}

enum UnwindCtl {
    /// A handler (or a cleanup call) was entered; resume dispatch.
    Resume,
    /// The proto-frame unwound; the fiber is finished.
    Done,
}

/// Reads argument slot `$slot`; reports `Repeat` while a dynamic reference
/// is unmaterialized and routes faults through the exception path.
macro_rules! arg {
    ($st:expr, $slot:expr) => {
        match $st.cur().get_argument($slot as usize) {
            Ok(Some(handle)) => handle,
            Ok(None) => return OpResult::Repeat,
            Err(exc) => return $st.cur().raise(exc),
        }
    };
}

/// Drives one fiber until it suspends or terminates.
pub fn execute(cx: &mut Exec<'_>, fiber: &mut Fiber) -> ExecSignal {
    let mut frames = std::mem::take(&mut fiber.frames);
    let signal = run(cx, fiber, &mut frames);
    fiber.frames = frames;
    signal
}

fn run(cx: &mut Exec<'_>, fiber: &mut Fiber, frames: &mut Vec<crate::frame::Frame>) -> ExecSignal {
    let mut st = FrameStack::new(frames);
    let fiber_id = fiber.id;
    let mut entry_exception = false;

    if fiber.status() == FiberStatus::Waiting {
        if fiber.is_timed_out() {
            // Wake, fail the futures being waited on so late responses are
            // dropped, and raise at the resumption point.
            let exc = VmException::new(ExcKind::Timeout, "deadline exceeded while waiting");
            fiber.deadline = None;
            st.cur().fail_pending_slots(&exc);
            st.cur().raise(exc);
            entry_exception = true;
        } else {
            match st.cur().check_waiting_slots() {
                OpResult::Block => return ExecSignal::Suspended,
                OpResult::Exception => entry_exception = true,
                _ => {}
            }
        }
    }

    fiber.set_status(FiberStatus::Running);
    fiber.responded = false;
    cx.tracer.on_schedule(cx.service, fiber_id, "Running");

    let budget = cx.container.options.ops_per_tick.max(1);
    let mut ops_used: u32 = 0;

    let mut outcome = if entry_exception {
        OpResult::Exception
    } else {
        OpResult::Next
    };
    // The entry outcome is synthetic: `Next` means "dispatch the current
    // op" without advancing.
    let mut advance = false;

    loop {
        match outcome {
            OpResult::Next => {
                if advance {
                    st.cur().pc += 1;
                }
                advance = true;

                if fiber.is_timed_out() {
                    fiber.deadline = None;
                    let exc = VmException::new(ExcKind::Timeout, "deadline exceeded");
                    st.cur().fail_pending_slots(&exc);
                    outcome = st.cur().raise(exc);
                    continue;
                }
                if ops_used >= budget {
                    // Fairness: hand the service back to the scheduler.
                    fiber.set_status(FiberStatus::Paused);
                    return ExecSignal::Suspended;
                }
                ops_used += 1;
                outcome = step(cx, &mut st, fiber_id);
            }
            OpResult::Jump(target) => {
                st.cur().pc = target;
                advance = false;
                outcome = OpResult::Next;
            }
            OpResult::Call => {
                let frame = st.cur();
                frame.pc += 1;
                let callee = frame.next_frame.take().expect("Call outcome without a staged callee");
                st.push(*callee);
                advance = false;
                outcome = OpResult::Next;
            }
            OpResult::Yield => {
                st.cur().pc += 1;
                fiber.set_status(FiberStatus::Yielded);
                return ExecSignal::Suspended;
            }
            OpResult::Block => {
                st.cur().pc += 1;
                fiber.set_status(FiberStatus::Waiting);
                return ExecSignal::Suspended;
            }
            OpResult::Repeat => {
                // Re-enter at the same pc once the awaited value is ready.
                fiber.set_status(FiberStatus::Waiting);
                return ExecSignal::Suspended;
            }
            OpResult::Return | OpResult::BlockReturn => {
                if outcome == OpResult::BlockReturn {
                    fiber.set_status(FiberStatus::Waiting);
                }
                match process_completion(cx, &mut st, fiber) {
                    Ctl::Continue => {
                        advance = false;
                        outcome = OpResult::Next;
                    }
                    Ctl::Suspend => return ExecSignal::Suspended,
                    Ctl::Done => return ExecSignal::Done,
                    Ctl::Unwind => outcome = OpResult::Exception,
                }
            }
            OpResult::ReturnException => {
                let exc = st
                    .cur()
                    .exception
                    .take()
                    .expect("ReturnException without a pending exception");
                if st.len() == 1 {
                    return finish_proto(cx, &mut st, Some(exc));
                }
                st.pop();
                st.cur().exception = Some(exc);
                outcome = OpResult::Exception;
            }
            OpResult::Exception => match unwind(cx, &mut st) {
                UnwindCtl::Resume => {
                    advance = false;
                    outcome = OpResult::Next;
                }
                UnwindCtl::Done => return ExecSignal::Done,
            },
        }
    }
}

/// Completes the proto-frame: run its hook (posting the response) and end
/// the fiber.
fn finish_proto(cx: &mut Exec<'_>, st: &mut FrameStack<'_>, exc: Option<VmException>) -> ExecSignal {
    let mut proto = st.pop();
    match proto.on_complete.take() {
        Some(hook) => hook(cx, &mut proto, exc),
        None => {
            if let Some(exc) = exc {
                cx.report_unhandled(exc);
            }
        }
    }
    ExecSignal::Done
}

/// Handles a frame that completed normally: scoped finalizers, then the
/// continuation chain, then the pop.
fn process_completion(cx: &mut Exec<'_>, st: &mut FrameStack<'_>, fiber: &mut Fiber) -> Ctl {
    loop {
        if st.len() == 1 {
            let mut proto = st.pop();
            match proto.on_complete.take() {
                Some(hook) => hook(cx, &mut proto, None),
                None => {}
            }
            return Ctl::Done;
        }

        let mut completed = st.pop();
        let mut chain = completed.continuation.take();

        // Scoped finalizers (and any construction finalizers anchored on
        // this frame) run before the continuation, in reverse registration
        // order, threading calls through the chain.
        let mut fns: Vec<crate::value::FnHandle> = completed.finalizers.drain();
        fns.extend(std::mem::take(&mut completed.cleanups));
        if !fns.is_empty() {
            let driver = Box::new(deferred::CleanupDriver::new(fns, None));
            match &mut chain {
                Some(chain) => chain.prepend(driver),
                None => chain = Some(deferred::ContinuationChain::new(driver)),
            }
        }

        let Some(mut chain) = chain else {
            return if fiber.status() == FiberStatus::Waiting {
                Ctl::Suspend
            } else {
                Ctl::Continue
            };
        };

        match chain.proceed(cx, st) {
            OpResult::Next => {
                return if fiber.status() == FiberStatus::Waiting {
                    Ctl::Suspend
                } else {
                    Ctl::Continue
                };
            }
            OpResult::Jump(target) => {
                st.cur().pc = target;
                return Ctl::Continue;
            }
            OpResult::Call => {
                // The chain re-attached itself to the staged callee; begin
                // executing it without touching the caller's pc.
                let callee = st.cur().next_frame.take().expect("Call outcome without a staged callee");
                st.push(*callee);
                return Ctl::Continue;
            }
            OpResult::Exception => return Ctl::Unwind,
            OpResult::Return => continue,
            OpResult::BlockReturn => {
                fiber.set_status(FiberStatus::Waiting);
                continue;
            }
            OpResult::ReturnException => {
                let exc = st
                    .cur()
                    .exception
                    .take()
                    .expect("ReturnException without a pending exception");
                if st.len() == 1 {
                    let _ = finish_proto(cx, st, Some(exc));
                    return Ctl::Done;
                }
                st.pop();
                st.cur().exception = Some(exc);
                return Ctl::Unwind;
            }
            OpResult::Repeat | OpResult::Block | OpResult::Yield => {
                let exc = VmException::fault(ExcKind::Unsupported, "continuation reported a scheduling outcome");
                st.cur().exception = Some(exc);
                return Ctl::Unwind;
            }
        }
    }
}

/// Walks frames from current to root looking for a guard matching the
/// pending exception; runs scoped finalizers of every frame it pops.
fn unwind(cx: &mut Exec<'_>, st: &mut FrameStack<'_>) -> UnwindCtl {
    loop {
        let exc = {
            let frame = st.cur();
            frame.exception.take().expect("unwind without a pending exception")
        };
        cx.tracer.on_unwind(cx.service, &exc);

        if let Some((handler_pc, capture)) = st.cur().find_guard(&exc, cx.container.oracle()) {
            // Handled: move the exception into the capture slot and resume
            // at the handler.
            let frame = st.cur();
            frame.pc = handler_pc;
            if let Some(slot) = capture {
                let carrier = exc
                    .carrier
                    .clone()
                    .unwrap_or_else(|| ObjHandle::new(builtin::EXCEPTION, Payload::Exception(Box::new(exc))));
                frame.slots[slot as usize] = Some(Value::Obj(carrier));
            }
            return UnwindCtl::Resume;
        }

        if st.len() == 1 {
            let _ = finish_proto(cx, st, Some(exc));
            return UnwindCtl::Done;
        }

        let mut popped = st.pop();
        let mut fns: Vec<crate::value::FnHandle> = popped.finalizers.drain();
        fns.extend(std::mem::take(&mut popped.cleanups));
        if fns.is_empty() {
            st.cur().exception = Some(exc);
            continue;
        }

        // Scoped finalizers run on the exception path too; the driver
        // re-raises once they are drained.
        let mut driver = deferred::CleanupDriver::new(fns, Some(exc));
        match deferred::Continuation::proceed(&mut driver, cx, st) {
            OpResult::Exception => continue,
            OpResult::Call => {
                let callee = st.cur().next_frame.take().expect("Call outcome without a staged callee");
                st.push(*callee);
                return UnwindCtl::Resume;
            }
            other => {
                let exc = VmException::fault(ExcKind::Unsupported, format!("cleanup driver reported {other:?}"));
                st.cur().exception = Some(exc);
                continue;
            }
        }
    }
}

/// Dispatches the op at the current pc.
fn step(cx: &mut Exec<'_>, st: &mut FrameStack<'_>, fiber: FiberId) -> OpResult {
    let (op, pc) = {
        let frame = st.cur();
        debug_assert!(frame.pc < frame.ops.len(), "pc ran off the op vector");
        (frame.ops[frame.pc].clone(), frame.pc)
    };
    cx.tracer.on_op(cx.service, fiber, pc, op.name());

    match op {
        Op::Nop => OpResult::Next,
        Op::LoadConst { pool, dst } => match cx.container.const_handle(pool) {
            Ok(value) => deferred::assign_resolved(cx, st, dst, value),
            Err(exc) => st.cur().raise(exc),
        },
        Op::Move { src, dst } => {
            let value = arg!(st, src);
            st.cur().assign(&dst, value)
        }
        Op::Jump(target) => OpResult::Jump(target),
        Op::JumpIfTrue { cond, target } => match arg!(st, cond).as_bool() {
            Some(true) => OpResult::Jump(target),
            Some(false) => OpResult::Next,
            None => st.cur().raise_msg(ExcKind::Unsupported, "jump condition is not a Boolean"),
        },
        Op::JumpIfFalse { cond, target } => match arg!(st, cond).as_bool() {
            Some(false) => OpResult::Jump(target),
            Some(true) => OpResult::Next,
            None => st.cur().raise_msg(ExcKind::Unsupported, "jump condition is not a Boolean"),
        },
        Op::CallFn { callee, args, ret } => {
            let callable = arg!(st, callee);
            let argv = collect_args(st, &args);
            match callable.payload() {
                Payload::Fn(handle) => property::call_fn(cx, st, handle.clone(), argv, ret),
                _ => st.cur().raise_msg(ExcKind::Unsupported, "callee is not a function"),
            }
        }
        Op::CallMethod { target, method, args, ret } => {
            let target = arg!(st, target);
            let argv = collect_args(st, &args);
            property::invoke_method(cx, st, &target, method, argv, ret)
        }
        Op::New { class, ctor, args, ret } => {
            let argv = collect_args(st, &args);
            construct::construct(cx, st, class, ctor, argv, ret)
        }
        Op::GetProp { target, prop, dst } => {
            let target = arg!(st, target);
            property::get_property(cx, st, &target, prop, dst)
        }
        Op::SetProp { target, prop, src } => {
            let target = arg!(st, target);
            let value = arg!(st, src);
            property::set_property(cx, st, &target, prop, value)
        }
        Op::IncProp { target, prop, post, dst } => {
            let target = arg!(st, target);
            property::in_place_property(cx, st, target, prop, property::InPlaceAction::Inc, post, dst)
        }
        Op::DecProp { target, prop, post, dst } => {
            let target = arg!(st, target);
            property::in_place_property(cx, st, target, prop, property::InPlaceAction::Dec, post, dst)
        }
        Op::IsEq { left, right, types, dst } => {
            let a = arg!(st, left);
            let b = arg!(st, right);
            compare::call_equals_sequence(cx, st, types.0, types.1, &a, &b, dst)
        }
        Op::Cmp { left, right, types, dst } => {
            let a = arg!(st, left);
            let b = arg!(st, right);
            compare::call_compare_sequence(cx, st, types.0, types.1, &a, &b, dst)
        }
        Op::Assert { cond } => {
            let value = arg!(st, cond);
            if value.as_bool() == Some(true) {
                return OpResult::Next;
            }
            let exc = VmException::new(ExcKind::AssertionFailed, format!("assertion failed at pc {pc}"));
            match cx.container.options.assert {
                AssertSeverity::Raise => st.cur().raise(exc),
                AssertSeverity::Warn => {
                    cx.tracer.on_unwind(cx.service, &exc);
                    OpResult::Next
                }
                AssertSeverity::Ignore => OpResult::Next,
            }
        }
        Op::Throw { src } => {
            let value = arg!(st, src);
            let exc = match value.payload() {
                Payload::Exception(exc) => exc.as_ref().clone().with_carrier(value.clone()),
                _ => {
                    let type_of = cx.container.registry.get(value.composition()).type_of;
                    VmException::user(value.clone(), type_of)
                }
            };
            st.cur().raise(exc)
        }
        Op::GuardStart(guard) => {
            st.cur().guards.push(guard);
            OpResult::Next
        }
        Op::GuardEnd => {
            st.cur().guards.pop();
            OpResult::Next
        }
        Op::Defer { src, method } => {
            let target = arg!(st, src);
            let comp = cx.container.registry.get(target.composition());
            let Some(chain) = comp.method_chain(method) else {
                return st.cur().raise_msg(ExcKind::Unsupported, "deferred method not found on target");
            };
            let cleanup = crate::value::FnHandle::new(chain.top().clone())
                .bind_arguments([Some(Value::Obj(target))]);
            st.cur().defer_cleanup(cleanup);
            OpResult::Next
        }
        Op::Return0 => OpResult::Return,
        Op::Return1 { src } => {
            let src = src as usize;
            let dynamic = st.cur().var_info[src].dynamic;
            let slot = st.cur().slots[src].clone();
            if dynamic
                && let Some(Value::Future(cell)) = &slot
                && !cell.is_done()
            {
                // Dynamic return: hand the raw future to the caller.
                let handle = deferred::future_handle(cell.clone());
                return st.return_value(handle, true);
            }
            match slot {
                Some(Value::Deferred(_)) => deferred::return_resolved(cx, st, ArgVec::from_iter([slot])),
                _ => {
                    let handle = arg!(st, src);
                    st.return_value(handle, false)
                }
            }
        }
        Op::ReturnN { srcs } => {
            // Materialize futures first so the resolver never sees a
            // pending one.
            for &src in &srcs {
                if let Some(Value::Future(cell)) = &st.cur().slots[src as usize]
                    && !cell.is_done()
                {
                    return OpResult::Repeat;
                }
            }
            let values: ArgVec = srcs.iter().map(|&s| st.cur().slots[s as usize].clone()).collect();
            deferred::return_resolved(cx, st, values)
        }
        Op::Yield => OpResult::Yield,
        Op::Native(op) => op.run(cx, st),
    }
}

fn collect_args(st: &mut FrameStack<'_>, slots: &crate::op::SlotVec) -> ArgVec {
    slots
        .iter()
        .map(|&slot| st.cur().slots[slot as usize].clone())
        .collect()
}
