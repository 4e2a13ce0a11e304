//! Service contexts: single-threaded executors for cohorts of fibers.
//!
//! A service owns an inbound message queue and an inbound response queue
//! (both FIFO), a suspended-fiber list, and at most one current frame. The
//! per-tick pick order is fixed: drain responses (they never run user
//! code), admit messages as `Initial` fibers, resume a pinned frame, then
//! scan the suspended list under the active re-entrancy mode.

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    rc::Rc,
    time::{Duration, Instant},
};

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use crate::{
    composition::{ClassId, MethodId, PropertyId},
    container::builtin,
    exception::{VmException, VmFault},
    fiber::{CallerRef, Fiber, FiberId, FiberStatus},
    frame::{Frame, ProtoHook},
    image::SingletonId,
    op::{NativeOp, Op, RetSlot},
    tracer::VmTracer,
    value::{ArgVec, FnHandle, FutureCell, FutureResult, NativeValue, ObjHandle, Payload},
    vm::{self, Exec, ExecSignal},
};

/// Unique service identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceId(u32);

impl ServiceId {
    #[inline]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

thread_local! {
    static CURRENT_CONTEXT: Cell<Option<ServiceId>> = const { Cell::new(None) };
}

/// The service published on this thread, for diagnostics only; ops receive
/// the frame, which knows its context.
pub fn current_context() -> Option<ServiceId> {
    CURRENT_CONTEXT.get()
}

fn publish_context(service: ServiceId) {
    CURRENT_CONTEXT.set(Some(service));
}

/// Scheduling policy a service applies when choosing the next fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, Serialize, Deserialize)]
pub enum Reentrancy {
    /// At most one fiber ever; new message-born fibers wait for it.
    Forbidden,
    /// New fibers admitted only from an existing causal chain.
    Exclusive,
    /// Prefer already-started fibers, start new ones when nothing is ready.
    #[default]
    Prioritized,
    /// Round-robin among all runnable fibers, new and old alike.
    Open,
}

/// Scheduler switches that pin under-specified semantics for tests.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SchedulerFlags {
    /// Whether `Initial` fibers are eligible under `Exclusive`. The
    /// surveyed behavior is ambiguous; the runtime rejects them until the
    /// front end pins the intended semantics.
    pub exclusive_admits_initial: bool,
}

/// Service lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr, Serialize, Deserialize)]
pub enum ServiceStatus {
    Idle,
    Busy,
    ShuttingDown,
    Terminated,
}

/// What an invoke message calls on the target.
#[derive(Clone)]
pub enum Callee {
    /// A callable value, already bound.
    Fn(FnHandle),
    /// A method resolved against the target service's own handle.
    Method(MethodId),
}

/// A property operation requested from another service.
pub enum PropertyMsg {
    Get,
    Set(ObjHandle),
}

/// Cross-service message shapes.
pub enum Message {
    /// Construct the service's instance on its own context.
    Construct {
        caller: Option<CallerRef>,
        class: ClassId,
        ctor: MethodId,
        args: ArgVec,
        future: FutureCell,
    },
    /// Invoke with zero or one return value. A `None` future is
    /// fire-and-forget.
    Invoke1 {
        caller: Option<CallerRef>,
        callee: Callee,
        args: ArgVec,
        returns: usize,
        future: Option<FutureCell>,
    },
    /// Invoke with multiple return values; the future completes with a
    /// tuple once every return materializes.
    InvokeN {
        caller: Option<CallerRef>,
        callee: Callee,
        args: ArgVec,
        returns: usize,
        future: FutureCell,
    },
    /// A property read or write on the service's own handle.
    PropertyOp {
        caller: Option<CallerRef>,
        prop: PropertyId,
        op: PropertyMsg,
        future: Option<FutureCell>,
    },
    /// Batch singleton initialization, routed to the main context.
    InitSingletons {
        caller: Option<CallerRef>,
        ids: Vec<SingletonId>,
        future: FutureCell,
    },
}

impl Message {
    fn kind(&self) -> &'static str {
        match self {
            Self::Construct { .. } => "construct",
            Self::Invoke1 { .. } => "invoke1",
            Self::InvokeN { .. } => "invokeN",
            Self::PropertyOp { .. } => "property",
            Self::InitSingletons { .. } => "init-singletons",
        }
    }

    fn caller(&self) -> Option<CallerRef> {
        match self {
            Self::Construct { caller, .. }
            | Self::Invoke1 { caller, .. }
            | Self::InvokeN { caller, .. }
            | Self::PropertyOp { caller, .. }
            | Self::InitSingletons { caller, .. } => *caller,
        }
    }
}

/// A service call return, drained on the caller's context. Responses only
/// complete futures and set the responded hint; they never run user code.
pub struct Response {
    pub caller: CallerRef,
    pub result: FutureResult,
    pub future: FutureCell,
}

/// Cloneable sending half of a service's queues.
#[derive(Clone)]
pub struct Endpoints {
    pub service: ServiceId,
    messages: Rc<RefCell<VecDeque<Message>>>,
    responses: Rc<RefCell<VecDeque<Response>>>,
    status: Rc<Cell<ServiceStatus>>,
}

impl Endpoints {
    fn new(service: ServiceId) -> Self {
        Self {
            service,
            messages: Rc::new(RefCell::new(VecDeque::new())),
            responses: Rc::new(RefCell::new(VecDeque::new())),
            status: Rc::new(Cell::new(ServiceStatus::Idle)),
        }
    }

    /// Enqueues a message; refused once the service is shutting down.
    pub fn post_message(&self, message: Message) -> Result<(), VmFault> {
        match self.status.get() {
            ServiceStatus::ShuttingDown | ServiceStatus::Terminated => {
                if let Message::Invoke1 { future: Some(future), .. }
                | Message::InvokeN { future, .. }
                | Message::Construct { future, .. }
                | Message::PropertyOp { future: Some(future), .. }
                | Message::InitSingletons { future, .. } = &message
                {
                    future.fail(VmException::fault(
                        crate::exception::ExcKind::Unsupported,
                        "service is shutting down",
                    ));
                }
                Err(VmFault::ShuttingDown)
            }
            _ => {
                self.messages.borrow_mut().push_back(message);
                Ok(())
            }
        }
    }

    /// Enqueues a response. Always accepted: in-flight calls complete even
    /// during shutdown.
    pub fn post_response(&self, response: Response) {
        self.responses.borrow_mut().push_back(response);
    }

    pub fn status(&self) -> ServiceStatus {
        self.status.get()
    }
}

/// A single-threaded executor for a cohort of fibers.
pub struct ServiceContext {
    pub id: ServiceId,
    pub name: String,
    endpoints: Endpoints,
    pub reentrancy: Reentrancy,
    pub flags: SchedulerFlags,
    fibers: AHashMap<FiberId, Fiber>,
    suspended: Vec<FiberId>,
    current: Option<FiberId>,
    /// Timeout applied to fibers born from inbound messages.
    pub timeout: Option<Duration>,
    /// Cumulative execution time of this service's fibers.
    runtime: Duration,
}

impl ServiceContext {
    pub fn new(id: ServiceId, name: impl Into<String>, reentrancy: Reentrancy) -> Self {
        Self {
            id,
            name: name.into(),
            endpoints: Endpoints::new(id),
            reentrancy,
            flags: SchedulerFlags::default(),
            fibers: AHashMap::new(),
            suspended: Vec::new(),
            current: None,
            timeout: None,
            runtime: Duration::ZERO,
        }
    }

    pub fn endpoints(&self) -> Endpoints {
        self.endpoints.clone()
    }

    pub fn status(&self) -> ServiceStatus {
        self.endpoints.status.get()
    }

    fn set_status(&self, status: ServiceStatus) {
        self.endpoints.status.set(status);
    }

    /// Cumulative runtime of this service's fibers.
    pub fn runtime(&self) -> Duration {
        self.runtime
    }

    /// True when queued or suspended work is pending.
    pub fn is_contended(&self) -> bool {
        !self.endpoints.messages.borrow().is_empty() || !self.suspended.is_empty() || self.current.is_some()
    }

    /// Begins graceful shutdown: refuse new messages, drain what is queued.
    pub fn shut_down(&mut self) {
        if self.status() != ServiceStatus::Terminated {
            self.set_status(ServiceStatus::ShuttingDown);
        }
    }

    pub fn fiber_status(&self, fiber: FiberId) -> Option<FiberStatus> {
        self.fibers.get(&fiber).map(Fiber::status)
    }

    /// Marks a caller fiber as responded (used by response drain).
    fn note_responded(&mut self, fiber: FiberId) {
        if let Some(fiber) = self.fibers.get_mut(&fiber) {
            fiber.responded = true;
        }
    }

    /// Earliest deadline among `Waiting` fibers, for host sleep pacing.
    pub fn earliest_deadline(&self) -> Option<Instant> {
        self.fibers
            .values()
            .filter(|f| f.status() == FiberStatus::Waiting)
            .filter_map(|f| f.deadline)
            .min()
    }

    /// Runs one scheduling tick: pick a fiber and execute it until it
    /// suspends or completes. Returns true when any work was done.
    pub fn tick(&mut self, cx: &mut Exec<'_>) -> bool {
        let drained = self.drain_queues(cx);
        let Some(fiber_id) = self.next_fiber() else {
            if self.status() == ServiceStatus::ShuttingDown && !self.is_contended() {
                self.set_status(ServiceStatus::Terminated);
            } else if self.status() == ServiceStatus::Busy {
                self.set_status(ServiceStatus::Idle);
            }
            return drained;
        };

        if self.status() == ServiceStatus::Idle {
            self.set_status(ServiceStatus::Busy);
        }
        publish_context(self.id);
        let mut fiber = self.fibers.remove(&fiber_id).expect("scheduled fiber exists");
        self.current = Some(fiber_id);
        cx.fiber = Some(fiber_id);

        let signal = vm::execute(cx, &mut fiber);
        cx.fiber = None;
        self.runtime += fiber.take_elapsed();
        match signal {
            ExecSignal::Done => {
                self.current = None;
                cx.tracer.on_schedule(self.id, fiber_id, "terminated");
            }
            ExecSignal::Suspended => {
                cx.tracer.on_schedule(self.id, fiber_id, fiber.status().into());
                self.park(fiber);
            }
        }
        true
    }

    /// Drains the response queue (highest priority, no user code), then
    /// admits every inbound message as an `Initial` fiber.
    fn drain_queues(&mut self, cx: &mut Exec<'_>) -> bool {
        let mut did_work = false;
        loop {
            let response = self.endpoints.responses.borrow_mut().pop_front();
            let Some(response) = response else { break };
            did_work = true;
            cx.tracer.on_response(self.id, response.caller.fiber);
            self.note_responded(response.caller.fiber);
            match response.result {
                Ok(handle) => response.future.complete(handle),
                Err(exc) => response.future.fail(exc),
            }
        }
        loop {
            let message = self.endpoints.messages.borrow_mut().pop_front();
            let Some(message) = message else { break };
            did_work = true;
            publish_context(self.id);
            let fiber = self.admit(cx, message);
            debug_assert_eq!(fiber.status(), FiberStatus::Initial);
            let id = fiber.id;
            self.fibers.insert(id, fiber);
            self.suspended.push(id);
        }
        did_work
    }

    /// Parks a fiber that suspended mid-execution.
    ///
    /// Under `Forbidden` the fiber stays pinned as the current frame (no
    /// other fiber may start); otherwise it rejoins the suspended list so
    /// siblings get their turn.
    fn park(&mut self, fiber: Fiber) {
        let id = fiber.id;
        match fiber.status() {
            FiberStatus::Initial | FiberStatus::Running => unreachable!("parked fiber cannot be {}", fiber.status()),
            FiberStatus::Paused | FiberStatus::Waiting | FiberStatus::Yielded => {
                if self.reentrancy == Reentrancy::Forbidden {
                    self.current = Some(id);
                } else {
                    self.current = None;
                    self.suspended.push(id);
                }
            }
        }
        self.fibers.insert(id, fiber);
    }

    /// True when the fiber may enter `Running` now.
    fn runnable(&self, id: FiberId) -> bool {
        let Some(fiber) = self.fibers.get(&id) else {
            return false;
        };
        match fiber.status() {
            FiberStatus::Initial | FiberStatus::Paused | FiberStatus::Yielded => true,
            FiberStatus::Waiting => fiber.responded || fiber.is_timed_out(),
            FiberStatus::Running => false,
        }
    }

    /// Picks the next fiber under the active re-entrancy mode.
    ///
    /// A `Waiting` fiber with the responded flag (or an expired deadline)
    /// is eligible under every mode. `Paused` outranks `Yielded`, which
    /// outranks message-born `Initial` fibers — except under `Open`, which
    /// round-robins in list order.
    fn next_fiber(&mut self) -> Option<FiberId> {
        if let Some(current) = self.current {
            // A frame left pinned in place (Forbidden) resumes here; while
            // it stays blocked, nothing else may start.
            if self.runnable(current) {
                return Some(current);
            }
            return None;
        }

        if self.suspended.is_empty() {
            return None;
        }

        if self.reentrancy == Reentrancy::Forbidden {
            // No pinned fiber: admit the oldest message-born one.
            let idx = self
                .suspended
                .iter()
                .position(|&id| self.fibers.get(&id).is_some_and(|f| f.status() == FiberStatus::Initial))?;
            return Some(self.suspended.remove(idx));
        }

        let mut paused: Option<usize> = None;
        let mut yielded: Option<usize> = None;
        let mut initial: Option<usize> = None;
        for (idx, &id) in self.suspended.iter().enumerate() {
            let fiber = self.fibers.get(&id).expect("suspended fiber exists");
            let eligible = match fiber.status() {
                FiberStatus::Paused => {
                    if paused.is_none() {
                        paused = Some(idx);
                    }
                    true
                }
                FiberStatus::Yielded => {
                    if yielded.is_none() {
                        yielded = Some(idx);
                    }
                    true
                }
                FiberStatus::Initial => {
                    let admitted = match self.reentrancy {
                        Reentrancy::Exclusive => self.flags.exclusive_admits_initial,
                        _ => true,
                    };
                    if admitted && initial.is_none() {
                        initial = Some(idx);
                    }
                    admitted
                }
                FiberStatus::Waiting => {
                    if fiber.responded || fiber.is_timed_out() {
                        // Eligible under all modes; take it immediately.
                        return Some(self.suspended.remove(idx));
                    }
                    false
                }
                FiberStatus::Running => unreachable!("suspended fiber cannot be Running"),
            };
            // Open treats new and old alike: first runnable in list order.
            if eligible && self.reentrancy == Reentrancy::Open {
                return Some(self.suspended.remove(idx));
            }
        }

        let idx = paused.or(yielded).or(initial)?;
        Some(self.suspended.remove(idx))
    }

    /// Creates the `Initial` fiber and synthetic service-entry frame for an
    /// inbound message.
    fn admit(&mut self, cx: &mut Exec<'_>, message: Message) -> Fiber {
        cx.tracer.on_message(self.id, message.kind());
        let caller = message.caller();
        let service_handle = cx.container.instance(self.id);
        let (returns, invoke, future, fire_and_forget): (usize, NativeOp, Option<FutureCell>, bool) = match message {
            Message::Construct { class, ctor, args, future, .. } => {
                let op = NativeOp::new("svc:construct", move |cx, st| {
                    crate::vm::construct::construct_service(cx, st, class, ctor, args.clone())
                });
                (1, op, Some(future), false)
            }
            Message::Invoke1 { callee, args, returns, future, .. } => {
                let target = service_handle.clone();
                let ret = if returns == 0 { RetSlot::Discard } else { RetSlot::Slot(0) };
                let fire = future.is_none();
                let op = NativeOp::new("svc:invoke1", move |cx, st| {
                    dispatch_callee(cx, st, &callee, target.clone(), args.clone(), ret.clone())
                });
                (returns, op, future, fire)
            }
            Message::InvokeN { callee, args, returns, future, .. } => {
                let target = service_handle.clone();
                let slots: crate::op::SlotVec = (0..returns as u16).collect();
                let op = NativeOp::new("svc:invokeN", move |cx, st| {
                    dispatch_callee(cx, st, &callee, target.clone(), args.clone(), RetSlot::Multi(slots.clone()))
                });
                (returns, op, Some(future), false)
            }
            Message::PropertyOp { prop, op, future, .. } => {
                let target = service_handle.clone();
                let fire = future.is_none();
                let (returns, op) = match op {
                    PropertyMsg::Get => {
                        let op = NativeOp::new("svc:prop-get", move |cx, st| {
                            let Some(target) = target.clone() else {
                                return st.cur().raise_msg(
                                    crate::exception::ExcKind::Unsupported,
                                    "service has no handle",
                                );
                            };
                            crate::vm::property::get_property(cx, st, &target, prop, RetSlot::Slot(0))
                        });
                        (1, op)
                    }
                    PropertyMsg::Set(value) => {
                        let op = NativeOp::new("svc:prop-set", move |cx, st| {
                            let Some(target) = target.clone() else {
                                return st.cur().raise_msg(
                                    crate::exception::ExcKind::Unsupported,
                                    "service has no handle",
                                );
                            };
                            crate::vm::property::set_property(cx, st, &target, prop, value.clone())
                        });
                        (0, op)
                    }
                };
                (returns, op, future, fire)
            }
            Message::InitSingletons { ids, future, .. } => {
                let op = NativeOp::new("svc:init-singletons", move |cx, st| {
                    crate::vm::construct::init_singletons_op(cx, st, ids.clone())
                });
                (1, op, Some(future), false)
            }
        };

        let mut proto = service_entry_frame(returns, invoke);
        proto.on_complete = Some(respond_hook(returns, caller, future, fire_and_forget));

        let id = cx.container.next_fiber_id();
        let mut fiber = Fiber::new(id, self.id, caller, proto);
        if let Some(timeout) = self.timeout {
            fiber.deadline = Some(Instant::now() + timeout);
        }
        fiber
    }
}

/// Builds the synthetic two-op service-entry frame: the requested operation
/// followed by a generic return. Return slots are realized as dynamic
/// references so downstream completion can be awaited.
fn service_entry_frame(returns: usize, invoke: NativeOp) -> Frame {
    let ops: Vec<Op> = vec![Op::Native(invoke), Op::Return0];
    let mut frame = Frame::synthetic("service-entry", ops.into(), returns, RetSlot::Discard);
    for i in 0..returns {
        frame.introduce_dynamic(i, FutureCell::new());
    }
    frame
}

fn dispatch_callee(
    cx: &mut Exec<'_>,
    st: &mut crate::frame::FrameStack<'_>,
    callee: &Callee,
    target: Option<ObjHandle>,
    args: ArgVec,
    ret: RetSlot,
) -> crate::op::OpResult {
    match callee {
        Callee::Fn(handle) => crate::vm::property::call_fn(cx, st, handle.clone(), args, ret),
        Callee::Method(method) => {
            let Some(target) = target else {
                return st
                    .cur()
                    .raise_msg(crate::exception::ExcKind::Unsupported, "service has no handle");
            };
            crate::vm::property::invoke_method_local(cx, st, &target, *method, args, ret)
        }
    }
}

/// Builds the proto-frame completion hook: post the response back to the
/// caller's service (or complete a host future, or route an unhandled
/// exception) once every return value materializes.
fn respond_hook(
    returns: usize,
    caller: Option<CallerRef>,
    future: Option<FutureCell>,
    fire_and_forget: bool,
) -> ProtoHook {
    Box::new(move |cx, proto, exc| {
        let caller_endpoints = caller.and_then(|c| cx.container.endpoints(c.service));
        let Some(future) = future else {
            debug_assert!(fire_and_forget);
            if let Some(exc) = exc {
                cx.report_unhandled(exc);
            }
            return;
        };

        let deliver = move |result: FutureResult| match (&caller, &caller_endpoints) {
            (Some(caller), Some(endpoints)) => endpoints.post_response(Response {
                caller: *caller,
                result,
                future: future.clone(),
            }),
            _ => match result {
                Ok(handle) => future.complete(handle),
                Err(exc) => future.fail(exc),
            },
        };

        if let Some(exc) = exc {
            deliver(Err(exc));
            return;
        }

        match returns {
            0 => deliver(Ok(ObjHandle::new(builtin::BOOL, Payload::Native(NativeValue::Bool(true))))),
            1 => {
                let Some(crate::value::Value::Future(cell)) = proto.slots[0].clone() else {
                    deliver(Err(VmException::fault(
                        crate::exception::ExcKind::Unsupported,
                        "proto-frame return slot is not a dynamic reference",
                    )));
                    return;
                };
                cell.when_done(Box::new(move |result| deliver(result.clone())));
            }
            n => {
                let cells: Vec<FutureCell> = (0..n)
                    .filter_map(|i| match proto.slots[i].clone() {
                        Some(crate::value::Value::Future(cell)) => Some(cell),
                        _ => None,
                    })
                    .collect();
                join_all(cells, Box::new(move |result| {
                    deliver(result.map(|values| ObjHandle::new(builtin::TUPLE, Payload::Tuple(values))))
                }));
            }
        }
    })
}

/// Completes `done` once every cell resolves (first failure wins).
pub fn join_all(cells: Vec<FutureCell>, done: Box<dyn FnOnce(Result<Vec<ObjHandle>, VmException>)>) {
    struct JoinState {
        results: Vec<Option<ObjHandle>>,
        remaining: usize,
        done: Option<Box<dyn FnOnce(Result<Vec<ObjHandle>, VmException>)>>,
    }

    let state = Rc::new(RefCell::new(JoinState {
        results: vec![None; cells.len()],
        remaining: cells.len(),
        done: Some(done),
    }));

    if cells.is_empty() {
        let callback = state.borrow_mut().done.take().expect("join not yet complete");
        callback(Ok(Vec::new()));
        return;
    }

    for (i, cell) in cells.into_iter().enumerate() {
        let state = Rc::clone(&state);
        cell.when_done(Box::new(move |result| {
            let callback = {
                let mut state = state.borrow_mut();
                match result {
                    Ok(handle) => {
                        state.results[i] = Some(handle.clone());
                        state.remaining -= 1;
                        if state.remaining == 0 {
                            state.done.take().map(|done| {
                                let values: Vec<ObjHandle> =
                                    state.results.iter_mut().map(|r| r.take().expect("joined result")).collect();
                                (done, Ok(values))
                            })
                        } else {
                            None
                        }
                    }
                    Err(exc) => state.done.take().map(|done| (done, Err(exc.clone()))),
                }
            };
            if let Some((done, result)) = callback {
                done(result);
            }
        }));
    }
}
