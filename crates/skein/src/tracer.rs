//! Execution tracing infrastructure.
//!
//! A trait-based tracing system with hook points at the runtime's key
//! events: op dispatch, fiber scheduling, cross-service messaging and
//! exception unwind. [`NoopTracer`] is the production default;
//! [`StderrTracer`] gives a human-readable log; [`RecordingTracer`]
//! captures a full event stream for post-mortem inspection or the CLI's
//! JSON output.

use serde::Serialize;

use crate::{exception::VmException, fiber::FiberId, service::ServiceId};

/// Trace event captured by [`RecordingTracer`].
#[derive(Debug, Clone, Serialize)]
pub enum TraceEvent {
    /// An op was dispatched.
    Op {
        service: u32,
        fiber: u64,
        pc: usize,
        name: &'static str,
    },
    /// A fiber changed scheduling state.
    Schedule {
        service: u32,
        fiber: u64,
        status: &'static str,
    },
    /// A message was enqueued onto a service.
    Message { to: u32, kind: &'static str },
    /// A response was drained on the caller's side.
    Response { service: u32, fiber: u64 },
    /// An exception began unwinding.
    Unwind { service: u32, exception: String },
    /// An exception reached a proto-frame with no handler.
    Unhandled { service: u32, exception: String },
}

/// Hook points for runtime diagnostics.
///
/// All methods default to no-ops so implementations pick the events they
/// care about. The runtime holds the tracer as a trait object; per-op cost
/// for [`NoopTracer`] is a single indirect call on traced paths.
pub trait VmTracer {
    fn on_op(&mut self, service: ServiceId, fiber: FiberId, pc: usize, name: &'static str) {
        let _ = (service, fiber, pc, name);
    }

    fn on_schedule(&mut self, service: ServiceId, fiber: FiberId, status: &'static str) {
        let _ = (service, fiber, status);
    }

    fn on_message(&mut self, to: ServiceId, kind: &'static str) {
        let _ = (to, kind);
    }

    fn on_response(&mut self, service: ServiceId, fiber: FiberId) {
        let _ = (service, fiber);
    }

    fn on_unwind(&mut self, service: ServiceId, exc: &VmException) {
        let _ = (service, exc);
    }

    fn on_unhandled(&mut self, service: ServiceId, exc: &VmException) {
        let _ = (service, exc);
    }
}

/// Zero-signal tracer.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

impl VmTracer for NoopTracer {}

/// Human-readable execution log on stderr.
#[derive(Debug, Default)]
pub struct StderrTracer;

impl VmTracer for StderrTracer {
    fn on_op(&mut self, service: ServiceId, fiber: FiberId, pc: usize, name: &'static str) {
        eprintln!("[svc {} fib {}] {pc:>4}: {name}", service.raw(), fiber.raw());
    }

    fn on_schedule(&mut self, service: ServiceId, fiber: FiberId, status: &'static str) {
        eprintln!("[svc {} fib {}] -> {status}", service.raw(), fiber.raw());
    }

    fn on_message(&mut self, to: ServiceId, kind: &'static str) {
        eprintln!("[svc {}] <- {kind}", to.raw());
    }

    fn on_response(&mut self, service: ServiceId, fiber: FiberId) {
        eprintln!("[svc {} fib {}] response", service.raw(), fiber.raw());
    }

    fn on_unwind(&mut self, service: ServiceId, exc: &VmException) {
        eprintln!("[svc {}] unwinding: {exc}", service.raw());
    }

    fn on_unhandled(&mut self, service: ServiceId, exc: &VmException) {
        eprintln!("[svc {}] unhandled: {exc}", service.raw());
    }
}

/// Full event recording.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    events: Vec<TraceEvent>,
}

impl RecordingTracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<TraceEvent> {
        self.events
    }

    /// Scheduling events for one service, in order.
    pub fn schedule_log(&self, service: ServiceId) -> Vec<(u64, &'static str)> {
        self.events
            .iter()
            .filter_map(|event| match event {
                TraceEvent::Schedule { service: s, fiber, status } if *s == service.raw() => Some((*fiber, *status)),
                _ => None,
            })
            .collect()
    }
}

impl VmTracer for RecordingTracer {
    fn on_op(&mut self, service: ServiceId, fiber: FiberId, pc: usize, name: &'static str) {
        self.events.push(TraceEvent::Op {
            service: service.raw(),
            fiber: fiber.raw(),
            pc,
            name,
        });
    }

    fn on_schedule(&mut self, service: ServiceId, fiber: FiberId, status: &'static str) {
        self.events.push(TraceEvent::Schedule {
            service: service.raw(),
            fiber: fiber.raw(),
            status,
        });
    }

    fn on_message(&mut self, to: ServiceId, kind: &'static str) {
        self.events.push(TraceEvent::Message {
            to: to.raw(),
            kind,
        });
    }

    fn on_response(&mut self, service: ServiceId, fiber: FiberId) {
        self.events.push(TraceEvent::Response {
            service: service.raw(),
            fiber: fiber.raw(),
        });
    }

    fn on_unwind(&mut self, service: ServiceId, exc: &VmException) {
        self.events.push(TraceEvent::Unwind {
            service: service.raw(),
            exception: exc.to_string(),
        });
    }

    fn on_unhandled(&mut self, service: ServiceId, exc: &VmException) {
        self.events.push(TraceEvent::Unhandled {
            service: service.raw(),
            exception: exc.to_string(),
        });
    }
}
