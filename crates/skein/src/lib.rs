//! skein — the runtime core of a managed virtual machine.
//!
//! A compiled, typed bytecode executes on cooperative lightweight fibers
//! grouped into isolated, message-passing services. The pieces:
//!
//! - [`value`]: uniform boxed handles and the tagged slot value
//!   (`Obj`/`Deferred`/`Future`).
//! - [`composition`]: the interning registry of class + type-argument
//!   records that own dispatch tables.
//! - [`image`]: the immutable structures the (external) loader supplies.
//! - [`op`] and [`frame`]: the closed op set, the outcome protocol, and
//!   activation records.
//! - [`fiber`], [`service`], [`container`]: the scheduler — per-service
//!   message queues, re-entrancy policy, fiber state machine, response
//!   routing, process-wide caches.
//! - [`vm`]: the dispatch loop plus deferred-value plumbing, the
//!   construction pipeline, and the property/method dispatch surface.
//! - [`run`]: the host embedding API.

pub mod composition;
pub mod container;
pub mod exception;
pub mod fiber;
pub mod frame;
pub mod image;
pub mod op;
pub mod run;
pub mod service;
pub mod tracer;
pub mod value;
pub mod vm;

pub use crate::{
    composition::{ClassId, CompositionId, MethodId, PropertyId, SubtypeTable, TypeId, TypeOracle},
    container::{AssertSeverity, Container, ContainerStatus, ExecOptions},
    exception::{ExcKind, RunResult, VmException, VmFault},
    fiber::{FiberId, FiberStatus},
    image::{ClassDef, Constant, ImageBuilder, MethodBody, MethodDecl, ModuleImage, SingletonDef, SingletonId, SingletonKind},
    op::{Op, OpResult, RetSlot},
    run::{HostFuture, Runtime, RuntimeBuilder},
    service::{Reentrancy, SchedulerFlags, ServiceId, ServiceStatus},
    tracer::{NoopTracer, RecordingTracer, StderrTracer, TraceEvent, VmTracer},
    value::{NativeValue, ObjHandle, Payload, Value},
};
