//! Host embedding API.
//!
//! The host acts as the event loop: build a [`Runtime`] over a module
//! image, create services, submit calls (each returns a [`HostFuture`]),
//! and drive ticks until the work drains. Graceful shutdown drains queues,
//! refuses new messages, then terminates.

use std::{
    thread,
    time::{Duration, Instant},
};

use crate::{
    composition::{ClassId, MethodId, SubtypeTable, TypeOracle},
    container::{Container, ExecOptions},
    exception::{RunResult, VmFault},
    image::ModuleImage,
    service::{Callee, Message, Reentrancy},
    tracer::VmTracer,
    value::{ArgVec, FnHandle, FutureCell, FutureResult, NativeValue, ObjHandle, Payload, Value},
};

/// Builder for a [`Runtime`].
pub struct RuntimeBuilder {
    image: ModuleImage,
    oracle: Box<dyn TypeOracle>,
    options: ExecOptions,
}

impl RuntimeBuilder {
    pub fn new(image: ModuleImage) -> Self {
        Self {
            image,
            oracle: Box::new(SubtypeTable::new()),
            options: ExecOptions::default(),
        }
    }

    /// Installs the host's type oracle (defaults to an empty table).
    #[must_use]
    pub fn oracle(mut self, oracle: Box<dyn TypeOracle>) -> Self {
        self.oracle = oracle;
        self
    }

    #[must_use]
    pub fn options(mut self, options: ExecOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> RunResult<Runtime> {
        let container = Container::new(self.image, self.oracle, self.options)?;
        // The main context owns singleton initialization.
        container.create_service("main", Reentrancy::Open)?;
        Ok(Runtime { container })
    }
}

/// A completion observed from the host.
#[derive(Clone)]
pub struct HostFuture {
    cell: FutureCell,
}

impl HostFuture {
    pub fn is_done(&self) -> bool {
        self.cell.is_done()
    }

    /// The result, once available.
    pub fn try_get(&self) -> Option<FutureResult> {
        self.cell.peek()
    }
}

/// A container plus the conveniences hosts drive it with.
pub struct Runtime {
    container: Container,
}

impl Runtime {
    pub fn new(image: ModuleImage) -> RunResult<Self> {
        RuntimeBuilder::new(image).build()
    }

    pub fn builder(image: ModuleImage) -> RuntimeBuilder {
        RuntimeBuilder::new(image)
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    /// The main context's reference handle (owner of singleton
    /// initialization).
    pub fn main_service(&self) -> ObjHandle {
        let id = self.container.main_service().expect("runtime has a main context");
        ObjHandle::new(crate::container::builtin::SERVICE, Payload::Service(id))
    }

    /// Creates an untyped service; returns the reference handle.
    pub fn create_service(&self, name: &str, reentrancy: Reentrancy) -> RunResult<ObjHandle> {
        self.container.create_service(name, reentrancy)
    }

    /// Creates a service for a service class and enqueues its
    /// construction. The returned future completes with the instance.
    pub fn create_service_of(
        &self,
        name: &str,
        class: ClassId,
        ctor: MethodId,
        args: Vec<ObjHandle>,
        reentrancy: Reentrancy,
    ) -> RunResult<(ObjHandle, HostFuture)> {
        let handle = self.container.create_service_typed(name, class, reentrancy)?;
        let service = handle.as_service().expect("service reference");
        let endpoints = self
            .container
            .endpoints(service)
            .ok_or_else(|| VmFault::NoSuchService(name.to_owned()))?;
        let future = FutureCell::new();
        endpoints.post_message(Message::Construct {
            caller: None,
            class,
            ctor,
            args: to_args(args),
            future: future.clone(),
        })?;
        Ok((handle, HostFuture { cell: future }))
    }

    /// Submits a call to a named entry point on a service, returning a
    /// future of its single result.
    pub fn submit(&self, service: &ObjHandle, entry: &str, args: Vec<ObjHandle>) -> RunResult<HostFuture> {
        let body = self
            .container
            .image()
            .entry(entry)
            .ok_or_else(|| VmFault::Missing(format!("entry `{entry}`")))?;
        let callee = Callee::Fn(FnHandle::new(crate::composition::MethodImpl::Body(body.clone())));
        self.submit_callee(service, callee, args, 1)
    }

    /// Submits a method invocation against the service's instance.
    pub fn submit_method(&self, service: &ObjHandle, method: MethodId, args: Vec<ObjHandle>) -> RunResult<HostFuture> {
        self.submit_callee(service, Callee::Method(method), args, 1)
    }

    fn submit_callee(&self, service: &ObjHandle, callee: Callee, args: Vec<ObjHandle>, returns: usize) -> RunResult<HostFuture> {
        let id = service
            .as_service()
            .ok_or_else(|| VmFault::Missing("service reference".to_owned()))?;
        let endpoints = self
            .container
            .endpoints(id)
            .ok_or_else(|| VmFault::NoSuchService(format!("#{}", id.raw())))?;
        let future = FutureCell::new();
        endpoints.post_message(Message::Invoke1 {
            caller: None,
            callee,
            args: to_args(args),
            returns,
            future: Some(future.clone()),
        })?;
        Ok(HostFuture { cell: future })
    }

    /// Submits a call expecting `returns` values; the future completes
    /// with a tuple.
    pub fn submit_multi(
        &self,
        service: &ObjHandle,
        entry: &str,
        args: Vec<ObjHandle>,
        returns: usize,
    ) -> RunResult<HostFuture> {
        let body = self
            .container
            .image()
            .entry(entry)
            .ok_or_else(|| VmFault::Missing(format!("entry `{entry}`")))?;
        let id = service
            .as_service()
            .ok_or_else(|| VmFault::Missing("service reference".to_owned()))?;
        let endpoints = self
            .container
            .endpoints(id)
            .ok_or_else(|| VmFault::NoSuchService(format!("#{}", id.raw())))?;
        let future = FutureCell::new();
        endpoints.post_message(Message::InvokeN {
            caller: None,
            callee: Callee::Fn(FnHandle::new(crate::composition::MethodImpl::Body(body.clone()))),
            args: to_args(args),
            returns,
            future: future.clone(),
        })?;
        Ok(HostFuture { cell: future })
    }

    /// Fire-and-forget invocation; failures route to the unhandled hook.
    pub fn call_later(&self, service: &ObjHandle, entry: &str, args: Vec<ObjHandle>) -> RunResult<()> {
        let body = self
            .container
            .image()
            .entry(entry)
            .ok_or_else(|| VmFault::Missing(format!("entry `{entry}`")))?;
        let id = service
            .as_service()
            .ok_or_else(|| VmFault::Missing("service reference".to_owned()))?;
        let endpoints = self
            .container
            .endpoints(id)
            .ok_or_else(|| VmFault::NoSuchService(format!("#{}", id.raw())))?;
        endpoints.post_message(Message::Invoke1 {
            caller: None,
            callee: Callee::Fn(FnHandle::new(crate::composition::MethodImpl::Body(body.clone()))),
            args: to_args(args),
            returns: 0,
            future: None,
        })
    }

    /// Sets the timeout applied to fibers born from a service's inbound
    /// messages.
    pub fn set_timeout(&self, service: &ObjHandle, timeout: Option<Duration>) -> RunResult<()> {
        let id = service
            .as_service()
            .ok_or_else(|| VmFault::Missing("service reference".to_owned()))?;
        let context = self
            .container
            .service(id)
            .ok_or_else(|| VmFault::NoSuchService(format!("#{}", id.raw())))?;
        context.borrow_mut().timeout = timeout;
        Ok(())
    }

    pub fn timeout(&self, service: &ObjHandle) -> Option<Duration> {
        let id = service.as_service()?;
        let context = self.container.service(id)?;
        let timeout = context.borrow().timeout;
        timeout
    }

    /// Runs one tick across every service.
    pub fn tick(&self, tracer: &mut dyn VmTracer) -> bool {
        self.container.tick_all(tracer)
    }

    /// Drives ticks until no service makes progress. Sleeps through
    /// deadline gaps so timed-out waiters wake and raise.
    pub fn run_until_idle(&self, tracer: &mut dyn VmTracer) {
        loop {
            if self.container.tick_all(tracer) {
                continue;
            }
            let Some(deadline) = self.container.earliest_deadline() else {
                return;
            };
            let now = Instant::now();
            if deadline > now {
                thread::sleep(deadline - now);
            }
            if !self.container.tick_all(tracer) {
                return;
            }
        }
    }

    /// Graceful shutdown: refuse new messages, drain, terminate.
    pub fn shutdown(&self, tracer: &mut dyn VmTracer) {
        self.container.shutdown();
        while !self.container.is_terminated() {
            if !self.container.tick_all(tracer) && self.container.earliest_deadline().is_none() {
                // Nothing left that can make progress; drop the remainder.
                break;
            }
        }
    }

    // Handle constructors for host-supplied arguments.

    pub fn int(&self, value: i64) -> ObjHandle {
        ObjHandle::new(crate::container::builtin::INT, Payload::Native(NativeValue::Int(value)))
    }

    pub fn float(&self, value: f64) -> ObjHandle {
        ObjHandle::new(crate::container::builtin::FLOAT, Payload::Native(NativeValue::Float(value)))
    }

    pub fn boolean(&self, value: bool) -> ObjHandle {
        self.container.bool_handle(value)
    }

    pub fn string(&self, value: &str) -> ObjHandle {
        ObjHandle::new(
            crate::container::builtin::STR,
            Payload::Native(NativeValue::Str(value.into())),
        )
    }
}

fn to_args(args: Vec<ObjHandle>) -> ArgVec {
    args.into_iter().map(|handle| Some(Value::Obj(handle))).collect()
}
