//! The container: one or more service contexts plus the process-wide
//! constant-handle cache, singleton table and shared type info.
//!
//! Registries are write-mostly-once: populated at load and during main-
//! context initialization, then read from every service.

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    sync::Arc,
    time::Instant,
};

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::{
    composition::{ClassId, CompositionRegistry, TypeId, TypeOracle},
    exception::{ExcKind, RunResult, VmException, VmFault},
    fiber::FiberId,
    image::{ClassDef, Constant, ModuleImage, SingletonDef, SingletonId},
    service::{Endpoints, Reentrancy, ServiceContext, ServiceId},
    tracer::VmTracer,
    value::{Deferred, NativeValue, ObjHandle, Payload, Value},
    vm::Exec,
};

/// Well-known classes and compositions the runtime itself creates handles
/// for. The loader assigns image class ids starting at
/// [`builtin::FIRST_IMAGE_CLASS`].
pub mod builtin {
    use crate::composition::{ClassId, CompositionId};

    pub const BOOL_CLASS: ClassId = ClassId::new(0);
    pub const INT_CLASS: ClassId = ClassId::new(1);
    pub const FLOAT_CLASS: ClassId = ClassId::new(2);
    pub const STR_CLASS: ClassId = ClassId::new(3);
    pub const TUPLE_CLASS: ClassId = ClassId::new(4);
    pub const FN_CLASS: ClassId = ClassId::new(5);
    pub const FUTURE_CLASS: ClassId = ClassId::new(6);
    pub const REF_CLASS: ClassId = ClassId::new(7);
    pub const EXCEPTION_CLASS: ClassId = ClassId::new(8);
    pub const SERVICE_CLASS: ClassId = ClassId::new(9);

    /// Canonical compositions, interned at container startup in class-id
    /// order so the indices are stable.
    pub const BOOL: CompositionId = CompositionId::new(0);
    pub const INT: CompositionId = CompositionId::new(1);
    pub const FLOAT: CompositionId = CompositionId::new(2);
    pub const STR: CompositionId = CompositionId::new(3);
    pub const TUPLE: CompositionId = CompositionId::new(4);
    pub const FN: CompositionId = CompositionId::new(5);
    pub const FUTURE: CompositionId = CompositionId::new(6);
    pub const REF: CompositionId = CompositionId::new(7);
    pub const EXCEPTION: CompositionId = CompositionId::new(8);
    pub const SERVICE: CompositionId = CompositionId::new(9);

    /// First class id available to loader-supplied classes.
    pub const FIRST_IMAGE_CLASS: u32 = 10;
}

/// What an `Assert` op does on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, Serialize, Deserialize)]
pub enum AssertSeverity {
    /// Raise `AssertionFailed`.
    #[default]
    Raise,
    /// Trace the failure and continue.
    Warn,
    /// Continue silently.
    Ignore,
}

/// Execution options applied container-wide.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExecOptions {
    /// Op budget per scheduling slice; exceeding it demotes the fiber to
    /// `Paused` so siblings get a turn.
    pub ops_per_tick: u32,
    /// Assert failure behavior.
    pub assert: AssertSeverity,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            ops_per_tick: 10,
            assert: AssertSeverity::default(),
        }
    }
}

/// Container lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum ContainerStatus {
    Running,
    ShuttingDown,
    Terminated,
}

enum SingletonState {
    /// Initialization entered but not finished; re-entry is circular.
    Initializing,
    Ready(ObjHandle),
}

struct ServiceEntry {
    context: Rc<RefCell<ServiceContext>>,
    endpoints: Endpoints,
    /// The service's constructed instance; stays inside its context.
    instance: RefCell<Option<ObjHandle>>,
}

/// Holder of service contexts and process-wide shared state.
pub struct Container {
    pub registry: CompositionRegistry,
    oracle: Box<dyn TypeOracle>,
    image: ModuleImage,
    pub options: ExecOptions,
    services: RefCell<AHashMap<ServiceId, ServiceEntry>>,
    service_order: RefCell<Vec<ServiceId>>,
    constants: RefCell<AHashMap<u32, ObjHandle>>,
    singletons: RefCell<AHashMap<SingletonId, SingletonState>>,
    singleton_defs: AHashMap<SingletonId, SingletonDef>,
    main: Cell<Option<ServiceId>>,
    status: Cell<ContainerStatus>,
    next_fiber: Cell<u64>,
    next_service: Cell<u32>,
    true_handle: ObjHandle,
    false_handle: ObjHandle,
    unhandled_hook: RefCell<Option<Box<dyn FnMut(ServiceId, &VmException)>>>,
}

impl Container {
    /// Creates a container over a validated module image.
    pub fn new(image: ModuleImage, oracle: Box<dyn TypeOracle>, options: ExecOptions) -> RunResult<Self> {
        let registry = CompositionRegistry::new();
        register_builtins(&registry)?;

        for class in &image.classes {
            if class.id.raw() < builtin::FIRST_IMAGE_CLASS {
                return Err(VmFault::CorruptPool(format!(
                    "class `{}` uses reserved id {}",
                    class.name,
                    class.id.raw()
                )));
            }
            registry.register_class(Arc::clone(class));
        }

        let singleton_defs = image
            .singletons
            .iter()
            .map(|def| (def.id, def.clone()))
            .collect();

        let true_handle = ObjHandle::new(builtin::BOOL, Payload::Native(NativeValue::Bool(true)));
        let false_handle = ObjHandle::new(builtin::BOOL, Payload::Native(NativeValue::Bool(false)));

        Ok(Self {
            registry,
            oracle,
            image,
            options,
            services: RefCell::new(AHashMap::new()),
            service_order: RefCell::new(Vec::new()),
            constants: RefCell::new(AHashMap::new()),
            singletons: RefCell::new(AHashMap::new()),
            singleton_defs,
            main: Cell::new(None),
            status: Cell::new(ContainerStatus::Running),
            next_fiber: Cell::new(0),
            next_service: Cell::new(0),
            true_handle,
            false_handle,
            unhandled_hook: RefCell::new(None),
        })
    }

    pub fn image(&self) -> &ModuleImage {
        &self.image
    }

    pub fn oracle(&self) -> &dyn TypeOracle {
        self.oracle.as_ref()
    }

    pub fn status(&self) -> ContainerStatus {
        self.status.get()
    }

    /// The main context: owner of singleton initialization.
    pub fn main_service(&self) -> Option<ServiceId> {
        self.main.get()
    }

    pub fn next_fiber_id(&self) -> FiberId {
        let id = self.next_fiber.get();
        self.next_fiber.set(id + 1);
        FiberId::new(id)
    }

    /// Creates a service context. The first created service becomes the
    /// main context. Returns the service reference handle callers hold.
    pub fn create_service(&self, name: &str, reentrancy: Reentrancy) -> RunResult<ObjHandle> {
        self.create_service_inner(name, reentrancy, builtin::SERVICE)
    }

    /// Creates a service context for a service class; the returned
    /// reference handle carries the class composition so remote property
    /// and method dispatch resolve against it.
    pub fn create_service_typed(&self, name: &str, class: ClassId, reentrancy: Reentrancy) -> RunResult<ObjHandle> {
        let comp = self.registry.ensure_canonical(class)?;
        self.create_service_inner(name, reentrancy, comp)
    }

    fn create_service_inner(
        &self,
        name: &str,
        reentrancy: Reentrancy,
        comp: crate::composition::CompositionId,
    ) -> RunResult<ObjHandle> {
        if self.status.get() != ContainerStatus::Running {
            return Err(VmFault::ShuttingDown);
        }
        let id = ServiceId::new(self.next_service.get());
        self.next_service.set(id.raw() + 1);

        let context = ServiceContext::new(id, name, reentrancy);
        let endpoints = context.endpoints();
        let entry = ServiceEntry {
            context: Rc::new(RefCell::new(context)),
            endpoints,
            instance: RefCell::new(None),
        };
        self.services.borrow_mut().insert(id, entry);
        self.service_order.borrow_mut().push(id);
        if self.main.get().is_none() {
            self.main.set(Some(id));
            // The main context starts with a plain instance so host entry
            // points can run before any user service is constructed.
            self.set_instance(
                id,
                ObjHandle::new_mutable(builtin::SERVICE, Payload::Fields(RefCell::new(indexmap::IndexMap::new()))),
            );
        }
        Ok(ObjHandle::new(comp, Payload::Service(id)))
    }

    pub fn service(&self, id: ServiceId) -> Option<Rc<RefCell<ServiceContext>>> {
        self.services.borrow().get(&id).map(|e| Rc::clone(&e.context))
    }

    pub fn endpoints(&self, id: ServiceId) -> Option<Endpoints> {
        self.services.borrow().get(&id).map(|e| e.endpoints.clone())
    }

    /// The service's constructed instance, if construction has completed.
    pub fn instance(&self, id: ServiceId) -> Option<ObjHandle> {
        self.services.borrow().get(&id).and_then(|e| e.instance.borrow().clone())
    }

    pub fn set_instance(&self, id: ServiceId, handle: ObjHandle) {
        if let Some(entry) = self.services.borrow().get(&id) {
            *entry.instance.borrow_mut() = Some(handle);
        }
    }

    pub fn service_ids(&self) -> Vec<ServiceId> {
        self.service_order.borrow().clone()
    }

    /// Cached boolean constants.
    pub fn bool_handle(&self, value: bool) -> ObjHandle {
        if value {
            self.true_handle.clone()
        } else {
            self.false_handle.clone()
        }
    }

    /// Resolves a constant-pool entry to a handle, caching the result.
    ///
    /// Singleton constants whose identity is not yet initialized resolve to
    /// a deferred placeholder that runs initialization on first use.
    pub fn const_handle(&self, pool: u32) -> Result<Value, VmException> {
        if let Some(handle) = self.constants.borrow().get(&pool) {
            return Ok(Value::Obj(handle.clone()));
        }
        let constant = self.image.constants.get(pool as usize).ok_or_else(|| {
            VmException::fault(ExcKind::Unsupported, format!("constant #{pool} out of range"))
        })?;
        let handle = match constant {
            Constant::Bool(b) => self.bool_handle(*b),
            Constant::Int(i) => ObjHandle::new(builtin::INT, Payload::Native(NativeValue::Int(*i))),
            Constant::Float(f) => ObjHandle::new(builtin::FLOAT, Payload::Native(NativeValue::Float(*f))),
            Constant::Str(s) => ObjHandle::new(builtin::STR, Payload::Native(NativeValue::Str(Rc::from(&**s)))),
            Constant::Singleton(id) => {
                return match self.singleton_value(*id) {
                    Some(handle) => Ok(Value::Obj(handle)),
                    None => Ok(Value::Deferred(Deferred::new(
                        crate::vm::construct::singleton_resolver_frame(*id),
                    ))),
                };
            }
        };
        self.constants.borrow_mut().insert(pool, handle.clone());
        Ok(Value::Obj(handle))
    }

    pub fn singleton_def(&self, id: SingletonId) -> Option<&SingletonDef> {
        self.singleton_defs.get(&id)
    }

    /// The initialized handle for a singleton identity, if any.
    pub fn singleton_value(&self, id: SingletonId) -> Option<ObjHandle> {
        match self.singletons.borrow().get(&id) {
            Some(SingletonState::Ready(handle)) => Some(handle.clone()),
            _ => None,
        }
    }

    /// Marks a singleton as initializing. Returns false when the identity
    /// is already mid-initialization — a circular reference.
    pub fn mark_initializing(&self, id: SingletonId) -> bool {
        let mut singletons = self.singletons.borrow_mut();
        match singletons.get(&id) {
            Some(SingletonState::Initializing) => false,
            Some(SingletonState::Ready(_)) => true,
            None => {
                singletons.insert(id, SingletonState::Initializing);
                true
            }
        }
    }

    /// Publishes an initialized singleton handle. No partial handle is ever
    /// published: failures clear the initializing mark instead.
    pub fn set_singleton(&self, id: SingletonId, handle: ObjHandle) {
        self.singletons.borrow_mut().insert(id, SingletonState::Ready(handle));
    }

    /// Clears a failed initialization so a later attempt may retry.
    pub fn clear_initializing(&self, id: SingletonId) {
        let mut singletons = self.singletons.borrow_mut();
        if matches!(singletons.get(&id), Some(SingletonState::Initializing)) {
            singletons.remove(&id);
        }
    }

    /// Installs the unhandled-exception hook. The default behavior (trace
    /// and drop the fiber) applies when none is installed.
    pub fn set_unhandled_hook(&self, hook: Box<dyn FnMut(ServiceId, &VmException)>) {
        *self.unhandled_hook.borrow_mut() = Some(hook);
    }

    pub(crate) fn run_unhandled_hook(&self, service: ServiceId, exc: &VmException) {
        if let Some(hook) = self.unhandled_hook.borrow_mut().as_mut() {
            hook(service, exc);
        }
    }

    /// Runs one scheduling tick on one service. Returns true when work was
    /// done.
    pub fn tick_service(&self, id: ServiceId, tracer: &mut dyn VmTracer) -> bool {
        let Some(context) = self.service(id) else {
            return false;
        };
        let mut context = context.borrow_mut();
        let mut cx = Exec {
            container: self,
            service: id,
            fiber: None,
            tracer,
        };
        context.tick(&mut cx)
    }

    /// Runs one tick across every service, round-robin.
    pub fn tick_all(&self, tracer: &mut dyn VmTracer) -> bool {
        let mut did_work = false;
        for id in self.service_ids() {
            did_work |= self.tick_service(id, tracer);
        }
        did_work
    }

    /// The earliest deadline among `Waiting` fibers, used by hosts to sleep
    /// precisely between ticks.
    pub fn earliest_deadline(&self) -> Option<Instant> {
        let services = self.services.borrow();
        services
            .values()
            .filter_map(|entry| entry.context.borrow().earliest_deadline())
            .min()
    }

    /// Begins graceful shutdown: services drain their queues, refuse new
    /// messages, then terminate.
    pub fn shutdown(&self) {
        self.status.set(ContainerStatus::ShuttingDown);
        for id in self.service_ids() {
            if let Some(context) = self.service(id) {
                context.borrow_mut().shut_down();
            }
        }
    }

    /// True once every service has terminated after shutdown.
    pub fn is_terminated(&self) -> bool {
        if self.status.get() == ContainerStatus::Terminated {
            return true;
        }
        if self.status.get() != ContainerStatus::ShuttingDown {
            return false;
        }
        let done = self
            .service_ids()
            .iter()
            .all(|id| self.service(*id).is_some_and(|c| c.borrow().status() == crate::service::ServiceStatus::Terminated));
        if done {
            self.status.set(ContainerStatus::Terminated);
        }
        done
    }
}

/// Registers the built-in classes and interns their canonical compositions
/// in declaration order so the composition indices in [`builtin`] hold.
fn register_builtins(registry: &CompositionRegistry) -> RunResult<()> {
    let names: [(ClassId, &str); 10] = [
        (builtin::BOOL_CLASS, "Boolean"),
        (builtin::INT_CLASS, "Int"),
        (builtin::FLOAT_CLASS, "Float"),
        (builtin::STR_CLASS, "String"),
        (builtin::TUPLE_CLASS, "Tuple"),
        (builtin::FN_CLASS, "Function"),
        (builtin::FUTURE_CLASS, "Future"),
        (builtin::REF_CLASS, "Ref"),
        (builtin::EXCEPTION_CLASS, "Exception"),
        (builtin::SERVICE_CLASS, "Service"),
    ];
    for (id, name) in names {
        registry.register_class(Arc::new(ClassDef {
            id,
            name: name.to_owned(),
            superclass: None,
            type_of: TypeId::new(id.raw()),
            properties: Vec::new(),
            methods: Vec::new(),
            default_ctor: None,
            auto_init: None,
            singleton: false,
            immutable: false,
        }));
        let comp = registry.ensure_canonical(id)?;
        debug_assert_eq!(comp.raw(), id.raw());
    }
    Ok(())
}
