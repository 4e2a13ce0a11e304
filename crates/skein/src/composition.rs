//! Composition registry.
//!
//! A composition is the runtime record for a class plus its actual type
//! arguments: method resolution chains, property descriptors, the
//! default-constructor list, and cached subtype answers. Compositions are
//! interned in an arena and referenced by stable index, which keeps handles
//! trivially transportable across services.

use std::{cell::RefCell, fmt, rc::Rc, sync::Arc};

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{
    exception::{RunResult, VmFault},
    image::{ClassDef, MethodBody},
    op::NativeMethod,
};

macro_rules! id_newtype {
    ($(#[$doc:meta])* $name:ident, $raw:ty) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name($raw);

        impl $name {
            #[inline]
            pub const fn new(id: $raw) -> Self {
                Self(id)
            }

            #[inline]
            pub const fn raw(self) -> $raw {
                self.0
            }
        }
    };
}

id_newtype!(
    /// Canonical class identity, assigned by the loader.
    ClassId,
    u32
);
id_newtype!(
    /// A type known to the type oracle.
    TypeId,
    u32
);
id_newtype!(
    /// Stable index of an interned composition.
    CompositionId,
    u32
);
id_newtype!(
    /// Property (and backing field) identifier.
    PropertyId,
    u32
);
id_newtype!(
    /// Method signature identifier.
    MethodId,
    u32
);

/// Actual type-argument lists are short; two inline entries cover most.
pub type TypeArgs = SmallVec<[TypeId; 2]>;

/// Well-known method signatures the runtime dispatches on. Loader-assigned
/// method ids start at [`methods::FIRST_IMAGE_METHOD`].
pub mod methods {
    use super::MethodId;

    /// `equals(that) -> Boolean`; overrides structural equality.
    pub const EQUALS: MethodId = MethodId::new(0);
    /// `compare(that) -> Ordered`; overrides structural ordering.
    pub const COMPARE: MethodId = MethodId::new(1);
    /// The parameterless primary constructor of singleton classes.
    pub const CONSTRUCT: MethodId = MethodId::new(2);
    /// `close()`; invoked by scoped-resource unwinding.
    pub const CLOSE: MethodId = MethodId::new(3);
    /// `describe() -> String`; diagnostics rendering.
    pub const DESCRIBE: MethodId = MethodId::new(4);

    /// First method id available to loader-assigned signatures.
    pub const FIRST_IMAGE_METHOD: u32 = 16;
}

/// The subtype/compatibility analyzer, treated as an oracle.
///
/// The runtime consults it for guard matching, equality and conversion; it
/// never computes subtyping itself.
pub trait TypeOracle {
    /// True when `sub` is a subtype of (or equal to) `sup`.
    fn is_subtype(&self, sub: TypeId, sup: TypeId) -> bool;
}

/// A table-driven oracle: explicit edges plus reflexivity and transitivity.
///
/// Hosts with a real analyzer implement [`TypeOracle`] directly; this is
/// the default used by the CLI and tests.
#[derive(Default)]
pub struct SubtypeTable {
    supers: AHashMap<TypeId, SmallVec<[TypeId; 2]>>,
}

impl SubtypeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `sub <: sup`.
    pub fn add_edge(&mut self, sub: TypeId, sup: TypeId) {
        self.supers.entry(sub).or_default().push(sup);
    }
}

impl TypeOracle for SubtypeTable {
    fn is_subtype(&self, sub: TypeId, sup: TypeId) -> bool {
        if sub == sup {
            return true;
        }
        let Some(direct) = self.supers.get(&sub) else {
            return false;
        };
        direct.iter().any(|&mid| self.is_subtype(mid, sup))
    }
}

/// One entry in a method resolution chain.
#[derive(Clone)]
pub enum MethodImpl {
    /// Interpreted bytecode.
    Body(Arc<MethodBody>),
    /// A registered native handler; obeys the op outcome protocol.
    Native(NativeMethod),
}

impl MethodImpl {
    /// True for the native fast path.
    #[inline]
    pub fn is_native(&self) -> bool {
        matches!(self, Self::Native(_))
    }
}

impl fmt::Debug for MethodImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Body(body) => write!(f, "Body({})", body.name),
            Self::Native(_) => write!(f, "Native"),
        }
    }
}

/// Method resolution chain: leaf-most implementation first.
#[derive(Debug, Clone)]
pub struct CallChain {
    imps: SmallVec<[MethodImpl; 1]>,
}

impl CallChain {
    pub fn new(imps: SmallVec<[MethodImpl; 1]>) -> Self {
        Self { imps }
    }

    /// The entry dispatch selects.
    #[inline]
    pub fn top(&self) -> &MethodImpl {
        &self.imps[0]
    }

    /// True when the dispatched entry bypasses bytecode.
    #[inline]
    pub fn is_native(&self) -> bool {
        self.top().is_native()
    }

    /// The `super` entry below `depth`, if any.
    pub fn at(&self, depth: usize) -> Option<&MethodImpl> {
        self.imps.get(depth)
    }
}

/// Resolved property descriptor.
#[derive(Debug, Clone)]
pub struct PropertyDef {
    pub id: PropertyId,
    pub name: String,
    /// Declared type, consulted for equality and guard capture.
    pub declared: TypeId,
    /// The backing field stores a reference wrapper rather than the value.
    pub is_ref: bool,
    pub read_only: bool,
    /// Cross-service property ops on atomic properties are permitted.
    pub atomic: bool,
    /// Resolved getter, if the property declares one.
    pub getter: Option<MethodImpl>,
    /// Resolved setter, if the property declares one.
    pub setter: Option<MethodImpl>,
    /// Whether instances carry a backing field for this property.
    pub has_field: bool,
}

/// The runtime record for one class + actual type arguments.
pub struct Composition {
    pub id: CompositionId,
    pub class: ClassId,
    pub class_name: String,
    pub type_args: TypeArgs,
    /// The oracle's type for values of this composition.
    pub type_of: TypeId,
    methods: AHashMap<MethodId, CallChain>,
    properties: AHashMap<PropertyId, Rc<PropertyDef>>,
    /// Field ids in declared order, root class first.
    pub field_order: Vec<PropertyId>,
    /// Default constructors in superclass-first order.
    pub default_ctors: Vec<Arc<MethodBody>>,
    /// Auto-initializer run before the default-constructor chain, if any.
    pub auto_init: Option<Arc<MethodBody>>,
    pub singleton: bool,
    /// Instances freeze when construction flips them to public access.
    pub immutable: bool,
    subtype_cache: RefCell<AHashMap<TypeId, bool>>,
}

impl Composition {
    /// Resolved call chain for a method signature.
    pub fn method_chain(&self, method: MethodId) -> Option<&CallChain> {
        self.methods.get(&method)
    }

    /// Resolved property descriptor.
    pub fn property(&self, prop: PropertyId) -> Option<&Rc<PropertyDef>> {
        self.properties.get(&prop)
    }

    /// Cached oracle query: is this composition's type a subtype of `sup`?
    pub fn is_type(&self, oracle: &dyn TypeOracle, sup: TypeId) -> bool {
        if let Some(&answer) = self.subtype_cache.borrow().get(&sup) {
            return answer;
        }
        let answer = oracle.is_subtype(self.type_of, sup);
        self.subtype_cache.borrow_mut().insert(sup, answer);
        answer
    }
}

impl fmt::Debug for Composition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Composition")
            .field("id", &self.id)
            .field("class", &self.class_name)
            .field("type_args", &self.type_args)
            .finish()
    }
}

/// Interning arena of compositions.
///
/// Write-mostly-once: classes are registered at load, compositions are
/// created on first use and then only read.
pub struct CompositionRegistry {
    classes: RefCell<AHashMap<ClassId, Arc<ClassDef>>>,
    arena: RefCell<Vec<Rc<Composition>>>,
    index: RefCell<AHashMap<(ClassId, TypeArgs), CompositionId>>,
}

impl Default for CompositionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CompositionRegistry {
    pub fn new() -> Self {
        Self {
            classes: RefCell::new(AHashMap::new()),
            arena: RefCell::new(Vec::new()),
            index: RefCell::new(AHashMap::new()),
        }
    }

    /// Registers a loader-supplied class definition.
    pub fn register_class(&self, class: Arc<ClassDef>) {
        self.classes.borrow_mut().insert(class.id, class);
    }

    pub fn class(&self, id: ClassId) -> Option<Arc<ClassDef>> {
        self.classes.borrow().get(&id).cloned()
    }

    /// Interns the composition for `(class, type_args)`, building its
    /// resolution tables on first request.
    pub fn ensure(&self, class: ClassId, type_args: TypeArgs) -> RunResult<CompositionId> {
        if let Some(&id) = self.index.borrow().get(&(class, type_args.clone())) {
            return Ok(id);
        }
        let composition = self.build(class, type_args.clone())?;
        let mut arena = self.arena.borrow_mut();
        let id = CompositionId::new(u32::try_from(arena.len()).expect("composition arena overflow"));
        arena.push(Rc::new(Composition { id, ..composition }));
        self.index.borrow_mut().insert((class, type_args), id);
        Ok(id)
    }

    /// Interns the canonical (no type arguments) composition for a class.
    pub fn ensure_canonical(&self, class: ClassId) -> RunResult<CompositionId> {
        self.ensure(class, TypeArgs::new())
    }

    /// Looks up a composition by stable index.
    pub fn get(&self, id: CompositionId) -> Rc<Composition> {
        Rc::clone(&self.arena.borrow()[id.raw() as usize])
    }

    /// Builds the resolution tables by walking the superclass chain.
    fn build(&self, class: ClassId, type_args: TypeArgs) -> RunResult<Composition> {
        let classes = self.classes.borrow();

        // Chain from leaf to root.
        let mut chain: Vec<Arc<ClassDef>> = Vec::new();
        let mut cursor = Some(class);
        while let Some(id) = cursor {
            let def = classes
                .get(&id)
                .ok_or_else(|| VmFault::Missing(format!("class #{}", id.raw())))?;
            cursor = def.superclass;
            chain.push(Arc::clone(def));
        }
        let leaf = Arc::clone(&chain[0]);

        // Method chains: leaf-most implementation first, supers below.
        let mut methods: AHashMap<MethodId, CallChain> = AHashMap::new();
        for def in &chain {
            for decl in &def.methods {
                match methods.get_mut(&decl.id) {
                    Some(existing) => existing.imps.push(decl.imp.clone()),
                    None => {
                        methods.insert(decl.id, CallChain::new(SmallVec::from_iter([decl.imp.clone()])));
                    }
                }
            }
        }

        // Properties and field order: root class fields first, then each
        // subclass in declaration order. Leaf-most accessors win.
        let mut properties: AHashMap<PropertyId, Rc<PropertyDef>> = AHashMap::new();
        let mut field_order: Vec<PropertyId> = Vec::new();
        for def in chain.iter().rev() {
            for decl in &def.properties {
                if decl.has_field && !field_order.contains(&decl.id) {
                    field_order.push(decl.id);
                }
                properties.insert(decl.id, Rc::new(decl.clone()));
            }
        }

        // Default constructors, superclass-first.
        let default_ctors: Vec<Arc<MethodBody>> = chain
            .iter()
            .rev()
            .filter_map(|def| def.default_ctor.clone())
            .collect();

        Ok(Composition {
            id: CompositionId::new(0), // reassigned by the arena
            class,
            class_name: leaf.name.clone(),
            type_args,
            type_of: leaf.type_of,
            methods,
            properties,
            field_order,
            default_ctors,
            auto_init: leaf.auto_init.clone(),
            singleton: leaf.singleton,
            immutable: leaf.immutable,
            subtype_cache: RefCell::new(AHashMap::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{ClassDef, MethodDecl};
    use crate::op::Op;

    fn body(name: &str) -> Arc<MethodBody> {
        Arc::new(MethodBody::new(name, vec![Op::Return0], 1, 0, 0))
    }

    fn class(id: u32, name: &str, superclass: Option<u32>, default_ctor: bool) -> Arc<ClassDef> {
        Arc::new(ClassDef {
            id: ClassId::new(id),
            name: name.to_owned(),
            superclass: superclass.map(ClassId::new),
            type_of: TypeId::new(id),
            properties: Vec::new(),
            methods: vec![MethodDecl {
                id: MethodId::new(1),
                imp: MethodImpl::Body(body(&format!("{name}.m"))),
            }],
            default_ctor: default_ctor.then(|| body(&format!("{name}.default"))),
            auto_init: None,
            singleton: false,
            immutable: false,
        })
    }

    #[test]
    fn interning_returns_stable_indices() {
        let registry = CompositionRegistry::new();
        registry.register_class(class(1, "Base", None, false));
        let a = registry.ensure_canonical(ClassId::new(1)).unwrap();
        let b = registry.ensure_canonical(ClassId::new(1)).unwrap();
        assert_eq!(a, b);
        let with_args = registry
            .ensure(ClassId::new(1), TypeArgs::from_iter([TypeId::new(9)]))
            .unwrap();
        assert_ne!(a, with_args);
    }

    #[test]
    fn default_ctors_are_superclass_first() {
        let registry = CompositionRegistry::new();
        registry.register_class(class(1, "Base", None, true));
        registry.register_class(class(2, "Derived", Some(1), true));
        let id = registry.ensure_canonical(ClassId::new(2)).unwrap();
        let comp = registry.get(id);
        let names: Vec<&str> = comp.default_ctors.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["Base.default", "Derived.default"]);
    }

    #[test]
    fn method_chain_prefers_leaf_impl() {
        let registry = CompositionRegistry::new();
        registry.register_class(class(1, "Base", None, false));
        registry.register_class(class(2, "Derived", Some(1), false));
        let id = registry.ensure_canonical(ClassId::new(2)).unwrap();
        let comp = registry.get(id);
        let chain = comp.method_chain(MethodId::new(1)).unwrap();
        match chain.top() {
            MethodImpl::Body(body) => assert_eq!(body.name, "Derived.m"),
            MethodImpl::Native(_) => panic!("expected bytecode entry"),
        }
        match chain.at(1).unwrap() {
            MethodImpl::Body(body) => assert_eq!(body.name, "Base.m"),
            MethodImpl::Native(_) => panic!("expected bytecode entry"),
        }
    }

    #[test]
    fn subtype_answers_are_cached() {
        let registry = CompositionRegistry::new();
        registry.register_class(class(1, "Base", None, false));
        let id = registry.ensure_canonical(ClassId::new(1)).unwrap();
        let comp = registry.get(id);

        let mut table = SubtypeTable::new();
        table.add_edge(TypeId::new(1), TypeId::new(100));
        assert!(comp.is_type(&table, TypeId::new(100)));
        // Cached answer survives an oracle that would now disagree.
        let empty = SubtypeTable::new();
        assert!(comp.is_type(&empty, TypeId::new(100)));
    }
}
