//! Loader-facing immutable structures.
//!
//! The bytecode loader and constant-pool parser live outside the runtime;
//! what appears here is the interface they satisfy: a typed constant pool,
//! a class directory, and method bodies (an op vector plus slot metadata).
//! Structural validation happens at load time — a malformed image never
//! reaches the dispatch loop.

use std::sync::Arc;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::{
    composition::{ClassId, MethodId, MethodImpl, PropertyDef, TypeId},
    exception::{RunResult, VmFault},
    op::Op,
};

/// Identity of a lazily-initialized process-scope singleton constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SingletonId(u32);

impl SingletonId {
    #[inline]
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// A typed constant-pool entry.
#[derive(Debug, Clone)]
pub enum Constant {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    /// A singleton identity; resolving the handle may trigger (deferred)
    /// initialization.
    Singleton(SingletonId),
}

/// What a singleton identity names.
#[derive(Debug, Clone)]
pub enum SingletonKind {
    /// A module handle for the named class.
    Module(ClassId),
    /// A package handle for the named class.
    Package(ClassId),
    /// A static property whose initializer produces the handle.
    StaticProperty {
        /// Initializer body; run once on the main context.
        init: Arc<MethodBody>,
    },
    /// A singleton class; constructed via its parameterless constructor.
    Class(ClassId),
}

/// A singleton constant definition.
#[derive(Debug, Clone)]
pub struct SingletonDef {
    pub id: SingletonId,
    pub name: String,
    pub kind: SingletonKind,
}

/// One method's executable body: the op vector plus the frame metadata the
/// interpreter sizes activation records from.
#[derive(Debug)]
pub struct MethodBody {
    pub name: String,
    pub ops: Arc<[Op]>,
    /// Slot-array size for frames running this body (arguments included).
    pub max_vars: usize,
    /// Leading slots filled from caller arguments (`this` included when
    /// the method is virtual; it occupies slot 0).
    pub params: usize,
    /// Number of declared return values.
    pub returns: usize,
    /// Finalizer body chained by the construction pipeline, if this body
    /// is a constructor with one.
    pub finalizer: Option<Arc<MethodBody>>,
}

impl MethodBody {
    pub fn new(name: impl Into<String>, ops: Vec<Op>, max_vars: usize, params: usize, returns: usize) -> Self {
        Self {
            name: name.into(),
            ops: ops.into(),
            max_vars,
            params,
            returns,
            finalizer: None,
        }
    }

    /// Attaches a construction finalizer.
    #[must_use]
    pub fn with_finalizer(mut self, finalizer: Arc<MethodBody>) -> Self {
        self.finalizer = Some(finalizer);
        self
    }
}

/// A method declaration on a class.
#[derive(Debug, Clone)]
pub struct MethodDecl {
    pub id: MethodId,
    pub imp: MethodImpl,
}

/// A loader-supplied class definition.
///
/// Property declarations reuse [`PropertyDef`]; the registry resolves the
/// effective descriptor set along the superclass chain.
#[derive(Debug)]
pub struct ClassDef {
    pub id: ClassId,
    pub name: String,
    pub superclass: Option<ClassId>,
    /// The oracle's type for the canonical composition of this class.
    pub type_of: TypeId,
    pub properties: Vec<PropertyDef>,
    pub methods: Vec<MethodDecl>,
    /// Parameterless per-class default constructor, if declared.
    pub default_ctor: Option<Arc<MethodBody>>,
    /// Auto-initializer run before the default-constructor chain.
    pub auto_init: Option<Arc<MethodBody>>,
    pub singleton: bool,
    /// Instances freeze when construction flips them to public access.
    pub immutable: bool,
}

/// An immutable module image: constant pool, class directory, singleton
/// list, and named entry points for the host.
#[derive(Debug)]
pub struct ModuleImage {
    pub name: String,
    pub constants: Vec<Constant>,
    pub classes: Vec<Arc<ClassDef>>,
    pub singletons: Vec<SingletonDef>,
    entries: AHashMap<String, Arc<MethodBody>>,
}

impl ModuleImage {
    /// Host entry point by name.
    pub fn entry(&self, name: &str) -> Option<&Arc<MethodBody>> {
        self.entries.get(name)
    }

    pub fn entry_names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

/// Builder used by loaders (and tests) to assemble a validated image.
#[derive(Default)]
pub struct ImageBuilder {
    name: String,
    constants: Vec<Constant>,
    classes: Vec<Arc<ClassDef>>,
    singletons: Vec<SingletonDef>,
    entries: AHashMap<String, Arc<MethodBody>>,
}

impl ImageBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn constant(mut self, constant: Constant) -> Self {
        self.constants.push(constant);
        self
    }

    #[must_use]
    pub fn class(mut self, class: ClassDef) -> Self {
        self.classes.push(Arc::new(class));
        self
    }

    #[must_use]
    pub fn singleton(mut self, def: SingletonDef) -> Self {
        self.singletons.push(def);
        self
    }

    #[must_use]
    pub fn entry(mut self, name: impl Into<String>, body: Arc<MethodBody>) -> Self {
        self.entries.insert(name.into(), body);
        self
    }

    /// Validates structure and produces the immutable image.
    pub fn build(self) -> RunResult<ModuleImage> {
        let image = ModuleImage {
            name: self.name,
            constants: self.constants,
            classes: self.classes,
            singletons: self.singletons,
            entries: self.entries,
        };
        validate(&image)?;
        Ok(image)
    }
}

/// Load-time structural validation.
///
/// Jump targets, constant-pool indices and superclass references are
/// checked here so the dispatch loop can assume a well-formed image.
fn validate(image: &ModuleImage) -> RunResult<()> {
    let class_ids: Vec<ClassId> = image.classes.iter().map(|c| c.id).collect();
    for class in &image.classes {
        if let Some(sup) = class.superclass
            && !class_ids.contains(&sup)
        {
            return Err(VmFault::Missing(format!(
                "superclass #{} of `{}`",
                sup.raw(),
                class.name
            )));
        }
        for decl in &class.methods {
            if let MethodImpl::Body(body) = &decl.imp {
                validate_body(image, body)?;
            }
        }
        if let Some(body) = &class.default_ctor {
            validate_body(image, body)?;
        }
    }
    for (_, body) in &image.entries {
        validate_body(image, body)?;
    }
    Ok(())
}

fn validate_body(image: &ModuleImage, body: &MethodBody) -> RunResult<()> {
    let len = body.ops.len();
    for (offset, op) in body.ops.iter().enumerate() {
        for target in op.jump_targets() {
            if target >= len {
                return Err(VmFault::CorruptPool(format!(
                    "jump target {target} out of range in `{}` at offset {offset}",
                    body.name
                )));
            }
        }
        if let Some(pool) = op.constant_ref()
            && pool as usize >= image.constants.len()
        {
            return Err(VmFault::CorruptPool(format!(
                "constant #{pool} out of range in `{}` at offset {offset}",
                body.name
            )));
        }
    }
    if let Some(fin) = &body.finalizer {
        validate_body(image, fin)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::{Op, RetSlot};

    #[test]
    fn jump_target_out_of_range_fails_at_load() {
        let body = Arc::new(MethodBody::new("broken", vec![Op::Jump(5), Op::Return0], 1, 0, 0));
        let err = ImageBuilder::new("m").entry("main", body).build().unwrap_err();
        assert!(matches!(err, VmFault::CorruptPool(_)));
    }

    #[test]
    fn constant_ref_out_of_range_fails_at_load() {
        let body = Arc::new(MethodBody::new(
            "broken",
            vec![Op::LoadConst { pool: 3, dst: RetSlot::Slot(0) }, Op::Return0],
            1,
            0,
            0,
        ));
        let err = ImageBuilder::new("m").entry("main", body).build().unwrap_err();
        assert!(matches!(err, VmFault::CorruptPool(_)));
    }

    #[test]
    fn well_formed_image_builds() {
        let body = Arc::new(MethodBody::new("main", vec![Op::Return0], 1, 0, 0));
        let image = ImageBuilder::new("m")
            .constant(Constant::Int(1))
            .entry("main", body)
            .build()
            .unwrap();
        assert!(image.entry("main").is_some());
        assert!(image.entry("absent").is_none());
    }
}
