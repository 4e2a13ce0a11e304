//! Exception taxonomy for the runtime.
//!
//! Three tiers, per the propagation policy: *program exceptions* travel on
//! frames and unwind through guard stacks; *runtime faults* ride the same
//! unwind path but match no guard; *host errors* ([`VmFault`]) are returned
//! to the embedder as ordinary `Result`s and never enter bytecode.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use crate::{composition::TypeId, value::ObjHandle};

/// Result type alias for host-facing operations that can fail with a fault.
pub type RunResult<T> = Result<T, VmFault>;

/// Program exception kinds raised by bytecode and native operations.
///
/// A single tagged enum with a common carrier handle is used instead of a
/// class hierarchy: guard matching for built-in kinds is an equality check,
/// and user-defined exception types defer to the type oracle via the
/// carrier's composition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr, Serialize, Deserialize)]
pub enum ExcKind {
    /// An `assert` op evaluated to false.
    AssertionFailed,
    /// A write to an immutable handle or a read-only property.
    ReadOnly,
    /// An operation the target composition does not support.
    Unsupported,
    /// An index or range check failed.
    Bounds,
    /// A container was mutated while being iterated.
    ConcurrentModification,
    /// The scheduler detected an unresolvable wait cycle.
    Deadlock,
    /// A fiber exceeded its deadline.
    Timeout,
    /// A singleton initializer re-entered its own initialization.
    CircularInitialization,
    /// A user-defined exception type; the carrier handle holds the instance.
    User,
}

impl ExcKind {
    /// Returns true when an exception of this kind is caught by a guard
    /// declared for `handler`.
    ///
    /// Built-in kinds match exactly. `User` never matches another built-in
    /// kind here; user-type matching goes through the type oracle using the
    /// carrier's composition type.
    #[must_use]
    pub fn is_caught_by(self, handler: Self) -> bool {
        self == handler
    }
}

/// A program exception in flight.
///
/// Carried on the raising frame (at most one per frame) while guard stacks
/// are searched. The carrier handle, when present, is the value user code
/// observes in a handler's capture slot.
#[derive(Debug, Clone)]
pub struct VmException {
    /// Exception kind; drives guard matching for built-in kinds.
    pub kind: ExcKind,
    /// Human-readable detail, if any.
    pub message: Option<String>,
    /// The exception value itself (always set for `User` kinds).
    pub carrier: Option<ObjHandle>,
    /// Composition type of the carrier, consulted by the oracle for
    /// user-type guard matching.
    pub type_of: Option<TypeId>,
    /// Originating failure, for host errors that reach user code.
    pub cause: Option<Box<VmException>>,
    /// Fault-born exceptions are never matched by any guard.
    uncatchable: bool,
}

impl VmException {
    /// Creates an exception of the given kind with a message.
    pub fn new(kind: ExcKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
            carrier: None,
            type_of: None,
            cause: None,
            uncatchable: false,
        }
    }

    /// Creates an exception without a message.
    pub fn of(kind: ExcKind) -> Self {
        Self {
            kind,
            message: None,
            carrier: None,
            type_of: None,
            cause: None,
            uncatchable: false,
        }
    }

    /// Creates a user exception around a carrier handle of the given type.
    pub fn user(carrier: ObjHandle, type_of: TypeId) -> Self {
        Self {
            kind: ExcKind::User,
            message: None,
            carrier: Some(carrier),
            type_of: Some(type_of),
            cause: None,
            uncatchable: false,
        }
    }

    /// Creates a fault-born exception that no guard will match.
    pub fn fault(kind: ExcKind, message: impl Into<String>) -> Self {
        let mut exc = Self::new(kind, message);
        exc.uncatchable = true;
        exc
    }

    /// Attaches a cause chain.
    #[must_use]
    pub fn with_cause(mut self, cause: VmException) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Attaches a carrier handle.
    #[must_use]
    pub fn with_carrier(mut self, carrier: ObjHandle) -> Self {
        self.carrier = Some(carrier);
        self
    }

    /// Returns true when no guard may catch this exception.
    #[inline]
    pub fn is_uncatchable(&self) -> bool {
        self.uncatchable
    }
}

impl Display for VmException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        }
        if let Some(cause) = &self.cause {
            write!(f, " (caused by {cause})")?;
        }
        Ok(())
    }
}

/// Host-facing faults: loader and embedding errors that never reach
/// bytecode as catchable exceptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmFault {
    /// The module image contains an opcode byte the interpreter does not
    /// recognize; raised at load time, never at run time.
    UnknownOpcode {
        /// The unrecognized opcode byte.
        opcode: u8,
        /// Method the opcode was found in.
        method: String,
        /// Offset within the method's op vector.
        offset: usize,
    },
    /// A constant-pool entry is malformed or an index is out of range.
    CorruptPool(String),
    /// A fiber was driven through an illegal status transition.
    IllegalTransition {
        /// Status the fiber held.
        from: &'static str,
        /// Status that was requested.
        to: &'static str,
    },
    /// The host addressed a service that does not exist or has terminated.
    NoSuchService(String),
    /// The host submitted work to a container that is shutting down.
    ShuttingDown,
    /// A lookup against the image or registry failed.
    Missing(String),
}

impl Display for VmFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownOpcode { opcode, method, offset } => {
                write!(f, "unknown opcode {opcode:#04x} in `{method}` at offset {offset}")
            }
            Self::CorruptPool(detail) => write!(f, "corrupt constant pool: {detail}"),
            Self::IllegalTransition { from, to } => {
                write!(f, "illegal fiber transition {from} -> {to}")
            }
            Self::NoSuchService(name) => write!(f, "no such service: {name}"),
            Self::ShuttingDown => write!(f, "container is shutting down"),
            Self::Missing(what) => write!(f, "missing: {what}"),
        }
    }
}

impl std::error::Error for VmFault {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_kinds_match_exactly() {
        assert!(ExcKind::Bounds.is_caught_by(ExcKind::Bounds));
        assert!(!ExcKind::Bounds.is_caught_by(ExcKind::Timeout));
        assert!(!ExcKind::User.is_caught_by(ExcKind::Bounds));
    }

    #[test]
    fn fault_born_exceptions_are_uncatchable() {
        let exc = VmException::fault(ExcKind::CircularInitialization, "singleton #3");
        assert!(exc.is_uncatchable());
        assert!(!VmException::of(ExcKind::Bounds).is_uncatchable());
    }

    #[test]
    fn display_includes_cause_chain() {
        let exc = VmException::new(ExcKind::Timeout, "deadline passed")
            .with_cause(VmException::new(ExcKind::Bounds, "index 4"));
        let text = exc.to_string();
        assert!(text.contains("Timeout"));
        assert!(text.contains("caused by Bounds"));
    }
}
