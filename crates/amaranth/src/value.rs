//! The tagged value type and the lightweight reference kinds it can carry.
//!
//! `Value` is the request-local view of a runtime value: trivial kinds are
//! stored inline, mutable composites live in the [`Heap`](crate::heap::Heap)
//! and are referenced by `HeapId`, and already-promoted composites are
//! referenced by [`StrRef`]/[`ArrRef`] handles into shared storage.

use std::fmt;

use crate::{
    arena::UncountedArena,
    heap::{Heap, HeapId},
    shared::{ArrRef, StrRef},
};

/// Descriptor for a function reference, owned by the embedding runtime.
///
/// Function bodies, signatures, and the rest of a real function object are
/// out of scope here; promotion only needs a stable name and the persistence
/// bit. Persistent functions outlive every request and may be shared freely.
#[derive(Debug)]
pub struct FuncInfo {
    name: &'static str,
    persistent: bool,
}

impl FuncInfo {
    #[must_use]
    pub const fn new(name: &'static str, persistent: bool) -> Self {
        Self { name, persistent }
    }
}

/// Copyable handle to a [`FuncInfo`].
#[derive(Debug, Clone, Copy)]
pub struct FuncRef(&'static FuncInfo);

impl FuncRef {
    #[must_use]
    pub fn new(info: &'static FuncInfo) -> Self {
        Self(info)
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        self.0.name
    }

    /// Whether the function outlives every request and may be shared as-is.
    #[must_use]
    pub fn is_persistent(self) -> bool {
        self.0.persistent
    }

    #[must_use]
    pub fn ptr_eq(self, other: Self) -> bool {
        std::ptr::eq(self.0, other.0)
    }
}

/// Descriptor for a class reference, owned by the embedding runtime.
#[derive(Debug)]
pub struct ClassInfo {
    name: &'static str,
    persistent: bool,
}

impl ClassInfo {
    #[must_use]
    pub const fn new(name: &'static str, persistent: bool) -> Self {
        Self { name, persistent }
    }
}

/// Copyable handle to a [`ClassInfo`].
#[derive(Debug, Clone, Copy)]
pub struct ClassRef(&'static ClassInfo);

impl ClassRef {
    #[must_use]
    pub fn new(info: &'static ClassInfo) -> Self {
        Self(info)
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        self.0.name
    }

    /// Whether the class binding outlives every request.
    ///
    /// Non-persistent classes lose their live binding on promotion and are
    /// demoted to a lazy-class descriptor carrying only the name.
    #[must_use]
    pub fn is_persistent(self) -> bool {
        self.0.persistent
    }

    #[must_use]
    pub fn ptr_eq(self, other: Self) -> bool {
        std::ptr::eq(self.0, other.0)
    }
}

/// Key of a map- or set-shaped container: an integer or an owned string.
///
/// Keys are plain data owned by the container, not refcounted values. On
/// promotion, string keys canonicalize through the static string table and
/// otherwise get their own uncounted copy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    Int(i64),
    Str(Box<str>),
}

impl Key {
    #[must_use]
    pub fn str(content: &str) -> Self {
        Self::Str(content.into())
    }
}

/// One tagged value slot.
///
/// `Clone`/`Copy` are derived because every variant is either inline data or
/// a copyable handle; copying does NOT adjust any reference count. Use
/// `drop_with_heap` to give up an owned reference, mirroring the manual
/// refcount discipline of the mutable heap.
#[derive(Debug, Clone, Copy)]
pub enum Value {
    /// An uninitialized slot. Normalized to `Null` on promotion.
    Uninit,
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    /// A mutable, refcounted string in the request-local heap.
    Str(HeapId),
    /// A mutable, refcounted container in the request-local heap.
    Array(HeapId),
    /// An immutable string in shared storage, independently counted.
    SharedStr(StrRef),
    /// An immutable container in shared storage, independently counted.
    SharedArray(ArrRef),
    /// A function reference. Persistent functions are immortal.
    Func(FuncRef),
    /// A live class reference.
    Class(ClassRef),
    /// A lazy-class descriptor: just the class name, always immortal.
    LazyClass(StrRef),
    /// A packed (class, method) pair.
    ClsMeth(ClassRef, FuncRef),
    /// The legacy record kind. Promotion rejects it with a catchable error.
    Record(HeapId),
    /// An object instance. Must never reach promotion.
    Object(HeapId),
    /// An external resource handle. Must never reach promotion.
    Resource(HeapId),
    /// A reified-function wrapper. Must never reach promotion.
    RFunc(HeapId),
    /// A reified (class, method) wrapper. Must never reach promotion.
    RClsMeth(HeapId),
}

impl Value {
    /// Returns the kind tag for this value.
    #[must_use]
    pub fn kind(self) -> ValueKind {
        match self {
            Self::Uninit => ValueKind::Uninit,
            Self::Null => ValueKind::Null,
            Self::Bool(_) => ValueKind::Bool,
            Self::Int(_) => ValueKind::Int,
            Self::Double(_) => ValueKind::Double,
            Self::Str(_) => ValueKind::Str,
            Self::Array(_) => ValueKind::Array,
            Self::SharedStr(_) => ValueKind::SharedStr,
            Self::SharedArray(_) => ValueKind::SharedArray,
            Self::Func(_) => ValueKind::Func,
            Self::Class(_) => ValueKind::Class,
            Self::LazyClass(_) => ValueKind::LazyClass,
            Self::ClsMeth(..) => ValueKind::ClsMeth,
            Self::Record(_) => ValueKind::Record,
            Self::Object(_) => ValueKind::Object,
            Self::Resource(_) => ValueKind::Resource,
            Self::RFunc(_) => ValueKind::RFunc,
            Self::RClsMeth(_) => ValueKind::RClsMeth,
        }
    }

    /// Gives up the reference this value owns.
    ///
    /// Heap references decrement their slot's count (freeing recursively at
    /// zero); shared references decrement their independent count; inline
    /// kinds need no cleanup.
    pub fn drop_with_heap<A: UncountedArena>(self, heap: &mut Heap, arena: &A) {
        match self {
            Self::Str(id)
            | Self::Array(id)
            | Self::Record(id)
            | Self::Object(id)
            | Self::Resource(id)
            | Self::RFunc(id)
            | Self::RClsMeth(id) => heap.dec_ref(id, arena),
            Self::SharedStr(s) => s.release(arena),
            Self::SharedArray(a) => a.release(arena),
            Self::Uninit
            | Self::Null
            | Self::Bool(_)
            | Self::Int(_)
            | Self::Double(_)
            | Self::Func(_)
            | Self::Class(_)
            | Self::LazyClass(_)
            | Self::ClsMeth(..) => {}
        }
    }
}

/// Kind tag of a [`Value`], used in error and invariant messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::IntoStaticStr)]
pub enum ValueKind {
    Uninit,
    Null,
    Bool,
    Int,
    Double,
    Str,
    Array,
    SharedStr,
    SharedArray,
    Func,
    Class,
    LazyClass,
    ClsMeth,
    Record,
    Object,
    Resource,
    RFunc,
    RClsMeth,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(<&'static str>::from(*self))
    }
}
