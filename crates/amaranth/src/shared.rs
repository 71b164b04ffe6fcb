//! Uncounted composites: immutable strings and containers in shared storage.
//!
//! A promoted value is a deep copy living in a block from the
//! [`UncountedArena`], headed by an independent atomic count. Content is
//! never mutated after the conversion that created it, so concurrent readers
//! need no synchronization; only the count is contended. Immortal values
//! (canonical empties, interned strings) carry a sentinel count and are never
//! released.
//!
//! Handles ([`StrRef`], [`ArrRef`]) are plain copyable pointers. Copying a
//! handle does not adjust the count: ownership is explicit through
//! `acquire`/`release`, mirroring the manual refcount discipline of the
//! mutable heap.

use std::{
    alloc::Layout,
    ptr::{self, NonNull},
    sync::{
        LazyLock, OnceLock,
        atomic::{AtomicU32, Ordering},
    },
};

use crate::{
    arena::UncountedArena,
    heap::Shape,
    value::{ClassRef, FuncRef, Value},
};

/// Count value marking a block that is never released.
const IMMORTAL: u32 = u32::MAX;

/// Count value installed at the zero transition, for the duration of the
/// recursive teardown. A cyclic structure releases edges back into itself
/// while it is being torn down; the sentinel turns those inner decrements
/// into no-ops so each block is freed exactly once and the walk terminates.
const RELEASING: u32 = u32::MAX - 1;

/// Independent reference count carried by every uncounted composite.
///
/// All operations are sequentially consistent so two threads racing to
/// decrement the same value agree on which one saw the zero transition.
#[derive(Debug)]
struct RefCount(AtomicU32);

impl RefCount {
    fn new() -> Self {
        Self(AtomicU32::new(1))
    }

    fn immortal() -> Self {
        Self(AtomicU32::new(IMMORTAL))
    }

    fn acquire(&self) {
        // Immortality is decided at construction and never changes, so a
        // plain load is enough to route immortal blocks to the no-op path.
        if self.0.load(Ordering::SeqCst) == IMMORTAL {
            return;
        }
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrements the count. Returns true exactly once, for the holder that
    /// saw the transition to zero; immortal and mid-teardown blocks always
    /// return false.
    fn release(&self) -> bool {
        let current = self.0.load(Ordering::SeqCst);
        if current == IMMORTAL || current == RELEASING {
            return false;
        }
        self.0.fetch_sub(1, Ordering::SeqCst) == 1
    }

    /// Installs the teardown sentinel. Called only by the release that
    /// observed the zero transition, before walking children.
    fn begin_teardown(&self) {
        self.0.store(RELEASING, Ordering::SeqCst);
    }

    fn load(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}

/// An immutable string in shared storage.
#[derive(Debug)]
pub(crate) struct UncountedString {
    count: RefCount,
    content: Box<str>,
}

impl UncountedString {
    fn layout() -> Layout {
        Layout::new::<Self>()
    }
}

/// Copyable handle to an [`UncountedString`] block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrRef(NonNull<UncountedString>);

// SAFETY: the pointee is immutable after construction and freed only at its
// count's zero transition; every holder of a StrRef either owns one count or
// points at an immortal block, so the pointee outlives the handle.
unsafe impl Send for StrRef {}
// SAFETY: as above; shared access only ever reads immutable content or the
// atomic count.
unsafe impl Sync for StrRef {}

impl StrRef {
    /// Copies `content` into a fresh arena block with a count of one.
    pub(crate) fn allocate<A: UncountedArena>(arena: &A, content: &str) -> Self {
        let ptr = arena.allocate(UncountedString::layout()).cast::<UncountedString>();
        // SAFETY: ptr is a fresh, properly aligned block for this layout;
        // write initializes it before any read.
        unsafe {
            ptr.write(UncountedString {
                count: RefCount::new(),
                content: content.into(),
            });
        }
        Self(ptr)
    }

    /// Creates an immortal string outside the arena. Never released.
    pub(crate) fn immortal(content: &str) -> Self {
        Self(NonNull::from(Box::leak(Box::new(UncountedString {
            count: RefCount::immortal(),
            content: content.into(),
        }))))
    }

    fn inner(&self) -> &UncountedString {
        // SAFETY: see the Send/Sync justification - a live handle implies a
        // live block.
        unsafe { self.0.as_ref() }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.inner().content
    }

    #[must_use]
    pub fn is_immortal(self) -> bool {
        self.inner().count.load() == IMMORTAL
    }

    /// Current independent count. Test observability; racy by nature.
    #[must_use]
    pub fn count(self) -> u32 {
        self.inner().count.load()
    }

    #[must_use]
    pub fn ptr_eq(self, other: Self) -> bool {
        self.0 == other.0
    }

    /// Takes one additional count on this string.
    pub fn acquire(self) {
        self.inner().count.acquire();
    }

    /// Gives up one count; frees the block at the zero transition. Strings
    /// have no children, so teardown is a single free.
    pub fn release<A: UncountedArena>(self, arena: &A) {
        if !self.inner().count.release() {
            return;
        }
        // SAFETY: this holder saw the zero transition, so no other reference
        // exists; the block was allocated by StrRef::allocate with this
        // layout (immortal blocks never reach this point).
        unsafe {
            ptr::drop_in_place(self.0.as_ptr());
            arena.free(self.0.cast(), UncountedString::layout());
        }
    }
}

/// Key of a shared map or set entry.
#[derive(Debug, Clone, Copy)]
pub enum SharedKey {
    Int(i64),
    Str(StrRef),
}

impl SharedKey {
    pub fn release<A: UncountedArena>(self, arena: &A) {
        if let Self::Str(s) = self {
            s.release(arena);
        }
    }
}

/// The uncounted counterpart of a tagged value.
///
/// This is what the converters return; callers assign it back into their
/// slot via `Value::from`. It can only describe kinds that are legal inside
/// shared storage, so a shared container's entries are shared-safe by
/// construction.
#[derive(Debug, Clone, Copy)]
pub enum SharedValue {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    Str(StrRef),
    Array(ArrRef),
    Func(FuncRef),
    Class(ClassRef),
    LazyClass(StrRef),
    ClsMeth(ClassRef, FuncRef),
}

impl SharedValue {
    /// Gives up the count this entry owns, if any.
    pub fn release<A: UncountedArena>(self, arena: &A) {
        match self {
            Self::Str(s) => s.release(arena),
            Self::Array(a) => a.release(arena),
            Self::Null
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

impl From<SharedValue> for Value {
    /// Retags a converted result into a tagged value slot.
    fn from(shared: SharedValue) -> Self {
        match shared {
            SharedValue::Null => Self::Null,
            SharedValue::Bool(b) => Self::Bool(b),
            SharedValue::Int(i) => Self::Int(i),
            SharedValue::Double(d) => Self::Double(d),
            SharedValue::Str(s) => Self::SharedStr(s),
            SharedValue::Array(a) => Self::SharedArray(a),
            SharedValue::Func(f) => Self::Func(f),
            SharedValue::Class(c) => Self::Class(c),
            SharedValue::LazyClass(n) => Self::LazyClass(n),
            SharedValue::ClsMeth(c, f) => Self::ClsMeth(c, f),
        }
    }
}

/// Entries of a shared container, one layout per shape.
#[derive(Debug)]
pub enum SharedEntries {
    List(Box<[SharedValue]>),
    Map(Box<[(SharedKey, SharedValue)]>),
    Set(Box<[SharedKey]>),
}

impl SharedEntries {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::List(items) => items.len(),
            Self::Map(pairs) => pairs.len(),
            Self::Set(keys) => keys.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release_children<A: UncountedArena>(&self, arena: &A) {
        match self {
            Self::List(items) => {
                for &item in items {
                    item.release(arena);
                }
            }
            Self::Map(pairs) => {
                for &(key, value) in pairs {
                    key.release(arena);
                    value.release(arena);
                }
            }
            Self::Set(keys) => {
                for &key in keys {
                    key.release(arena);
                }
            }
        }
    }
}

/// An immutable container in shared storage.
///
/// Entries are installed once, after the block is allocated: the conversion
/// records the block in its sharing map before recursing into children, so a
/// cyclic edge can point at the block while it is still being filled. Until
/// the top-level conversion returns, the block is visible to the converting
/// thread only; afterwards the entries are frozen.
#[derive(Debug)]
pub(crate) struct UncountedArray {
    count: RefCount,
    shape: Shape,
    legacy: bool,
    /// Root marker requested by cache callers: the subtree below this block
    /// is fully shared, so a cache slot may hand it out without deeper
    /// inspection. Always false for nested blocks.
    cache_root: bool,
    entries: OnceLock<SharedEntries>,
}

impl UncountedArray {
    fn layout() -> Layout {
        Layout::new::<Self>()
    }
}

/// Copyable handle to an [`UncountedArray`] block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrRef(NonNull<UncountedArray>);

// SAFETY: same argument as StrRef - immutable pointee, freed only at the
// count's zero transition, holders own counts or point at immortals.
unsafe impl Send for ArrRef {}
// SAFETY: as above.
unsafe impl Sync for ArrRef {}

impl ArrRef {
    /// Allocates an arena block with a count of one and no entries yet.
    /// The caller must install entries exactly once via `set_entries`.
    pub(crate) fn allocate<A: UncountedArena>(arena: &A, shape: Shape, legacy: bool, cache_root: bool) -> Self {
        let ptr = arena.allocate(UncountedArray::layout()).cast::<UncountedArray>();
        // SAFETY: ptr is a fresh, properly aligned block for this layout;
        // write initializes it before any read.
        unsafe {
            ptr.write(UncountedArray {
                count: RefCount::new(),
                shape,
                legacy,
                cache_root,
                entries: OnceLock::new(),
            });
        }
        Self(ptr)
    }

    /// Installs the converted entries.
    pub(crate) fn set_entries(self, entries: SharedEntries) {
        self.inner()
            .entries
            .set(entries)
            .expect("ArrRef::set_entries: entries already installed");
    }

    fn inner(&self) -> &UncountedArray {
        // SAFETY: see the Send/Sync justification - a live handle implies a
        // live block.
        unsafe { self.0.as_ref() }
    }

    #[must_use]
    pub fn shape(&self) -> Shape {
        self.inner().shape
    }

    #[must_use]
    pub fn is_legacy(&self) -> bool {
        self.inner().legacy
    }

    /// Whether this block carries the fully-shared root marker.
    #[must_use]
    pub fn is_cache_root(&self) -> bool {
        self.inner().cache_root
    }

    /// The converted entries.
    ///
    /// # Panics
    /// Panics if called on a block whose conversion has not finished; blocks
    /// are only handed out with entries installed.
    #[must_use]
    pub fn entries(&self) -> &SharedEntries {
        self.inner()
            .entries
            .get()
            .expect("ArrRef::entries: read before initialization")
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    #[must_use]
    pub fn is_immortal(self) -> bool {
        self.inner().count.load() == IMMORTAL
    }

    /// Current independent count. Test observability; racy by nature.
    #[must_use]
    pub fn count(self) -> u32 {
        self.inner().count.load()
    }

    #[must_use]
    pub fn ptr_eq(self, other: Self) -> bool {
        self.0 == other.0
    }

    /// Takes one additional count on this container.
    pub fn acquire(self) {
        self.inner().count.acquire();
    }

    /// Gives up one count; at the zero transition, recursively releases the
    /// children this block owns, then frees the block itself.
    pub fn release<A: UncountedArena>(self, arena: &A) {
        {
            let inner = self.inner();
            if !inner.count.release() {
                return;
            }
            inner.count.begin_teardown();
            // An aborted conversion releases its block before entries were
            // installed; there are no children to walk in that case.
            if let Some(entries) = inner.entries.get() {
                entries.release_children(arena);
            }
        }
        // SAFETY: this holder saw the zero transition, so no other reference
        // exists; the block was allocated by ArrRef::allocate with this
        // layout (immortal blocks never reach this point).
        unsafe {
            ptr::drop_in_place(self.0.as_ptr());
            arena.free(self.0.cast(), UncountedArray::layout());
        }
    }
}

/// Decrements one tagged value slot, routing by tag.
///
/// Shared strings and containers give up one independent count; trivial and
/// reference-only kinds need no decrement. Calling this on a still-counted
/// heap value is a caller bug.
pub fn release_slot<A: UncountedArena>(value: Value, arena: &A) {
    match value {
        Value::SharedStr(s) => s.release(arena),
        Value::SharedArray(a) => a.release(arena),
        Value::Str(_)
        | Value::Array(_)
        | Value::Record(_)
        | Value::Object(_)
        | Value::Resource(_)
        | Value::RFunc(_)
        | Value::RClsMeth(_) => {
            debug_assert!(false, "release_slot: still-counted {kind} value", kind = value.kind());
        }
        Value::Uninit
        | Value::Null
        | Value::Bool(_)
        | Value::Int(_)
        | Value::Double(_)
        | Value::Func(_)
        | Value::Class(_)
        | Value::LazyClass(_)
        | Value::ClsMeth(..) => {}
    }
}

fn leak_empty(shape: Shape, legacy: bool) -> ArrRef {
    let entries = match shape {
        Shape::List => SharedEntries::List(Vec::new().into_boxed_slice()),
        Shape::Map => SharedEntries::Map(Vec::new().into_boxed_slice()),
        Shape::Set => SharedEntries::Set(Vec::new().into_boxed_slice()),
    };
    let block = Box::leak(Box::new(UncountedArray {
        count: RefCount::immortal(),
        shape,
        legacy,
        cache_root: false,
        entries: OnceLock::new(),
    }));
    block
        .entries
        .set(entries)
        .expect("leak_empty: entries already installed");
    ArrRef(NonNull::from(block))
}

static EMPTY_LIST: LazyLock<ArrRef> = LazyLock::new(|| leak_empty(Shape::List, false));
static EMPTY_LIST_LEGACY: LazyLock<ArrRef> = LazyLock::new(|| leak_empty(Shape::List, true));
static EMPTY_MAP: LazyLock<ArrRef> = LazyLock::new(|| leak_empty(Shape::Map, false));
static EMPTY_MAP_LEGACY: LazyLock<ArrRef> = LazyLock::new(|| leak_empty(Shape::Map, true));
static EMPTY_SET: LazyLock<ArrRef> = LazyLock::new(|| leak_empty(Shape::Set, false));

/// The canonical immortal empty container for a shape and legacy bit.
///
/// Sets carry no legacy bit, so both flag values collapse to one singleton.
#[must_use]
pub fn empty_array(shape: Shape, legacy: bool) -> ArrRef {
    match (shape, legacy) {
        (Shape::List, false) => *EMPTY_LIST,
        (Shape::List, true) => *EMPTY_LIST_LEGACY,
        (Shape::Map, false) => *EMPTY_MAP,
        (Shape::Map, true) => *EMPTY_MAP_LEGACY,
        (Shape::Set, _) => *EMPTY_SET,
    }
}

static EMPTY_STRING: LazyLock<StrRef> = LazyLock::new(|| StrRef::immortal(""));

/// The canonical immortal empty string.
#[must_use]
pub fn empty_string() -> StrRef {
    *EMPTY_STRING
}
