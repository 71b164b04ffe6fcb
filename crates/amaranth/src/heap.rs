//! Request-local, mutable, refcounted heap backing strings and containers.
//!
//! This is the counted side of promotion: values here are created and mutated
//! freely by request code, then deep-copied into shared storage when a cache
//! wants to retain them. The heap is a slot arena with a free list, modeled
//! as a slim collaborator — promotion only ever reads it, plus `dec_ref` when
//! a converted slot gives up its original reference.

use std::{
    borrow::Cow,
    sync::atomic::{AtomicUsize, Ordering},
};

use indexmap::{IndexMap, IndexSet};

use crate::{
    arena::UncountedArena,
    value::{Key, Value},
};

/// Unique identifier for values stored inside the heap arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapId(usize);

impl HeapId {
    /// Returns the raw index value.
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

/// Shape of an array-like container.
///
/// The shape survives promotion unchanged; it decides which canonical empty
/// singleton an empty container collapses to and which entry layout the
/// shared copy carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    /// Ordered list of values.
    List,
    /// Key-ordered map of key/value pairs.
    Map,
    /// Unique-key set.
    Set,
}

/// Internal representation of a mutable container.
///
/// `List`, `Dict`, and `Set` are the canonical layouts promotion knows how
/// to copy directly. The remaining variants are specialized layouts the
/// runtime uses to store common element patterns compactly; they must be
/// escalated to a canonical layout (see [`ArrayRepr::to_canonical`]) before
/// their elements can be walked.
#[derive(Debug, Clone)]
pub enum ArrayRepr {
    List(Vec<Value>),
    Dict(IndexMap<Key, Value>),
    Set(IndexSet<Key>),
    /// Specialized list layout: every element is an inline integer.
    IntVec(Vec<i64>),
    /// Specialized map layout: a fixed field list with positional values.
    StructMap { fields: Vec<Box<str>>, values: Vec<Value> },
}

impl ArrayRepr {
    /// Builds a canonical map layout from pairs, preserving insertion order.
    /// A repeated key keeps its first position and the last value.
    pub fn dict(pairs: impl IntoIterator<Item = (Key, Value)>) -> Self {
        Self::Dict(pairs.into_iter().collect())
    }

    /// Builds a canonical set layout from keys, preserving insertion order.
    pub fn set(keys: impl IntoIterator<Item = Key>) -> Self {
        Self::Set(keys.into_iter().collect())
    }

    /// Returns the container shape, independent of layout.
    #[must_use]
    pub fn shape(&self) -> Shape {
        match self {
            Self::List(_) | Self::IntVec(_) => Shape::List,
            Self::Dict(_) | Self::StructMap { .. } => Shape::Map,
            Self::Set(_) => Shape::Set,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::List(items) => items.is_empty(),
            Self::Dict(map) => map.is_empty(),
            Self::Set(keys) => keys.is_empty(),
            Self::IntVec(items) => items.is_empty(),
            Self::StructMap { values, .. } => values.is_empty(),
        }
    }

    /// Whether this is one of the three canonical layouts.
    #[must_use]
    pub fn is_canonical(&self) -> bool {
        matches!(self, Self::List(_) | Self::Dict(_) | Self::Set(_))
    }

    /// Escalates a specialized layout to its canonical counterpart.
    ///
    /// Canonical layouts are returned as-is. An escalated layout produces an
    /// owned temporary whose lifetime is the `Cow` itself, so it is released
    /// on every exit path — including error paths deep inside a recursive
    /// conversion — without per-branch cleanup. The owned temporary holds
    /// borrowed views of the element values and owns no reference counts.
    #[must_use]
    pub fn to_canonical(&self) -> Cow<'_, Self> {
        match self {
            Self::List(_) | Self::Dict(_) | Self::Set(_) => Cow::Borrowed(self),
            Self::IntVec(items) => Cow::Owned(Self::List(items.iter().map(|&i| Value::Int(i)).collect())),
            Self::StructMap { fields, values } => Cow::Owned(Self::Dict(
                fields
                    .iter()
                    .zip(values)
                    .map(|(field, &value)| (Key::Str(field.clone()), value))
                    .collect(),
            )),
        }
    }

    /// Collects the child values this container owns references to.
    ///
    /// Set layouts hold only keys, and specialized int layouts hold only
    /// inline data, so neither owns child references.
    fn child_values(&self) -> Vec<Value> {
        match self {
            Self::List(items) => items.clone(),
            Self::Dict(map) => map.values().copied().collect(),
            Self::StructMap { values, .. } => values.clone(),
            Self::Set(_) | Self::IntVec(_) => Vec::new(),
        }
    }
}

/// A mutable container: a representation plus the legacy provenance bit.
///
/// The legacy bit records that the container was migrated from the legacy
/// array type. It has no behavioral effect here beyond selecting which
/// canonical empty singleton an empty container canonicalizes to, and it is
/// copied through to the shared counterpart.
#[derive(Debug, Clone)]
pub struct ArrayData {
    pub legacy: bool,
    pub repr: ArrayRepr,
}

impl ArrayData {
    #[must_use]
    pub fn new(repr: ArrayRepr) -> Self {
        Self { legacy: false, repr }
    }

    #[must_use]
    pub fn with_legacy(repr: ArrayRepr, legacy: bool) -> Self {
        Self { legacy, repr }
    }
}

/// Payload of one heap slot.
#[derive(Debug)]
pub enum HeapData {
    /// A mutable string.
    Str(String),
    /// A mutable array-like container.
    Array(ArrayData),
    /// Stand-in payload for kinds promotion never dereferences (objects,
    /// resources, reified wrappers, records). Carries a short description
    /// for debugging only.
    Opaque(&'static str),
}

impl HeapData {
    fn child_values(&self) -> Vec<Value> {
        match self {
            Self::Str(_) | Self::Opaque(_) => Vec::new(),
            Self::Array(data) => data.repr.child_values(),
        }
    }
}

#[derive(Debug)]
struct HeapEntry {
    refcount: AtomicUsize,
    data: Option<HeapData>,
}

/// Refcounted slot arena for request-local values.
///
/// Uses a free list to reuse slots from freed values. The refcount uses
/// interior mutability so `inc_ref` needs only shared access; the heap as a
/// whole is still single-threaded — promotion reads it from the converting
/// thread only.
#[derive(Debug, Default)]
pub struct Heap {
    entries: Vec<Option<HeapEntry>>,
    /// IDs of freed slots available for reuse. Populated by `dec_ref`,
    /// consumed by `allocate`.
    free_list: Vec<HeapId>,
}

impl Heap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a new heap entry with a reference count of one.
    pub fn allocate(&mut self, data: HeapData) -> HeapId {
        let entry = HeapEntry {
            refcount: AtomicUsize::new(1),
            data: Some(data),
        };
        if let Some(id) = self.free_list.pop() {
            self.entries[id.index()] = Some(entry);
            id
        } else {
            let id = HeapId(self.entries.len());
            self.entries.push(Some(entry));
            id
        }
    }

    /// Allocates a mutable string.
    pub fn alloc_str(&mut self, content: impl Into<String>) -> HeapId {
        self.allocate(HeapData::Str(content.into()))
    }

    /// Allocates a mutable container.
    pub fn alloc_array(&mut self, data: ArrayData) -> HeapId {
        self.allocate(HeapData::Array(data))
    }

    /// Increments the reference count for an existing heap entry.
    ///
    /// # Panics
    /// Panics if the slot is missing or the value has already been freed.
    pub fn inc_ref(&self, id: HeapId) {
        let entry = self
            .entries
            .get(id.index())
            .expect("Heap::inc_ref: slot missing")
            .as_ref()
            .expect("Heap::inc_ref: object already freed");
        entry.refcount.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrements the reference count, freeing the value (plus children)
    /// once it hits zero.
    ///
    /// Freed slot IDs go on the free list for reuse. Children that are
    /// already-shared references release their independent count into the
    /// arena instead, which is why the arena collaborator is threaded
    /// through.
    ///
    /// # Panics
    /// Panics if the slot is missing or the value has already been freed.
    pub fn dec_ref<A: UncountedArena>(&mut self, id: HeapId, arena: &A) {
        let entry = {
            let slot = self.entries.get_mut(id.index()).expect("Heap::dec_ref: slot missing");
            let entry = slot.as_mut().expect("Heap::dec_ref: object already freed");
            let count = entry.refcount.load(Ordering::Relaxed);
            if count > 1 {
                entry.refcount.store(count - 1, Ordering::Relaxed);
                return;
            }
            slot.take().expect("Heap::dec_ref: object already freed")
        };

        self.free_list.push(id);

        if let Some(data) = entry.data {
            for child in data.child_values() {
                child.drop_with_heap(self, arena);
            }
        }
    }

    /// Returns an immutable reference to the heap data stored at the given ID.
    ///
    /// # Panics
    /// Panics if the slot is missing or the value has already been freed.
    #[must_use]
    pub fn get(&self, id: HeapId) -> &HeapData {
        self.entries
            .get(id.index())
            .expect("Heap::get: slot missing")
            .as_ref()
            .expect("Heap::get: object already freed")
            .data
            .as_ref()
            .expect("Heap::get: data missing")
    }

    /// Returns a mutable reference to the heap data stored at the given ID.
    ///
    /// # Panics
    /// Panics if the slot is missing or the value has already been freed.
    pub fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        self.entries
            .get_mut(id.index())
            .expect("Heap::get_mut: slot missing")
            .as_mut()
            .expect("Heap::get_mut: object already freed")
            .data
            .as_mut()
            .expect("Heap::get_mut: data missing")
    }

    /// Returns the string stored at the given ID.
    ///
    /// # Panics
    /// Panics if the slot does not hold a string.
    #[must_use]
    pub fn string(&self, id: HeapId) -> &str {
        match self.get(id) {
            HeapData::Str(s) => s,
            other => panic!("Heap::string: expected a string, found {other:?}"),
        }
    }

    /// Returns the container stored at the given ID.
    ///
    /// # Panics
    /// Panics if the slot does not hold a container.
    #[must_use]
    pub fn array(&self, id: HeapId) -> &ArrayData {
        match self.get(id) {
            HeapData::Array(data) => data,
            other => panic!("Heap::array: expected an array, found {other:?}"),
        }
    }

    /// Returns the current reference count of a live heap value.
    ///
    /// # Panics
    /// Panics if the slot is missing or the value has already been freed.
    #[must_use]
    pub fn refcount(&self, id: HeapId) -> usize {
        self.entries
            .get(id.index())
            .expect("Heap::refcount: slot missing")
            .as_ref()
            .expect("Heap::refcount: object already freed")
            .refcount
            .load(Ordering::Relaxed)
    }

    /// Number of live objects on the heap. Used by leak-checking tests.
    #[must_use]
    pub fn live_objects(&self) -> usize {
        self.entries.iter().flatten().count()
    }
}
