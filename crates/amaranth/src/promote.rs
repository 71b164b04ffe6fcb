//! Promotion of mutable values into shared storage.
//!
//! The type dispatcher ([`promote_slot`] and the internal `promote_value`)
//! decides per kind how a tagged value converts; the container and string
//! converters perform the deep copy, consulting the call-scoped
//! [`SharingMap`] so pointer-identical sources produce one shared block, and
//! the static string table so registered content never allocates.
//!
//! Conversion is a bounded, synchronous walk on the calling thread: cycles
//! are broken by recording a container in the sharing map before recursing
//! into its children, never by a depth or time limit.

use std::borrow::Cow;

use ahash::AHashMap;

use crate::{
    arena::UncountedArena,
    error::{PromoteError, PromoteResult},
    heap::{ArrayRepr, Heap, HeapId, Shape},
    intern,
    shared::{ArrRef, SharedEntries, SharedKey, SharedValue, StrRef, empty_array, empty_string},
    value::{ClassRef, FuncRef, Key, Value},
};

/// Compatibility switches for the reference-only kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PromoteOptions {
    /// Whether function references may be shared directly. When enabled,
    /// every function reference reaching promotion must be persistent (the
    /// caller filters the rest); when disabled, any function reference is
    /// rejected with a catchable error.
    pub share_funcs: bool,
    /// Whether a packed (class, method) pair whose class is persistent may
    /// pass through unchanged. Pairs that do not qualify are materialized as
    /// a two-element list and converted like any other container.
    pub share_cls_meth: bool,
}

impl Default for PromoteOptions {
    fn default() -> Self {
        Self {
            share_funcs: true,
            share_cls_meth: true,
        }
    }
}

/// Call-scoped association from source identity to produced shared block.
///
/// Two references to the same heap object inside one conversion call resolve
/// to the same shared block, preserving sharing and breaking cycles. The map
/// never outlives its top-level conversion call and is never shared across
/// threads. Only identities with more than one reference are tracked: a
/// singly-referenced value can be neither shared nor cyclic.
#[derive(Debug, Default)]
pub struct SharingMap {
    strings: AHashMap<HeapId, StrRef>,
    arrays: AHashMap<HeapId, ArrRef>,
}

impl SharingMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

struct PromoteCx<'a, A: UncountedArena> {
    heap: &'a Heap,
    arena: &'a A,
    options: PromoteOptions,
}

/// Converts one tagged value slot in place.
///
/// On success the slot holds the shared counterpart and the reference the
/// slot previously owned is given up. On failure the slot is left untouched
/// and nothing produced by the partial conversion is leaked.
pub fn promote_slot<A: UncountedArena>(
    heap: &mut Heap,
    arena: &A,
    options: PromoteOptions,
    slot: &mut Value,
) -> PromoteResult<()> {
    let shared = {
        let cx = PromoteCx {
            heap: &*heap,
            arena,
            options,
        };
        let mut seen = SharingMap::new();
        promote_value(&cx, &mut seen, *slot)?
    };
    let old = std::mem::replace(slot, Value::from(shared));
    old.drop_with_heap(heap, arena);
    Ok(())
}

/// Converts a whole container, returning the shared instance.
///
/// `cache_root` asks for the fully-shared root marker on the result; nested
/// containers never carry it. The caller keeps its reference to the source
/// container; the returned block owns one independent count.
pub fn promote_array<A: UncountedArena>(
    heap: &Heap,
    arena: &A,
    options: PromoteOptions,
    id: HeapId,
    cache_root: bool,
) -> PromoteResult<ArrRef> {
    let cx = PromoteCx { heap, arena, options };
    let mut seen = SharingMap::new();
    promote_container(&cx, &mut seen, id, cache_root)
}

/// Converts a whole string, returning the shared instance. Never fails.
///
/// Pass a sharing map to dedupe repeat identities across one logical
/// conversion; without one, every call copies (unless the content is empty
/// or registered in the static string table).
pub fn promote_string<A: UncountedArena>(
    heap: &Heap,
    arena: &A,
    id: HeapId,
    seen: Option<&mut SharingMap>,
) -> StrRef {
    promote_heap_str(heap, arena, seen, id)
}

/// The type dispatcher: converts one tagged value to its shared counterpart.
fn promote_value<A: UncountedArena>(
    cx: &PromoteCx<'_, A>,
    seen: &mut SharingMap,
    value: Value,
) -> PromoteResult<SharedValue> {
    match value {
        Value::Uninit | Value::Null => Ok(SharedValue::Null),
        Value::Bool(b) => Ok(SharedValue::Bool(b)),
        Value::Int(i) => Ok(SharedValue::Int(i)),
        Value::Double(d) => Ok(SharedValue::Double(d)),

        // Already shared: take one more count, no copy.
        Value::SharedStr(s) => {
            s.acquire();
            Ok(SharedValue::Str(s))
        }
        Value::SharedArray(a) => {
            a.acquire();
            Ok(SharedValue::Array(a))
        }

        Value::Str(id) => Ok(SharedValue::Str(promote_heap_str(cx.heap, cx.arena, Some(seen), id))),
        Value::Array(id) => Ok(SharedValue::Array(promote_container(cx, seen, id, false)?)),

        Value::Func(f) => {
            if cx.options.share_funcs {
                assert!(
                    f.is_persistent(),
                    "non-persistent func {name:?} reached promotion; the caller must filter these",
                    name = f.name(),
                );
                Ok(SharedValue::Func(f))
            } else {
                Err(PromoteError::FuncNotShareable)
            }
        }

        Value::Class(c) => {
            if c.is_persistent() {
                Ok(SharedValue::Class(c))
            } else {
                // The live binding is lost; only the immortal name survives.
                Ok(SharedValue::LazyClass(intern::intern_static(c.name())))
            }
        }
        Value::LazyClass(name) => Ok(SharedValue::LazyClass(name)),

        Value::ClsMeth(c, f) => {
            if cx.options.share_cls_meth && c.is_persistent() {
                Ok(SharedValue::ClsMeth(c, f))
            } else {
                materialize_cls_meth(cx, seen, c, f)
            }
        }

        Value::Record(_) => Err(PromoteError::RecordNotSupported),

        // The upstream analysis pass guarantees these kinds never reach
        // promotion; hitting one is a bug in that pass, not a runtime error.
        Value::Object(_) | Value::Resource(_) | Value::RFunc(_) | Value::RClsMeth(_) => {
            panic!("{kind} value reached promotion; the caller must exclude it", kind = value.kind())
        }
    }
}

/// Materializes a packed (class, method) pair as a two-element shared list.
///
/// The members go through the normal dispatcher, so a non-persistent class
/// degrades to a lazy-class descriptor exactly as a bare class value does.
fn materialize_cls_meth<A: UncountedArena>(
    cx: &PromoteCx<'_, A>,
    seen: &mut SharingMap,
    cls: ClassRef,
    func: FuncRef,
) -> PromoteResult<SharedValue> {
    let first = promote_value(cx, seen, Value::Class(cls))?;
    let second = match promote_value(cx, seen, Value::Func(func)) {
        Ok(v) => v,
        Err(err) => {
            first.release(cx.arena);
            return Err(err);
        }
    };
    let result = ArrRef::allocate(cx.arena, Shape::List, false, false);
    result.set_entries(SharedEntries::List(vec![first, second].into_boxed_slice()));
    Ok(SharedValue::Array(result))
}

/// The container converter.
fn promote_container<A: UncountedArena>(
    cx: &PromoteCx<'_, A>,
    seen: &mut SharingMap,
    id: HeapId,
    cache_root: bool,
) -> PromoteResult<ArrRef> {
    let data = cx.heap.array(id);

    // Empty containers collapse to the immortal singleton for their shape
    // and legacy bit: no allocation, no sharing-map entry.
    if data.repr.is_empty() {
        return Ok(empty_array(data.repr.shape(), data.legacy));
    }

    let tracked = cx.heap.refcount(id) > 1;
    if tracked && let Some(existing) = seen.arrays.get(&id) {
        existing.acquire();
        return Ok(*existing);
    }

    // Specialized layouts are escalated first; the Cow releases an escalated
    // temporary on every exit path, error paths included.
    let canonical = data.repr.to_canonical();

    // The block is recorded before children are converted, so a cyclic edge
    // back to this identity finds the in-progress block instead of looping.
    let result = ArrRef::allocate(cx.arena, canonical.shape(), data.legacy, cache_root);
    if tracked {
        seen.arrays.insert(id, result);
    }

    match fill_entries(cx, seen, &canonical) {
        Ok(entries) => {
            result.set_entries(entries);
            Ok(result)
        }
        Err(err) => {
            // Abort: the entries built so far were already released by
            // fill_entries; giving up our own count frees this block (any
            // count a cyclic edge took was released with the entry holding
            // it), so nothing leaks across the abort boundary.
            result.release(cx.arena);
            Err(err)
        }
    }
}

/// Converts the elements of a canonicalized container.
///
/// On a child failure, every entry built so far is released before the error
/// propagates.
fn fill_entries<A: UncountedArena>(
    cx: &PromoteCx<'_, A>,
    seen: &mut SharingMap,
    repr: &Cow<'_, ArrayRepr>,
) -> PromoteResult<SharedEntries> {
    match repr.as_ref() {
        ArrayRepr::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for &item in items {
                match promote_value(cx, seen, item) {
                    Ok(converted) => out.push(converted),
                    Err(err) => {
                        for &built in &out {
                            built.release(cx.arena);
                        }
                        return Err(err);
                    }
                }
            }
            Ok(SharedEntries::List(out.into_boxed_slice()))
        }
        ArrayRepr::Dict(map) => {
            let mut out = Vec::with_capacity(map.len());
            for (key, &value) in map {
                let key = promote_key(cx.arena, key);
                match promote_value(cx, seen, value) {
                    Ok(converted) => out.push((key, converted)),
                    Err(err) => {
                        key.release(cx.arena);
                        for &(built_key, built_value) in &out {
                            built_key.release(cx.arena);
                            built_value.release(cx.arena);
                        }
                        return Err(err);
                    }
                }
            }
            Ok(SharedEntries::Map(out.into_boxed_slice()))
        }
        ArrayRepr::Set(keys) => Ok(SharedEntries::Set(
            keys.iter().map(|key| promote_key(cx.arena, key)).collect(),
        )),
        ArrayRepr::IntVec(_) | ArrayRepr::StructMap { .. } => {
            unreachable!("fill_entries: layout was canonicalized above")
        }
    }
}

/// Converts one container key. Infallible: keys are ints or plain strings.
fn promote_key<A: UncountedArena>(arena: &A, key: &Key) -> SharedKey {
    match key {
        Key::Int(i) => SharedKey::Int(*i),
        Key::Str(s) if s.is_empty() => SharedKey::Str(empty_string()),
        Key::Str(s) => SharedKey::Str(intern::lookup_static(s).unwrap_or_else(|| StrRef::allocate(arena, s))),
    }
}

/// The string converter.
fn promote_heap_str<A: UncountedArena>(
    heap: &Heap,
    arena: &A,
    seen: Option<&mut SharingMap>,
    id: HeapId,
) -> StrRef {
    let content = heap.string(id);
    if content.is_empty() {
        return empty_string();
    }
    if let Some(registered) = intern::lookup_static(content) {
        return registered;
    }

    // Content equality alone never dedupes: only repeat identities within
    // this call share a copy.
    match seen.filter(|_| heap.refcount(id) > 1) {
        Some(seen) => {
            if let Some(existing) = seen.strings.get(&id) {
                existing.acquire();
                return *existing;
            }
            let fresh = StrRef::allocate(arena, content);
            seen.strings.insert(id, fresh);
            fresh
        }
        None => StrRef::allocate(arena, content),
    }
}
