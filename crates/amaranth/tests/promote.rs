//! Tests for the promotion dispatcher and converters.
//!
//! Covers per-kind dispatch, in-place slot retagging, canonical empties,
//! string interning, specialized-layout escalation, the compatibility
//! switches for reference-only kinds, and the rejection paths.

use amaranth::{
    ArrayData, ArrayRepr, ClassInfo, ClassRef, CountingArena, FuncInfo, FuncRef, Heap, HeapData, PromoteError,
    PromoteOptions, SharedEntries, SharedKey, SharedValue, Shape, SharingMap, Value, empty_string, intern_static,
    lookup_static, promote_array, promote_slot, promote_string, release_slot,
};
use pretty_assertions::assert_eq;

fn counting() -> CountingArena {
    CountingArena::default()
}

// =============================================================================
// 1. Trivial kinds and slot retagging
// =============================================================================

/// Trivial kinds pass through unchanged; an uninitialized slot normalizes to null.
#[test]
fn trivial_kinds_pass_through() {
    let arena = counting();
    let mut heap = Heap::new();
    let options = PromoteOptions::default();

    let mut slot = Value::Int(42);
    promote_slot(&mut heap, &arena, options, &mut slot).unwrap();
    assert!(matches!(slot, Value::Int(42)));

    let mut slot = Value::Bool(true);
    promote_slot(&mut heap, &arena, options, &mut slot).unwrap();
    assert!(matches!(slot, Value::Bool(true)));

    let mut slot = Value::Uninit;
    promote_slot(&mut heap, &arena, options, &mut slot).unwrap();
    assert!(matches!(slot, Value::Null));

    assert_eq!(arena.snapshot().blocks_allocated, 0);
}

/// Converting a mutable string slot in place releases the original and
/// leaves the slot holding the shared counterpart.
#[test]
fn string_slot_retags_in_place() {
    let arena = counting();
    let mut heap = Heap::new();
    let id = heap.alloc_str("slot_promote_payload");

    let mut slot = Value::Str(id);
    promote_slot(&mut heap, &arena, PromoteOptions::default(), &mut slot).unwrap();

    let Value::SharedStr(shared) = slot else {
        panic!("expected a shared string slot, got {slot:?}");
    };
    assert_eq!(shared.as_str(), "slot_promote_payload");
    assert_eq!(shared.count(), 1);
    // The slot owned the only mutable reference; nothing is left on the heap.
    assert_eq!(heap.live_objects(), 0);

    release_slot(slot, &arena);
    assert_eq!(arena.snapshot().live_blocks(), 0);
}

// =============================================================================
// 2. Canonical empties
// =============================================================================

/// Two independently-created empty lists promote to the same immortal
/// singleton, with no arena traffic and no effect from releases.
#[test]
fn empty_containers_canonicalize() {
    let arena = counting();
    let mut heap = Heap::new();
    let options = PromoteOptions::default();

    let a = heap.alloc_array(ArrayData::new(ArrayRepr::List(Vec::new())));
    let b = heap.alloc_array(ArrayData::new(ArrayRepr::List(Vec::new())));
    let sa = promote_array(&heap, &arena, options, a, false).unwrap();
    let sb = promote_array(&heap, &arena, options, b, false).unwrap();

    assert!(sa.ptr_eq(sb));
    assert!(sa.is_immortal());
    assert_eq!(sa.shape(), Shape::List);
    assert_eq!(arena.snapshot().blocks_allocated, 0);

    sa.release(&arena);
    sb.release(&arena);
    assert_eq!(arena.snapshot().blocks_freed, 0);
}

/// The legacy bit selects a distinct empty singleton for lists and maps;
/// sets have no legacy bit and collapse to one singleton.
#[test]
fn empty_singletons_respect_the_legacy_bit() {
    let arena = counting();
    let mut heap = Heap::new();
    let options = PromoteOptions::default();

    let plain = heap.alloc_array(ArrayData::new(ArrayRepr::List(Vec::new())));
    let legacy = heap.alloc_array(ArrayData::with_legacy(ArrayRepr::List(Vec::new()), true));
    let sp = promote_array(&heap, &arena, options, plain, false).unwrap();
    let sl = promote_array(&heap, &arena, options, legacy, false).unwrap();
    assert!(!sp.ptr_eq(sl));
    assert!(sl.is_legacy());

    let set = heap.alloc_array(ArrayData::new(ArrayRepr::set(Vec::new())));
    let legacy_set = heap.alloc_array(ArrayData::with_legacy(ArrayRepr::set(Vec::new()), true));
    let ss = promote_array(&heap, &arena, options, set, false).unwrap();
    let sls = promote_array(&heap, &arena, options, legacy_set, false).unwrap();
    assert!(ss.ptr_eq(sls));
}

/// An empty specialized layout is still empty: it canonicalizes to the
/// singleton without being escalated or allocated.
#[test]
fn empty_specialized_layout_uses_the_singleton() {
    let arena = counting();
    let mut heap = Heap::new();
    let id = heap.alloc_array(ArrayData::new(ArrayRepr::IntVec(Vec::new())));
    let shared = promote_array(&heap, &arena, PromoteOptions::default(), id, false).unwrap();
    assert!(shared.is_immortal());
    assert_eq!(shared.shape(), Shape::List);
    assert_eq!(arena.snapshot().blocks_allocated, 0);
}

// =============================================================================
// 3. String interning
// =============================================================================

/// Pre-registered content resolves to the one immortal instance for every
/// caller, with no arena allocation.
#[test]
fn registered_content_hits_the_static_table() {
    let arena = counting();
    let mut heap = Heap::new();
    let registered = intern_static("interning_pre_registered_payload");

    let a = heap.alloc_str("interning_pre_registered_payload");
    let b = heap.alloc_str("interning_pre_registered_payload");
    let ra = promote_string(&heap, &arena, a, None);
    let rb = promote_string(&heap, &arena, b, None);

    assert!(ra.ptr_eq(registered));
    assert!(rb.ptr_eq(registered));
    assert!(ra.is_immortal());
    assert_eq!(arena.snapshot().blocks_allocated, 0);
}

/// Unregistered content dedupes per identity when tracked, but two distinct
/// identities with equal content still get two copies.
#[test]
fn unregistered_content_dedupes_by_identity_only() {
    let arena = counting();
    let mut heap = Heap::new();

    let shared_id = heap.alloc_str("interning_unregistered_payload");
    heap.inc_ref(shared_id);
    let mut seen = SharingMap::new();
    let first = promote_string(&heap, &arena, shared_id, Some(&mut seen));
    let second = promote_string(&heap, &arena, shared_id, Some(&mut seen));
    assert!(first.ptr_eq(second));
    assert_eq!(first.count(), 2);
    assert_eq!(arena.snapshot().blocks_allocated, 1);

    // Equal content, distinct identities: two allocations.
    let other = heap.alloc_str("interning_unregistered_payload");
    let third = promote_string(&heap, &arena, other, Some(&mut seen));
    assert!(!third.ptr_eq(first));
    assert_eq!(third.as_str(), first.as_str());
    assert_eq!(arena.snapshot().blocks_allocated, 2);

    first.release(&arena);
    first.release(&arena);
    third.release(&arena);
    assert_eq!(arena.snapshot().live_blocks(), 0);
}

/// Empty mutable strings promote to the immortal empty-string singleton.
#[test]
fn empty_strings_canonicalize() {
    let arena = counting();
    let mut heap = Heap::new();
    let id = heap.alloc_str("");
    let shared = promote_string(&heap, &arena, id, None);
    assert!(shared.ptr_eq(empty_string()));
    assert_eq!(arena.snapshot().blocks_allocated, 0);
}

// =============================================================================
// 4. Specialized layout escalation
// =============================================================================

/// A specialized int list escalates to the canonical layout and converts
/// into a single shared list block.
#[test]
fn int_vec_escalates_and_converts() {
    let arena = counting();
    let mut heap = Heap::new();
    let id = heap.alloc_array(ArrayData::new(ArrayRepr::IntVec(vec![4, 5])));

    let shared = promote_array(&heap, &arena, PromoteOptions::default(), id, false).unwrap();
    assert_eq!(shared.shape(), Shape::List);
    let SharedEntries::List(items) = shared.entries() else {
        panic!("expected list entries");
    };
    assert!(matches!(items[..], [SharedValue::Int(4), SharedValue::Int(5)]));
    assert_eq!(arena.snapshot().blocks_allocated, 1);

    shared.release(&arena);
    assert_eq!(arena.snapshot().live_blocks(), 0);
}

/// A specialized struct map escalates to the canonical map layout in field
/// order; its unregistered string keys get their own uncounted copies.
#[test]
fn struct_map_escalates_and_converts() {
    let arena = counting();
    let mut heap = Heap::new();
    let id = heap.alloc_array(ArrayData::new(ArrayRepr::StructMap {
        fields: vec!["sm_width".into(), "sm_height".into()],
        values: vec![Value::Int(800), Value::Int(600)],
    }));

    let shared = promote_array(&heap, &arena, PromoteOptions::default(), id, false).unwrap();
    assert_eq!(shared.shape(), Shape::Map);
    let SharedEntries::Map(pairs) = shared.entries() else {
        panic!("expected map entries");
    };
    let [(SharedKey::Str(first_key), SharedValue::Int(800)), (SharedKey::Str(_), SharedValue::Int(600))] = pairs[..]
    else {
        panic!("unexpected entries: {pairs:?}");
    };
    assert_eq!(first_key.as_str(), "sm_width");
    // One block for the container, one per unregistered key.
    assert_eq!(arena.snapshot().blocks_allocated, 3);

    shared.release(&arena);
    assert_eq!(arena.snapshot().live_blocks(), 0);
}

// =============================================================================
// 5. Reference-only kinds and compatibility switches
// =============================================================================

static PERSISTENT_CLASS: ClassInfo = ClassInfo::new("AppKernel", true);
static EPHEMERAL_CLASS: ClassInfo = ClassInfo::new("request_local_class", false);
static PERSISTENT_FUNC: FuncInfo = FuncInfo::new("render", true);

/// A persistent class passes through; a non-persistent one is demoted to a
/// lazy-class descriptor carrying only the (now interned) name.
#[test]
fn classes_pass_through_or_demote_to_lazy() {
    let arena = counting();
    let mut heap = Heap::new();
    let options = PromoteOptions::default();

    let mut slot = Value::Class(ClassRef::new(&PERSISTENT_CLASS));
    promote_slot(&mut heap, &arena, options, &mut slot).unwrap();
    let Value::Class(kept) = slot else {
        panic!("expected a class slot, got {slot:?}");
    };
    assert!(kept.ptr_eq(ClassRef::new(&PERSISTENT_CLASS)));

    let mut slot = Value::Class(ClassRef::new(&EPHEMERAL_CLASS));
    promote_slot(&mut heap, &arena, options, &mut slot).unwrap();
    let Value::LazyClass(name) = slot else {
        panic!("expected a lazy-class slot, got {slot:?}");
    };
    assert_eq!(name.as_str(), "request_local_class");
    assert!(name.is_immortal());
    assert!(lookup_static("request_local_class").is_some());
    assert_eq!(arena.snapshot().blocks_allocated, 0);
}

/// A persistent function passes through under the default switches and is
/// rejected with a catchable error when direct sharing is disabled.
#[test]
fn func_sharing_is_gated_by_the_switch() {
    let arena = counting();
    let mut heap = Heap::new();

    let mut slot = Value::Func(FuncRef::new(&PERSISTENT_FUNC));
    promote_slot(&mut heap, &arena, PromoteOptions::default(), &mut slot).unwrap();
    assert!(matches!(slot, Value::Func(_)));

    let no_funcs = PromoteOptions {
        share_funcs: false,
        ..PromoteOptions::default()
    };
    let mut slot = Value::Func(FuncRef::new(&PERSISTENT_FUNC));
    let err = promote_slot(&mut heap, &arena, no_funcs, &mut slot).unwrap_err();
    assert_eq!(err, PromoteError::FuncNotShareable);
    assert!(matches!(slot, Value::Func(_)));
    assert_eq!(arena.snapshot().blocks_allocated, 0);
}

/// A packed pair passes through when the switch allows it and the class is
/// persistent; otherwise it materializes as a two-element shared list.
#[test]
fn cls_meth_passes_through_or_materializes() {
    let arena = counting();
    let mut heap = Heap::new();
    let pair = Value::ClsMeth(ClassRef::new(&PERSISTENT_CLASS), FuncRef::new(&PERSISTENT_FUNC));

    let mut slot = pair;
    promote_slot(&mut heap, &arena, PromoteOptions::default(), &mut slot).unwrap();
    assert!(matches!(slot, Value::ClsMeth(..)));
    assert_eq!(arena.snapshot().blocks_allocated, 0);

    let no_pairs = PromoteOptions {
        share_cls_meth: false,
        ..PromoteOptions::default()
    };
    let mut slot = pair;
    promote_slot(&mut heap, &arena, no_pairs, &mut slot).unwrap();
    let Value::SharedArray(list) = slot else {
        panic!("expected a materialized list, got {slot:?}");
    };
    assert_eq!(list.shape(), Shape::List);
    let SharedEntries::List(items) = list.entries() else {
        panic!("expected list entries");
    };
    assert!(matches!(items[..], [SharedValue::Class(_), SharedValue::Func(_)]));
    assert_eq!(arena.snapshot().blocks_allocated, 1);

    list.release(&arena);
    assert_eq!(arena.snapshot().live_blocks(), 0);
}

/// A pair whose class is not persistent materializes even when the switch
/// allows direct sharing, and its class member demotes to a lazy class.
#[test]
fn cls_meth_with_ephemeral_class_materializes() {
    let arena = counting();
    let mut heap = Heap::new();

    let mut slot = Value::ClsMeth(ClassRef::new(&EPHEMERAL_CLASS), FuncRef::new(&PERSISTENT_FUNC));
    promote_slot(&mut heap, &arena, PromoteOptions::default(), &mut slot).unwrap();
    let Value::SharedArray(list) = slot else {
        panic!("expected a materialized list, got {slot:?}");
    };
    let SharedEntries::List(items) = list.entries() else {
        panic!("expected list entries");
    };
    let [SharedValue::LazyClass(name), SharedValue::Func(_)] = items[..] else {
        panic!("unexpected entries: {items:?}");
    };
    assert_eq!(name.as_str(), "request_local_class");

    list.release(&arena);
    assert_eq!(arena.snapshot().live_blocks(), 0);
}

// =============================================================================
// 6. Rejection and contract violations
// =============================================================================

/// The legacy record kind fails with the user-visible error, leaves the
/// slot untouched, and never touches the arena.
#[test]
fn record_is_rejected_without_arena_traffic() {
    let arena = counting();
    let mut heap = Heap::new();
    let payload = heap.allocate(HeapData::Opaque("record payload"));

    let before = arena.snapshot();
    let mut slot = Value::Record(payload);
    let err = promote_slot(&mut heap, &arena, PromoteOptions::default(), &mut slot).unwrap_err();
    assert_eq!(err, PromoteError::RecordNotSupported);
    assert_eq!(err.to_string(), "record values are not supported in shared storage");
    assert!(matches!(slot, Value::Record(_)));
    assert_eq!(arena.snapshot(), before);

    slot.drop_with_heap(&mut heap, &arena);
    assert_eq!(heap.live_objects(), 0);
}

/// A record deep inside a container aborts the whole conversion; partially
/// built blocks are torn down, so nothing leaks across the abort boundary.
#[test]
fn nested_record_aborts_without_leaking() {
    let arena = counting();
    let mut heap = Heap::new();
    let payload = heap.allocate(HeapData::Opaque("record payload"));
    let s = heap.alloc_str("rejection_nested_payload");
    let root = heap.alloc_array(ArrayData::new(ArrayRepr::List(vec![
        Value::Str(s),
        Value::Record(payload),
        Value::Int(3),
    ])));

    let err = promote_array(&heap, &arena, PromoteOptions::default(), root, false).unwrap_err();
    assert_eq!(err, PromoteError::RecordNotSupported);
    // The string copy and the root block were allocated, then released on
    // the abort path.
    let snap = arena.snapshot();
    assert_eq!(snap.blocks_allocated, 2);
    assert_eq!(snap.blocks_freed, 2);

    heap.dec_ref(root, &arena);
    assert_eq!(heap.live_objects(), 0);
}

/// Kinds the upstream analysis pass promises to exclude are contract
/// violations, not errors.
#[test]
#[should_panic(expected = "Object value reached promotion")]
fn object_input_is_a_contract_violation() {
    let arena = counting();
    let mut heap = Heap::new();
    let payload = heap.allocate(HeapData::Opaque("object payload"));
    let mut slot = Value::Object(payload);
    let _ = promote_slot(&mut heap, &arena, PromoteOptions::default(), &mut slot);
}
