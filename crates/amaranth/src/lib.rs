#![doc = include_str!("../../../README.md")]

mod arena;
mod error;
mod heap;
mod intern;
mod promote;
mod shared;
mod value;

pub use crate::{
    arena::{ArenaSnapshot, ArenaStats, CountingArena, GlobalArena, UncountedArena},
    error::{PromoteError, PromoteResult},
    heap::{ArrayData, ArrayRepr, Heap, HeapData, HeapId, Shape},
    intern::{intern_static, lookup_static},
    promote::{PromoteOptions, SharingMap, promote_array, promote_slot, promote_string},
    shared::{ArrRef, SharedEntries, SharedKey, SharedValue, StrRef, empty_array, empty_string, release_slot},
    value::{ClassInfo, ClassRef, FuncInfo, FuncRef, Key, Value, ValueKind},
};
