//! Process-wide table of immortal strings keyed by content.
//!
//! String promotion consults this table before allocating: content that was
//! registered here resolves to one immortal instance shared by every caller,
//! with no count to manage and no arena traffic. Registration is how
//! embedders pre-seed hot content (class names, well-known keys); promotion
//! itself also registers lazy-class names and materialized pair members,
//! which must stay immortal.
//!
//! The table only ever grows. Entries are `Box::leak`ed immortals, so a
//! handle obtained from the table is valid for the life of the process.

use std::sync::{LazyLock, RwLock};

use ahash::AHashMap;

use crate::shared::{StrRef, empty_string};

static STATIC_STRINGS: LazyLock<RwLock<AHashMap<Box<str>, StrRef>>> =
    LazyLock::new(|| RwLock::new(AHashMap::new()));

/// Looks up registered content, returning its immortal instance if present.
#[must_use]
pub fn lookup_static(content: &str) -> Option<StrRef> {
    STATIC_STRINGS
        .read()
        .expect("static string table poisoned")
        .get(content)
        .copied()
}

/// Registers content in the table, returning its immortal instance.
///
/// Idempotent: equal content always resolves to the same instance. The
/// empty string canonicalizes to the empty-string singleton and is never
/// stored in the table.
pub fn intern_static(content: &str) -> StrRef {
    if content.is_empty() {
        return empty_string();
    }
    if let Some(existing) = lookup_static(content) {
        return existing;
    }
    let mut table = STATIC_STRINGS.write().expect("static string table poisoned");
    // Recheck under the write lock; another thread may have interned the
    // same content between our lookup and here.
    if let Some(existing) = table.get(content) {
        return *existing;
    }
    let created = StrRef::immortal(content);
    table.insert(content.into(), created);
    created
}
