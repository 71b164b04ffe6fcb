//! User-visible promotion failures.
//!
//! Only genuinely reachable inputs surface as errors; kinds the upstream
//! analysis pass promises to exclude (objects, resources, reified wrappers)
//! are contract violations and panic instead — see `promote`.

use std::{error::Error, fmt};

/// A catchable failure from a promotion call.
///
/// The top-level conversion is abandoned: no result is produced, nothing is
/// leaked, and the input slot is left untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromoteError {
    /// The legacy record kind was encountered. Records are a real, reachable
    /// input class, rejected rather than asserted away.
    RecordNotSupported,
    /// A function reference was encountered while `share_funcs` is disabled.
    FuncNotShareable,
}

impl fmt::Display for PromoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RecordNotSupported => f.write_str("record values are not supported in shared storage"),
            Self::FuncNotShareable => f.write_str("func values cannot be placed in shared storage"),
        }
    }
}

impl Error for PromoteError {}

pub type PromoteResult<T> = Result<T, PromoteError>;
