//! Error taxonomy for parameter resolution and fitting.
//!
//! Configuration and parameter-resolution failures are all-or-nothing: no
//! partial T1 map is ever produced. Per-voxel numeric degeneracy (zero
//! regression variance, non-finite intermediates) is never represented here;
//! the affected voxel is excluded from the result with the fill value.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VfaError {
    /// Invalid TR, flip angle, clamp bounds, volume count, or shape mismatch.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A referenced method file cannot be read. Distinct from a key that is
    /// absent in a file that does exist.
    #[error("method file not found: {}", .0.display())]
    ResourceNotFound(PathBuf),

    /// Required parameters left unresolved after merging manual overrides
    /// with inferred values. Carries every inference attempt's note.
    #[error(
        "missing required parameter(s): {}\nmethod parsing diagnostics:\n{}",
        .missing.join(", "),
        .notes.join("\n")
    )]
    MissingParameters {
        missing: Vec<String>,
        notes: Vec<String>,
    },

    /// `require_same_tr` was set and independently inferred TR values
    /// disagree beyond tolerance.
    #[error(
        "TR mismatch across method sources: {} (provide TR explicitly or drop the same-TR requirement)",
        .values
            .iter()
            .map(|(prov, tr)| format!("{prov}: {tr} s"))
            .collect::<Vec<_>>()
            .join(", ")
    )]
    TrMismatch { values: Vec<(String, f64)> },
}
