//! Classification label constants and the severity precedence table.

use std::cmp::Ordering;

/// Human taggers disagree on a track.
pub const CONFLICTING_TAGS: &str = "conflicting tags";
/// The model (or a person) looked and could not tell.
pub const UNIDENTIFIED: &str = "unidentified";
/// No usable tag at all.
pub const NONE: &str = "none";
/// AI model whose tags count when the caller doesn't pick one.
pub const DEFAULT_MODEL: &str = "Master";

/// Placeholder slot in [`PRECEDENCE`] for every label not listed explicitly.
const ANY_OTHER: &str = "*";

/// Labels from most to least concerning. Used to break ties so the worse
/// outcome is surfaced.
pub const PRECEDENCE: [&str; 12] = [
    CONFLICTING_TAGS,
    "mustelid",
    "cat",
    "possum",
    "hedgehog",
    "rodent",
    "rat",
    "mouse",
    "leporidae",
    ANY_OTHER,
    UNIDENTIFIED,
    NONE,
];

/// Position of `label` in [`PRECEDENCE`]; lower is more concerning.
pub fn precedence_rank(label: &str) -> usize {
    PRECEDENCE
        .iter()
        .position(|l| *l == label)
        .or_else(|| PRECEDENCE.iter().position(|l| *l == ANY_OTHER))
        .unwrap_or(PRECEDENCE.len())
}

/// Order two labels by concern, most concerning first. Labels sharing a
/// precedence slot fall back to alphabetical order so ties stay deterministic.
pub fn by_concern(a: &str, b: &str) -> Ordering {
    precedence_rank(a)
        .cmp(&precedence_rank(b))
        .then_with(|| a.cmp(b))
}
