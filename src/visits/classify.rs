use std::collections::HashMap;

use crate::labels::{NONE, UNIDENTIFIED, by_concern};

/// Reduce a visit's per-track labels to one classification.
///
/// One vote per track. `unidentified` only wins when every vote is
/// `unidentified`; `none` votes never count. The most-voted label wins and a
/// tie goes to the most concerning label in [`crate::labels::PRECEDENCE`].
pub fn classify<'a, I>(votes: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut tally: HashMap<&str, usize> = HashMap::new();
    let mut unidentified = 0usize;

    for label in votes {
        match label {
            NONE => {}
            UNIDENTIFIED => unidentified += 1,
            other => *tally.entry(other).or_default() += 1,
        }
    }

    if tally.is_empty() {
        let label = if unidentified > 0 { UNIDENTIFIED } else { NONE };
        return label.to_string();
    }

    tally
        .into_iter()
        .max_by(|(a, a_votes), (b, b_votes)| {
            // Reverse concern order so max_by prefers the more concerning label
            a_votes.cmp(b_votes).then_with(|| by_concern(b, a))
        })
        .map(|(label, _)| label.to_string())
        .unwrap_or_else(|| NONE.to_string())
}
