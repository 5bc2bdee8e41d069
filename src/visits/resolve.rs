use crate::db::models::{Track, TrackTag};
use crate::labels::{CONFLICTING_TAGS, NONE, UNIDENTIFIED};

/// A track's label for voting, from humans-over-AI and AI-only viewpoints.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ResolvedTrack {
    pub track_id: i64,
    pub label: String,
    pub ai_label: String,
}

/// Resolve one track against the chosen comparison model.
pub fn resolve_track(track: &Track, model: &str) -> ResolvedTrack {
    ResolvedTrack {
        track_id: track.id,
        label: resolve_tags(&track.tags, model),
        ai_label: resolve_ai_tags(&track.tags, model),
    }
}

/// Resolve a track's tags into one label.
///
/// Automatic tags only count when they come from `model`. Human tags, when
/// present, override automatic ones entirely: a single human opinion wins,
/// disagreement yields [`CONFLICTING_TAGS`].
pub fn resolve_tags(tags: &[TrackTag], model: &str) -> String {
    let mut human = tags.iter().filter(|t| !t.automatic).map(|t| t.label.as_str());

    match human.next() {
        Some(first) => {
            if human.all(|label| label == first) {
                first.to_string()
            } else {
                CONFLICTING_TAGS.to_string()
            }
        }
        None => resolve_ai_tags(tags, model),
    }
}

/// The comparison model's label, ignoring human tags.
pub fn resolve_ai_tags(tags: &[TrackTag], model: &str) -> String {
    let mut labels = tags
        .iter()
        .filter(|t| t.automatic && t.model.as_deref() == Some(model))
        .map(|t| t.label.as_str());

    // A model tags each track once; if it ever re-tagged, prefer a real
    // species over its own "unidentified".
    let first = labels.next();
    match first {
        Some(UNIDENTIFIED) => labels
            .find(|l| *l != UNIDENTIFIED)
            .unwrap_or(UNIDENTIFIED)
            .to_string(),
        Some(label) => label.to_string(),
        None => NONE.to_string(),
    }
}
