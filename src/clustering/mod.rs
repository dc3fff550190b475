pub mod assignment;
#[cfg(test)]
mod tests;
pub mod types;

pub use assignment::{
    assign_article, assign_unprocessed, best_match, refresh_titles, similarity, Assignment,
    BatchOutcome,
};
pub use types::{CandidateFingerprint, StoryMatch};

/// Minimum combined similarity required to attach an article to an
/// existing story.
pub const MIN_STORY_SIMILARITY: f64 = 0.55;

/// Weight of title-signature Jaccard in the combined score.
pub const TITLE_WEIGHT: f64 = 0.6;

/// Weight of entity-signature overlap. Contributes zero when either side
/// has no entity signature.
pub const ENTITY_WEIGHT: f64 = 0.4;

/// Only stories updated within this window are compared against.
pub const LOOKBACK_HOURS: i64 = 72;
