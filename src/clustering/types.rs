/// Fingerprint of one member article of a candidate story, as loaded from
/// storage for the assignment pass.
#[derive(Debug, Clone)]
pub struct CandidateFingerprint {
    pub story_id: i64,
    pub news_id: i64,
    pub title_sig: String,
    pub entity_sig: Option<String>,
    pub story_updated_at: String,
}

/// Best-scoring story for an article, before thresholding.
#[derive(Debug, Clone, PartialEq)]
pub struct StoryMatch {
    pub story_id: i64,
    pub news_id: i64,
    pub score: f64,
}
