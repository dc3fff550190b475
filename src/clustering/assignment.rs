use std::collections::{HashMap, HashSet};

use chrono::{Duration, Utc};
use tracing::{debug, info, warn};

use crate::db::article::ArticleRow;
use crate::db::{iso, Database};
use crate::error::Error;
use crate::fingerprint::{
    compute_fingerprint, jaccard, signature_tokens, tokenize, Fingerprint, RecognizedEntities,
};

use super::types::{CandidateFingerprint, StoryMatch};
use super::{ENTITY_WEIGHT, LOOKBACK_HOURS, MIN_STORY_SIMILARITY, TITLE_WEIGHT};

/// Member titles considered when picking a story's representative title.
const TITLE_REFRESH_MEMBERS: i64 = 10;

/// Where an article ended up after the assignment pass.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub story_id: i64,
    pub created: bool,
    pub score: Option<f64>,
}

/// Weighted combination of title Jaccard and entity-signature overlap.
///
/// The entity term contributes zero when either side carries no entity
/// signature; entity overlap between two tagged articles is the strong
/// positive signal that lets loosely worded titles still match.
pub fn similarity(fingerprint: &Fingerprint, candidate: &CandidateFingerprint) -> f64 {
    let title_score = jaccard(
        &signature_tokens(&fingerprint.title_sig),
        &signature_tokens(&candidate.title_sig),
    );

    let entity_score = match (&fingerprint.entity_sig, &candidate.entity_sig) {
        (Some(a), Some(b)) => jaccard(&signature_tokens(a), &signature_tokens(b)),
        _ => 0.0,
    };

    title_score * TITLE_WEIGHT + entity_score * ENTITY_WEIGHT
}

/// Scores every candidate member and picks the best story. Ties are broken
/// in favor of the most recently updated story.
pub fn best_match(
    fingerprint: &Fingerprint,
    candidates: &[CandidateFingerprint],
) -> Option<StoryMatch> {
    let mut best: Option<(&CandidateFingerprint, f64)> = None;

    for candidate in candidates {
        let score = similarity(fingerprint, candidate);
        let better = match &best {
            None => true,
            Some((current, best_score)) => {
                score > *best_score
                    || (score == *best_score
                        && candidate.story_updated_at > current.story_updated_at)
            }
        };
        if better {
            best = Some((candidate, score));
        }
    }

    best.map(|(candidate, score)| StoryMatch {
        story_id: candidate.story_id,
        news_id: candidate.news_id,
        score,
    })
}

/// Assigns an article to an existing story or creates a new one.
///
/// Already-linked articles are returned as-is: re-processing never moves an
/// article to a different story. A race on the membership index surfaces as
/// `Error::Storage`; the caller retries against fresh story state.
pub async fn assign_article(
    db: &Database,
    news_id: i64,
    title: &str,
    fingerprint: &Fingerprint,
) -> Result<Assignment, Error> {
    if let Some(story_id) = db.story_for_article(news_id).await? {
        debug!("Article {} already linked to story {}", news_id, story_id);
        return Ok(Assignment {
            story_id,
            created: false,
            score: None,
        });
    }

    let window_start = iso(Utc::now() - Duration::hours(LOOKBACK_HOURS));
    let candidates = db.candidate_fingerprints(news_id, &window_start).await?;
    let best = best_match(fingerprint, &candidates);

    match best {
        Some(matched) if matched.score >= MIN_STORY_SIMILARITY => {
            db.attach_article(matched.story_id, news_id).await?;
            info!(
                "Attached article {} to story {} (score {:.3}, matched news_id={})",
                news_id, matched.story_id, matched.score, matched.news_id
            );
            Ok(Assignment {
                story_id: matched.story_id,
                created: false,
                score: Some(matched.score),
            })
        }
        other => {
            let story_id = db.create_story(title).await?;
            db.attach_article(story_id, news_id).await?;
            info!(
                "Created story {} for article {} (best candidate score {:?})",
                story_id,
                news_id,
                other.as_ref().map(|m| m.score)
            );
            Ok(Assignment {
                story_id,
                created: true,
                score: other.map(|m| m.score),
            })
        }
    }
}

/// Tallies from one batch assignment pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct BatchOutcome {
    pub processed: usize,
    pub created: usize,
    pub skipped: usize,
}

/// Assigns every recent unclustered article, reusing stored fingerprints
/// and computing title-only ones where missing. Articles whose titles
/// normalize to nothing are logged and skipped; one bad item never stalls
/// the pass.
pub async fn assign_unprocessed(
    db: &Database,
    since: &str,
    limit: i64,
) -> Result<BatchOutcome, Error> {
    let articles = db.unassigned_articles(since, limit).await?;
    let mut outcome = BatchOutcome::default();

    for article in &articles {
        let fingerprint = match db.get_fingerprint(article.id).await? {
            Some(fingerprint) => fingerprint,
            None => {
                match compute_fingerprint(&article.title, &RecognizedEntities::default()) {
                    Ok(fingerprint) => {
                        db.upsert_fingerprint(article.id, &fingerprint).await?;
                        fingerprint
                    }
                    Err(Error::Validation(reason)) => {
                        warn!("Skipping article {}: {}", article.id, reason);
                        outcome.skipped += 1;
                        continue;
                    }
                    Err(err) => return Err(err),
                }
            }
        };

        let assignment = assign_article(db, article.id, &article.title, &fingerprint).await?;
        outcome.processed += 1;
        if assignment.created {
            outcome.created += 1;
        }
    }

    info!(
        "Batch pass: {} assigned, {} new stories, {} skipped",
        outcome.processed, outcome.created, outcome.skipped
    );
    Ok(outcome)
}

/// Picks the member title that shares the most tokens with the rest of the
/// story. Member rows arrive most recent first, so ties go to the newest.
fn representative_title(members: &[ArticleRow]) -> Option<String> {
    let token_sets: Vec<HashSet<String>> = members
        .iter()
        .map(|member| tokenize(&member.title).into_iter().collect())
        .collect();

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for set in &token_sets {
        for token in set {
            *counts.entry(token.as_str()).or_insert(0) += 1;
        }
    }

    let mut best: Option<(usize, usize)> = None;
    for (index, set) in token_sets.iter().enumerate() {
        if set.is_empty() {
            continue;
        }
        let shared: usize = set.iter().map(|token| counts[token.as_str()] - 1).sum();
        if best.map_or(true, |(_, score)| shared > score) {
            best = Some((index, shared));
        }
    }

    best.map(|(index, _)| members[index].title.clone())
}

fn titles_equivalent(a: &str, b: &str) -> bool {
    let normalize = |s: &str| s.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    normalize(a) == normalize(b)
}

/// Refreshes the representative title of every story updated within the
/// window. Returns how many stories changed. Stories whose current title is
/// already the best member title (modulo case and whitespace) are left
/// alone so their version marker stays stable.
pub async fn refresh_titles(db: &Database, since: &str, limit: i64) -> Result<usize, Error> {
    let stories = db.recent_stories(since, limit).await?;
    let mut refreshed = 0;

    for story in &stories {
        let members = db.story_members(story.id, TITLE_REFRESH_MEMBERS).await?;
        if members.is_empty() {
            warn!("Story {} has no linked articles", story.id);
            continue;
        }
        let Some(title) = representative_title(&members) else {
            continue;
        };
        if !titles_equivalent(&title, &story.title) {
            db.set_story_title(story.id, &title).await?;
            info!("Story {} retitled: {:?} -> {:?}", story.id, story.title, title);
            refreshed += 1;
        }
    }

    Ok(refreshed)
}
