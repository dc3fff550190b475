use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

use crate::error::Error;

/// How many of the most frequent title tokens make up the title signature.
const TITLE_SIG_TOKENS: usize = 8;

static WORD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-zА-Яа-я0-9\-]+").expect("valid token regex"));

static RU_STOP: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "и", "в", "на", "к", "по", "о", "от", "за", "для", "с", "во", "как", "или", "но", "а",
        "не", "это", "что", "из", "со", "же", "бы", "ли", "до", "об", "обо", "над", "между",
        "при", "под", "у", "про", "ещё",
    ]
    .into_iter()
    .collect()
});

static EN_STOP: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "and", "or", "the", "a", "an", "of", "in", "on", "to", "for", "by", "with", "as", "at",
        "from", "is", "are", "was", "were", "be", "this", "that", "these", "those", "it", "its",
        "their", "your", "our", "his", "her",
    ]
    .into_iter()
    .collect()
});

/// Entities recognized for an article by the external categorization
/// component. All fields optional; a fully empty set is valid input.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct RecognizedEntities {
    pub sport: Option<String>,
    pub tournament: Option<String>,
    pub team: Option<String>,
    pub player: Option<String>,
}

impl RecognizedEntities {
    pub fn is_empty(&self) -> bool {
        self.sport.is_none()
            && self.tournament.is_none()
            && self.team.is_none()
            && self.player.is_none()
    }
}

/// Comparable signature derived from an article's title and entities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub title_sig: String,
    pub entity_sig: Option<String>,
}

/// Lowercases, NFKC-normalizes and splits a title into significant tokens,
/// dropping RU/EN stopwords.
pub fn tokenize(text: &str) -> Vec<String> {
    let normalized: String = text.nfkc().collect();
    WORD_RE
        .find_iter(&normalized)
        .map(|m| m.as_str().to_lowercase())
        .filter(|tok| !RU_STOP.contains(tok.as_str()) && !EN_STOP.contains(tok.as_str()))
        .collect()
}

/// Builds the title signature: the most frequent tokens (ties broken
/// alphabetically), sorted and `|`-joined so that token order in the
/// original title does not matter.
pub fn title_signature(tokens: &[String]) -> String {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for token in tokens {
        *counts.entry(token.as_str()).or_insert(0) += 1;
    }
    let mut ranked: Vec<(&str, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    let mut top: Vec<&str> = ranked
        .into_iter()
        .take(TITLE_SIG_TOKENS)
        .map(|(tok, _)| tok)
        .collect();
    top.sort_unstable();
    top.join("|")
}

/// Builds the entity signature from recognized entities, or `None` when no
/// entity was supplied.
pub fn entity_signature(entities: &RecognizedEntities) -> Option<String> {
    let mut parts: Vec<String> = Vec::new();
    if let Some(tournament) = &entities.tournament {
        parts.push(format!("t:{}", tournament.trim().to_lowercase()));
    }
    if let Some(team) = &entities.team {
        parts.push(format!("team:{}", team.trim().to_lowercase()));
    }
    if let Some(player) = &entities.player {
        parts.push(format!("p:{}", player.trim().to_lowercase()));
    }
    if let Some(sport) = &entities.sport {
        parts.push(format!("s:{}", sport.trim().to_lowercase()));
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("|"))
    }
}

/// Splits a stored signature back into its tokens.
pub fn signature_tokens(signature: &str) -> Vec<&str> {
    signature.split('|').filter(|s| !s.is_empty()).collect()
}

/// Jaccard set similarity. Two empty sets compare as identical.
pub fn jaccard<S: AsRef<str>>(a: &[S], b: &[S]) -> f64 {
    let set_a: HashSet<&str> = a.iter().map(|s| s.as_ref()).collect();
    let set_b: HashSet<&str> = b.iter().map(|s| s.as_ref()).collect();
    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    intersection as f64 / union as f64
}

/// Derives the comparable signature for an article.
///
/// Recomputing for the same input always yields the same signature, so the
/// stored fingerprint can be upserted blindly.
pub fn compute_fingerprint(
    title: &str,
    entities: &RecognizedEntities,
) -> Result<Fingerprint, Error> {
    let tokens = tokenize(title);
    if tokens.is_empty() {
        return Err(Error::Validation(format!(
            "title is empty after normalization: {:?}",
            title
        )));
    }
    Ok(Fingerprint {
        title_sig: title_signature(&tokens),
        entity_sig: entity_signature(entities),
    })
}
