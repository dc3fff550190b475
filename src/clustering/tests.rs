use chrono::{Duration, Utc};

use crate::clustering::{assign_article, best_match, similarity};
use crate::clustering::types::CandidateFingerprint;
use crate::db::{iso, Database};
use crate::fingerprint::{compute_fingerprint, Fingerprint, RecognizedEntities};

async fn ingest(
    db: &Database,
    title: &str,
    entities: &RecognizedEntities,
) -> (i64, Fingerprint) {
    let news_id = db.insert_article(title, None, None, None).await.unwrap();
    let fingerprint = compute_fingerprint(title, entities).unwrap();
    db.upsert_fingerprint(news_id, &fingerprint).await.unwrap();
    (news_id, fingerprint)
}

fn team(name: &str) -> RecognizedEntities {
    RecognizedEntities {
        team: Some(name.to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn identical_titles_share_a_story() {
    let db = Database::new_in_memory().await.unwrap();
    let none = RecognizedEntities::default();

    let (first_id, first_fp) = ingest(&db, "Lakers clinch the title", &none).await;
    let first = assign_article(&db, first_id, "Lakers clinch the title", &first_fp)
        .await
        .unwrap();
    assert!(first.created);

    let (second_id, second_fp) = ingest(&db, "Lakers Clinch The Title", &none).await;
    let second = assign_article(&db, second_id, "Lakers Clinch The Title", &second_fp)
        .await
        .unwrap();

    assert!(!second.created);
    assert_eq!(second.story_id, first.story_id);
    assert_eq!(db.count_story_members(first.story_id).await.unwrap(), 2);
}

#[tokio::test]
async fn reworded_title_with_entity_overlap_joins_story() {
    let db = Database::new_in_memory().await.unwrap();
    let team_x = team("Team X");

    let (first_id, first_fp) = ingest(&db, "Team X wins 3-1", &team_x).await;
    let first = assign_article(&db, first_id, "Team X wins 3-1", &first_fp)
        .await
        .unwrap();

    let (second_id, second_fp) = ingest(&db, "Team X 3:1 win", &team_x).await;
    let second = assign_article(&db, second_id, "Team X 3:1 win", &second_fp)
        .await
        .unwrap();

    assert_eq!(second.story_id, first.story_id);

    // An unrelated result about a different team starts its own story.
    let (third_id, third_fp) = ingest(&db, "Team Y loses the final", &team("Team Y")).await;
    let third = assign_article(&db, third_id, "Team Y loses the final", &third_fp)
        .await
        .unwrap();

    assert!(third.created);
    assert_ne!(third.story_id, first.story_id);
}

#[tokio::test]
async fn reassignment_is_idempotent() {
    let db = Database::new_in_memory().await.unwrap();
    let none = RecognizedEntities::default();

    let (news_id, fingerprint) = ingest(&db, "Derby ends in a draw", &none).await;
    let first = assign_article(&db, news_id, "Derby ends in a draw", &fingerprint)
        .await
        .unwrap();
    let second = assign_article(&db, news_id, "Derby ends in a draw", &fingerprint)
        .await
        .unwrap();

    assert_eq!(first.story_id, second.story_id);
    assert!(!second.created);
    assert_eq!(db.count_story_members(first.story_id).await.unwrap(), 1);
}

#[tokio::test]
async fn stale_stories_are_not_candidates() {
    let db = Database::new_in_memory().await.unwrap();
    let none = RecognizedEntities::default();

    let (first_id, first_fp) = ingest(&db, "Cup final goes to extra time", &none).await;
    let first = assign_article(&db, first_id, "Cup final goes to extra time", &first_fp)
        .await
        .unwrap();

    // Age the story past the lookback window.
    let stale = iso(Utc::now() - Duration::hours(100));
    sqlx::query("UPDATE stories SET updated_at = ?1 WHERE id = ?2")
        .bind(&stale)
        .bind(first.story_id)
        .execute(db.pool())
        .await
        .unwrap();

    let (second_id, second_fp) = ingest(&db, "Cup final goes to extra time", &none).await;
    let second = assign_article(&db, second_id, "Cup final goes to extra time", &second_fp)
        .await
        .unwrap();

    assert!(second.created);
    assert_ne!(second.story_id, first.story_id);
}

#[test]
fn entity_overlap_boosts_similarity() {
    let fingerprint = compute_fingerprint("Team X wins 3-1", &team("Team X")).unwrap();
    let candidate = CandidateFingerprint {
        story_id: 1,
        news_id: 1,
        title_sig: compute_fingerprint("Team X 3:1 win", &team("Team X"))
            .unwrap()
            .title_sig,
        entity_sig: Some("team:team x".to_string()),
        story_updated_at: "2025-06-01T00:00:00Z".to_string(),
    };

    let with_entities = similarity(&fingerprint, &candidate);
    let without = similarity(
        &Fingerprint {
            title_sig: fingerprint.title_sig.clone(),
            entity_sig: None,
        },
        &candidate,
    );

    assert!(with_entities > without);
    assert!(with_entities >= crate::clustering::MIN_STORY_SIMILARITY);
    assert!(without < crate::clustering::MIN_STORY_SIMILARITY);
}

#[test]
fn ties_prefer_most_recently_updated_story() {
    let fingerprint = Fingerprint {
        title_sig: "final|lakers".to_string(),
        entity_sig: None,
    };
    let candidates = vec![
        CandidateFingerprint {
            story_id: 1,
            news_id: 10,
            title_sig: "final|lakers".to_string(),
            entity_sig: None,
            story_updated_at: "2025-06-01T00:00:00Z".to_string(),
        },
        CandidateFingerprint {
            story_id: 2,
            news_id: 20,
            title_sig: "final|lakers".to_string(),
            entity_sig: None,
            story_updated_at: "2025-06-02T00:00:00Z".to_string(),
        },
    ];

    let best = best_match(&fingerprint, &candidates).unwrap();
    assert_eq!(best.story_id, 2);
}

#[tokio::test]
async fn batch_pass_skips_unusable_titles() {
    let db = Database::new_in_memory().await.unwrap();
    db.insert_article("the of and", None, None, None).await.unwrap();
    db.insert_article("Lakers clinch the title", None, None, None)
        .await
        .unwrap();
    db.insert_article("Team Y loses the final", None, None, None)
        .await
        .unwrap();

    let since = iso(Utc::now() - Duration::days(1));
    let outcome = crate::clustering::assign_unprocessed(&db, &since, 10)
        .await
        .unwrap();
    assert_eq!(outcome.skipped, 1);
    assert_eq!(outcome.processed, 2);
    assert_eq!(outcome.created, 2);

    // The unusable article stays unassigned but never wedges the pass.
    let again = crate::clustering::assign_unprocessed(&db, &since, 10)
        .await
        .unwrap();
    assert_eq!(again.processed, 0);
    assert_eq!(again.skipped, 1);
}

#[tokio::test]
async fn title_refresh_picks_the_most_shared_member_title() {
    let db = Database::new_in_memory().await.unwrap();
    let story_id = db.create_story("Team X wins the cup final").await.unwrap();
    for (title, published_at) in [
        ("Team X wins the cup final", "2026-03-01T10:00:00Z"),
        ("Cup final win for Team X", "2026-03-01T11:00:00Z"),
        ("Coach reaction after the match", "2026-03-01T12:00:00Z"),
    ] {
        let news_id = db
            .insert_article(title, None, None, Some(published_at))
            .await
            .unwrap();
        db.attach_article(story_id, news_id).await.unwrap();
    }

    let since = iso(Utc::now() - Duration::days(1));
    let refreshed = crate::clustering::refresh_titles(&db, &since, 10)
        .await
        .unwrap();
    assert_eq!(refreshed, 1);

    // Two member titles tie on shared tokens; the newer one wins.
    let story = db.get_story(story_id).await.unwrap().unwrap();
    assert_eq!(story.title, "Cup final win for Team X");

    // A second pass is a no-op.
    assert_eq!(
        crate::clustering::refresh_titles(&db, &since, 10)
            .await
            .unwrap(),
        0
    );
}
