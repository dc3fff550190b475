use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::channel::ChannelSender;
use crate::db::{Database, NewPublishEdit};
use crate::error::Error;
use crate::types::{EditAction, ItemType, ParseMode};
use crate::TARGET_DELIVERY;

/// One post-delivery revision request.
#[derive(Debug, Clone)]
pub struct ReviseRequest {
    pub item_type: ItemType,
    pub item_id: i64,
    pub action: EditAction,
    pub text: String,
    /// Overrides the mode the item was originally delivered with.
    pub mode: Option<ParseMode>,
}

#[derive(Debug, Clone)]
pub struct ReviseOutcome {
    /// Message id the revision landed on: the edited message for edits,
    /// the new reply for appends.
    pub message_id: String,
    pub action: EditAction,
}

/// Applies in-place edits and threaded appends to already-delivered items,
/// keeping `publish_map` pointing at the current rendering and logging every
/// attempt in `publish_edits`.
pub struct EditTracker {
    db: Database,
    channel: Arc<dyn ChannelSender>,
}

impl EditTracker {
    pub fn new(db: Database, channel: Arc<dyn ChannelSender>) -> Self {
        EditTracker { db, channel }
    }

    #[instrument(target = "delivery", level = "info", skip(self, request), fields(item_type = %request.item_type, item_id = request.item_id))]
    pub async fn revise(&self, request: ReviseRequest) -> Result<ReviseOutcome, Error> {
        let entry = self
            .db
            .get_publish_map(request.item_type, request.item_id)
            .await?
            .ok_or(Error::NotYetPublished {
                item_type: request.item_type,
                item_id: request.item_id,
            })?;

        let mode = request.mode.unwrap_or(entry.mode);

        match request.action {
            EditAction::Edit => self.apply_edit(&request, &entry.message_id, entry.text, mode).await,
            EditAction::Append => self.apply_append(&request, &entry.message_id, mode).await,
        }
    }

    async fn apply_edit(
        &self,
        request: &ReviseRequest,
        message_id: &str,
        old_text: Option<String>,
        mode: ParseMode,
    ) -> Result<ReviseOutcome, Error> {
        if old_text.as_deref() == Some(request.text.as_str()) {
            warn!(
                target: TARGET_DELIVERY,
                "Edit of {}#{} repeats the delivered text",
                request.item_type, request.item_id
            );
        }

        match self.channel.edit(message_id, &request.text, mode).await {
            Ok(()) => {
                self.db
                    .upsert_publish_map(
                        request.item_type,
                        request.item_id,
                        message_id,
                        &request.text,
                        mode,
                    )
                    .await?;
                self.db
                    .record_edit(NewPublishEdit {
                        item_type: request.item_type,
                        item_id: request.item_id,
                        action: EditAction::Edit,
                        message_id,
                        reply_msg_id: None,
                        old_text: old_text.as_deref(),
                        new_text: Some(&request.text),
                        mode,
                        error: None,
                    })
                    .await?;
                info!(
                    target: TARGET_DELIVERY,
                    "Edited {}#{} message_id={}",
                    request.item_type, request.item_id, message_id
                );
                Ok(ReviseOutcome {
                    message_id: message_id.to_string(),
                    action: EditAction::Edit,
                })
            }
            Err(channel_err) => {
                let err: Error = channel_err.into();
                self.db
                    .record_edit(NewPublishEdit {
                        item_type: request.item_type,
                        item_id: request.item_id,
                        action: EditAction::Edit,
                        message_id,
                        reply_msg_id: None,
                        old_text: old_text.as_deref(),
                        new_text: Some(&request.text),
                        mode,
                        error: Some(&err.to_string()),
                    })
                    .await?;
                warn!(
                    target: TARGET_DELIVERY,
                    "Edit of {}#{} failed: {}",
                    request.item_type, request.item_id, err
                );
                Err(err)
            }
        }
    }

    async fn apply_append(
        &self,
        request: &ReviseRequest,
        message_id: &str,
        mode: ParseMode,
    ) -> Result<ReviseOutcome, Error> {
        let previous = self
            .db
            .last_append_text(request.item_type, request.item_id)
            .await?;
        if previous.as_deref() == Some(request.text.as_str()) {
            warn!(
                target: TARGET_DELIVERY,
                "Append to {}#{} repeats the previous update",
                request.item_type, request.item_id
            );
        }

        match self
            .channel
            .send(&request.text, mode, Some(message_id))
            .await
        {
            Ok(reply_id) => {
                self.db
                    .record_edit(NewPublishEdit {
                        item_type: request.item_type,
                        item_id: request.item_id,
                        action: EditAction::Append,
                        message_id,
                        reply_msg_id: Some(&reply_id),
                        old_text: None,
                        new_text: Some(&request.text),
                        mode,
                        error: None,
                    })
                    .await?;
                info!(
                    target: TARGET_DELIVERY,
                    "Appended to {}#{} reply_msg_id={}",
                    request.item_type, request.item_id, reply_id
                );
                Ok(ReviseOutcome {
                    message_id: reply_id,
                    action: EditAction::Append,
                })
            }
            Err(channel_err) => {
                let err: Error = channel_err.into();
                self.db
                    .record_edit(NewPublishEdit {
                        item_type: request.item_type,
                        item_id: request.item_id,
                        action: EditAction::Append,
                        message_id,
                        reply_msg_id: None,
                        old_text: None,
                        new_text: Some(&request.text),
                        mode,
                        error: Some(&err.to_string()),
                    })
                    .await?;
                warn!(
                    target: TARGET_DELIVERY,
                    "Append to {}#{} failed: {}",
                    request.item_type, request.item_id, err
                );
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::FakeChannel;
    use crate::channel::ChannelError;

    async fn published_story(db: &Database) -> i64 {
        let story_id = db.create_story("Cup final coverage").await.unwrap();
        db.upsert_publish_map(ItemType::Story, story_id, "100", "original text", ParseMode::Html)
            .await
            .unwrap();
        story_id
    }

    fn edit_request(item_id: i64, text: &str) -> ReviseRequest {
        ReviseRequest {
            item_type: ItemType::Story,
            item_id,
            action: EditAction::Edit,
            text: text.to_string(),
            mode: None,
        }
    }

    #[tokio::test]
    async fn revising_an_unpublished_item_writes_nothing() {
        let db = Database::new_in_memory().await.unwrap();
        let channel = Arc::new(FakeChannel::new());
        let tracker = EditTracker::new(db.clone(), channel.clone());

        let err = tracker.revise(edit_request(9, "corrected")).await.unwrap_err();
        assert!(matches!(err, Error::NotYetPublished { .. }));
        assert!(db.edits_for_item(ItemType::Story, 9).await.unwrap().is_empty());
        assert_eq!(channel.send_count(), 0);
    }

    #[tokio::test]
    async fn successful_edit_updates_map_and_log() {
        let db = Database::new_in_memory().await.unwrap();
        let channel = Arc::new(FakeChannel::new());
        let tracker = EditTracker::new(db.clone(), channel.clone());
        let story_id = published_story(&db).await;

        let outcome = tracker
            .revise(edit_request(story_id, "corrected text"))
            .await
            .unwrap();
        assert_eq!(outcome.message_id, "100");

        let entry = db
            .get_publish_map(ItemType::Story, story_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.message_id, "100");
        assert_eq!(entry.text.as_deref(), Some("corrected text"));

        let edits = db.edits_for_item(ItemType::Story, story_id).await.unwrap();
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].old_text.as_deref(), Some("original text"));
        assert_eq!(edits[0].new_text.as_deref(), Some("corrected text"));
        assert!(edits[0].error.is_none());
    }

    #[tokio::test]
    async fn failed_edit_leaves_map_untouched_but_is_logged() {
        let db = Database::new_in_memory().await.unwrap();
        let channel = Arc::new(FakeChannel::new());
        channel.script_edit(Err(ChannelError::Permanent("message not found".to_string())));
        let tracker = EditTracker::new(db.clone(), channel);
        let story_id = published_story(&db).await;

        let err = tracker
            .revise(edit_request(story_id, "corrected text"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PermanentSend(_)));

        let entry = db
            .get_publish_map(ItemType::Story, story_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.text.as_deref(), Some("original text"));

        let edits = db.edits_for_item(ItemType::Story, story_id).await.unwrap();
        assert_eq!(edits.len(), 1);
        assert!(edits[0].error.as_deref().unwrap_or("").contains("not found"));
    }

    #[tokio::test]
    async fn append_threads_under_the_original_message() {
        let db = Database::new_in_memory().await.unwrap();
        let channel = Arc::new(FakeChannel::new());
        channel.script_send(Ok("205".to_string()));
        let tracker = EditTracker::new(db.clone(), channel.clone());
        let story_id = published_story(&db).await;

        let outcome = tracker
            .revise(ReviseRequest {
                item_type: ItemType::Story,
                item_id: story_id,
                action: EditAction::Append,
                text: "Update: extra time".to_string(),
                mode: None,
            })
            .await
            .unwrap();
        assert_eq!(outcome.message_id, "205");

        let sent = channel.sent.lock().unwrap();
        assert_eq!(sent[0].1.as_deref(), Some("100"));
        drop(sent);

        // The canonical rendering is the original message, not the reply.
        let entry = db
            .get_publish_map(ItemType::Story, story_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.text.as_deref(), Some("original text"));

        let edits = db.edits_for_item(ItemType::Story, story_id).await.unwrap();
        assert_eq!(edits[0].reply_msg_id.as_deref(), Some("205"));
        assert_eq!(edits[0].action, EditAction::Append);
    }
}
