use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use tracing::{debug, error, info, instrument, warn};

use crate::channel::ChannelSender;
use crate::config::DeliveryConfig;
use crate::db::{iso, parse_iso, Database};
use crate::error::Error;
use crate::render::render_item;
use crate::TARGET_DELIVERY;

/// Deterministic exponential backoff: `base * 2^(attempt-1)`, capped.
/// `attempt` is the number of the attempt that just failed, starting at 1.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor).min(cap)
}

/// What a single dispatch pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Nothing eligible in the queue.
    Idle,
    /// Inside the configured quiet window; nothing was touched.
    QuietHours,
    /// A rate gate blocked dispatch; the reason names the gate.
    RateLimited(String),
    Sent {
        queue_id: i64,
        message_id: String,
    },
    /// The message went out, but another writer moved the row to a terminal
    /// state first; neither the queue row nor the publish map was touched.
    Superseded {
        queue_id: i64,
    },
    /// Transient failure, row rescheduled for a later attempt.
    Retrying {
        queue_id: i64,
    },
    /// Terminal failure, row parked in `error`.
    Failed {
        queue_id: i64,
    },
}

/// Drains the publish queue one item per tick, honoring quiet hours and
/// the three rate gates. All scheduling state lives in the database, so a
/// restart resumes exactly where the previous process stopped.
pub struct DeliveryWorker {
    db: Database,
    channel: Arc<dyn ChannelSender>,
    config: DeliveryConfig,
}

impl DeliveryWorker {
    pub fn new(db: Database, channel: Arc<dyn ChannelSender>, config: DeliveryConfig) -> Self {
        DeliveryWorker {
            db,
            channel,
            config,
        }
    }

    /// Runs dispatch passes forever, one per interval.
    pub async fn run(&self) -> Result<(), Error> {
        info!(
            target: TARGET_DELIVERY,
            "Delivery worker started interval={}s max_per_hour={} max_per_day={}",
            self.config.interval.as_secs(),
            self.config.max_per_hour,
            self.config.max_per_day
        );
        loop {
            match self.process_once().await {
                Ok(outcome) => debug!(target: TARGET_DELIVERY, "Dispatch pass: {:?}", outcome),
                Err(err) => error!(target: TARGET_DELIVERY, "Dispatch pass failed: {}", err),
            }
            tokio::time::sleep(self.config.interval).await;
        }
    }

    pub async fn process_once(&self) -> Result<DispatchOutcome, Error> {
        self.process_at(Utc::now()).await
    }

    /// One dispatch pass evaluated at a given instant. Taking the clock as
    /// an argument keeps the scheduling rules testable.
    #[instrument(target = "delivery", level = "debug", skip(self))]
    pub async fn process_at(&self, now: DateTime<Utc>) -> Result<DispatchOutcome, Error> {
        if let Some(quiet) = self.config.quiet_hours {
            let local = now + chrono::Duration::hours(self.config.utc_offset_hours as i64);
            if quiet.contains(local.hour()) {
                debug!(target: TARGET_DELIVERY, "Quiet hours, holding queue");
                return Ok(DispatchOutcome::QuietHours);
            }
        }

        if let Some(reason) = self.rate_gate(now).await? {
            debug!(target: TARGET_DELIVERY, "Rate gate: {}", reason);
            return Ok(DispatchOutcome::RateLimited(reason));
        }

        let item = match self.db.next_ready(now).await? {
            Some(item) => item,
            None => return Ok(DispatchOutcome::Idle),
        };

        let text = match render_item(&self.db, item.item_type, item.item_id, self.config.mode)
            .await
        {
            Ok(text) => text,
            Err(err) => {
                // An unrenderable item can never succeed; park it.
                warn!(
                    target: TARGET_DELIVERY,
                    "queue_id={} cannot be rendered: {}", item.id, err
                );
                self.db.mark_failed(item.id, &err.to_string()).await?;
                return Ok(DispatchOutcome::Failed { queue_id: item.id });
            }
        };

        match self.channel.send(&text, self.config.mode, None).await {
            Ok(message_id) => {
                let transitioned = self.db.mark_sent(item.id, &message_id).await?;
                if !transitioned {
                    warn!(
                        target: TARGET_DELIVERY,
                        "queue_id={} raced to a terminal state; publish map untouched", item.id
                    );
                    return Ok(DispatchOutcome::Superseded { queue_id: item.id });
                }
                self.db
                    .upsert_publish_map(
                        item.item_type,
                        item.item_id,
                        &message_id,
                        &text,
                        self.config.mode,
                    )
                    .await?;
                info!(
                    target: TARGET_DELIVERY,
                    "Delivered {}#{} queue_id={} message_id={}",
                    item.item_type, item.item_id, item.id, message_id
                );
                Ok(DispatchOutcome::Sent {
                    queue_id: item.id,
                    message_id,
                })
            }
            Err(channel_err) => {
                let err: Error = channel_err.into();
                let attempt = item.attempts as u32 + 1;
                if err.is_transient() && attempt < self.config.max_attempts {
                    let delay =
                        backoff_delay(attempt, self.config.backoff_base, self.config.backoff_cap);
                    let retry_at = now + chrono::Duration::seconds(delay.as_secs() as i64);
                    self.db
                        .requeue_after_failure(item.id, &err.to_string(), retry_at)
                        .await?;
                    warn!(
                        target: TARGET_DELIVERY,
                        "queue_id={} attempt {} failed, retrying at {}: {}",
                        item.id, attempt, iso(retry_at), err
                    );
                    Ok(DispatchOutcome::Retrying { queue_id: item.id })
                } else {
                    self.db.mark_failed(item.id, &err.to_string()).await?;
                    error!(
                        target: TARGET_DELIVERY,
                        "queue_id={} failed terminally after {} attempts: {}",
                        item.id, attempt, err
                    );
                    Ok(DispatchOutcome::Failed { queue_id: item.id })
                }
            }
        }
    }

    /// Checks the min-interval, per-hour, and per-day gates against the
    /// persisted send history. Returns the name of the first gate hit.
    async fn rate_gate(&self, now: DateTime<Utc>) -> Result<Option<String>, Error> {
        if let Some(last) = self.db.last_sent_at().await? {
            if let Some(last_at) = parse_iso(&last) {
                let elapsed = now.signed_duration_since(last_at);
                let minimum = chrono::Duration::seconds(self.config.interval.as_secs() as i64);
                if elapsed < minimum {
                    return Ok(Some(format!(
                        "min interval: {}s since last send, need {}s",
                        elapsed.num_seconds(),
                        minimum.num_seconds()
                    )));
                }
            }
        }

        let hour_ago = iso(now - chrono::Duration::hours(1));
        if self.db.count_sent_since(&hour_ago).await? >= self.config.max_per_hour {
            return Ok(Some(format!(
                "hourly cap of {} reached",
                self.config.max_per_hour
            )));
        }

        let day_ago = iso(now - chrono::Duration::hours(24));
        if self.db.count_sent_since(&day_ago).await? >= self.config.max_per_day {
            return Ok(Some(format!(
                "daily cap of {} reached",
                self.config.max_per_day
            )));
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::channel::testing::FakeChannel;
    use crate::channel::ChannelError;
    use crate::config::QuietHours;
    use crate::types::{ItemType, ParseMode, QueueStatus};
    use chrono::TimeZone;

    fn fast_config() -> DeliveryConfig {
        DeliveryConfig {
            interval: Duration::from_secs(0),
            backoff_base: Duration::from_secs(60),
            backoff_cap: Duration::from_secs(3600),
            max_attempts: 3,
            ..DeliveryConfig::default()
        }
    }

    async fn seed_article_item(db: &Database) -> i64 {
        let news_id = db
            .insert_article("Team X wins 3-1", None, None, None)
            .await
            .unwrap();
        db.enqueue_article(news_id, 0, None).await.unwrap().queue_id
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let base = Duration::from_secs(60);
        let cap = Duration::from_secs(300);
        assert_eq!(backoff_delay(1, base, cap), Duration::from_secs(60));
        assert_eq!(backoff_delay(2, base, cap), Duration::from_secs(120));
        assert_eq!(backoff_delay(3, base, cap), Duration::from_secs(240));
        assert_eq!(backoff_delay(4, base, cap), Duration::from_secs(300));
        assert_eq!(backoff_delay(40, base, cap), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn successful_send_updates_queue_and_map() {
        let db = Database::new_in_memory().await.unwrap();
        let queue_id = seed_article_item(&db).await;
        let channel = Arc::new(FakeChannel::new());
        let worker = DeliveryWorker::new(db.clone(), channel.clone(), fast_config());

        let outcome = worker.process_once().await.unwrap();
        match outcome {
            DispatchOutcome::Sent {
                queue_id: sent_id,
                ref message_id,
            } => {
                assert_eq!(sent_id, queue_id);
                let item = db.get_queue_item(queue_id).await.unwrap().unwrap();
                assert_eq!(item.status, QueueStatus::Sent);
                let entry = db
                    .get_publish_map(item.item_type, item.item_id)
                    .await
                    .unwrap()
                    .unwrap();
                assert_eq!(&entry.message_id, message_id);
            }
            other => panic!("expected Sent, got {:?}", other),
        }
        assert_eq!(channel.send_count(), 1);
    }

    /// Channel whose send lets another writer cancel the queue row while
    /// the message is in flight.
    struct CancellingChannel {
        db: Database,
        queue_id: i64,
    }

    #[async_trait]
    impl ChannelSender for CancellingChannel {
        async fn send(
            &self,
            _text: &str,
            _mode: ParseMode,
            _reply_to: Option<&str>,
        ) -> Result<String, ChannelError> {
            self.db
                .mark_skipped(self.queue_id)
                .await
                .map_err(|e| ChannelError::Permanent(e.to_string()))?;
            Ok("msg-raced".to_string())
        }

        async fn edit(
            &self,
            _message_id: &str,
            _text: &str,
            _mode: ParseMode,
        ) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn send_that_loses_the_race_is_not_reported_as_sent() {
        let db = Database::new_in_memory().await.unwrap();
        let queue_id = seed_article_item(&db).await;
        let channel = Arc::new(CancellingChannel {
            db: db.clone(),
            queue_id,
        });
        let worker = DeliveryWorker::new(db.clone(), channel, fast_config());

        assert_eq!(
            worker.process_once().await.unwrap(),
            DispatchOutcome::Superseded { queue_id }
        );

        let item = db.get_queue_item(queue_id).await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Skipped);
        assert!(db
            .get_publish_map(ItemType::Article, item.item_id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn quiet_hours_keep_items_queued() {
        let db = Database::new_in_memory().await.unwrap();
        let queue_id = seed_article_item(&db).await;
        let channel = Arc::new(FakeChannel::new());
        let config = DeliveryConfig {
            quiet_hours: Some(QuietHours { start: 23, end: 8 }),
            ..fast_config()
        };
        let worker = DeliveryWorker::new(db.clone(), channel.clone(), config);

        let midnight = Utc.with_ymd_and_hms(2026, 3, 1, 0, 30, 0).unwrap();
        let outcome = worker.process_at(midnight).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::QuietHours);
        assert_eq!(channel.send_count(), 0);
        let item = db.get_queue_item(queue_id).await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Queued);

        let noon = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        assert!(matches!(
            worker.process_at(noon).await.unwrap(),
            DispatchOutcome::Sent { .. }
        ));
    }

    #[tokio::test]
    async fn quiet_hours_apply_in_local_time() {
        let db = Database::new_in_memory().await.unwrap();
        seed_article_item(&db).await;
        let channel = Arc::new(FakeChannel::new());
        let config = DeliveryConfig {
            quiet_hours: Some(QuietHours { start: 23, end: 8 }),
            utc_offset_hours: 3,
            ..fast_config()
        };
        let worker = DeliveryWorker::new(db, channel, config);

        // 21:00 UTC is 00:00 local at +3, inside the window.
        let evening = Utc.with_ymd_and_hms(2026, 3, 1, 21, 0, 0).unwrap();
        assert_eq!(
            worker.process_at(evening).await.unwrap(),
            DispatchOutcome::QuietHours
        );
    }

    #[tokio::test]
    async fn transient_failures_retry_then_park() {
        let db = Database::new_in_memory().await.unwrap();
        let queue_id = seed_article_item(&db).await;
        let channel = Arc::new(FakeChannel::new());
        for _ in 0..3 {
            channel.script_send(Err(ChannelError::Transient("HTTP 503".to_string())));
        }
        let worker = DeliveryWorker::new(db.clone(), channel.clone(), fast_config());

        let mut now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(
            worker.process_at(now).await.unwrap(),
            DispatchOutcome::Retrying { queue_id }
        );
        now += chrono::Duration::hours(2);
        assert_eq!(
            worker.process_at(now).await.unwrap(),
            DispatchOutcome::Retrying { queue_id }
        );
        now += chrono::Duration::hours(2);
        assert_eq!(
            worker.process_at(now).await.unwrap(),
            DispatchOutcome::Failed { queue_id }
        );

        let item = db.get_queue_item(queue_id).await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Error);
        assert_eq!(item.attempts, 3);
        assert!(item.error.as_deref().unwrap_or("").contains("503"));

        // No fourth attempt: the row is terminal.
        now += chrono::Duration::hours(2);
        assert_eq!(worker.process_at(now).await.unwrap(), DispatchOutcome::Idle);
        assert_eq!(channel.send_count(), 3);
        assert!(db.get_publish_map(ItemType::Article, item.item_id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn permanent_failure_parks_immediately() {
        let db = Database::new_in_memory().await.unwrap();
        let queue_id = seed_article_item(&db).await;
        let channel = Arc::new(FakeChannel::new());
        channel.script_send(Err(ChannelError::Permanent("message too long".to_string())));
        let worker = DeliveryWorker::new(db.clone(), channel.clone(), fast_config());

        assert_eq!(
            worker.process_once().await.unwrap(),
            DispatchOutcome::Failed { queue_id }
        );
        let item = db.get_queue_item(queue_id).await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Error);
        assert_eq!(item.attempts, 1);
    }

    #[tokio::test]
    async fn min_interval_defers_the_next_send() {
        let db = Database::new_in_memory().await.unwrap();
        seed_article_item(&db).await;
        let second = db
            .insert_article("Another headline entirely", None, None, None)
            .await
            .unwrap();
        db.enqueue_article(second, 0, None).await.unwrap();

        let channel = Arc::new(FakeChannel::new());
        let config = DeliveryConfig {
            interval: Duration::from_secs(300),
            ..fast_config()
        };
        let worker = DeliveryWorker::new(db.clone(), channel.clone(), config);

        assert!(matches!(
            worker.process_once().await.unwrap(),
            DispatchOutcome::Sent { .. }
        ));
        assert!(matches!(
            worker.process_once().await.unwrap(),
            DispatchOutcome::RateLimited(_)
        ));
        assert_eq!(channel.send_count(), 1);
    }

    #[tokio::test]
    async fn hourly_cap_blocks_dispatch() {
        let db = Database::new_in_memory().await.unwrap();
        seed_article_item(&db).await;
        // Simulate an already-exhausted hourly budget.
        for n in 0..2 {
            let outcome = db
                .enqueue(
                    ItemType::Article,
                    100 + n,
                    0,
                    None,
                    &format!("article:{}:seed", 100 + n),
                )
                .await
                .unwrap();
            db.mark_sent(outcome.queue_id, &format!("m{}", n)).await.unwrap();
        }

        let channel = Arc::new(FakeChannel::new());
        let config = DeliveryConfig {
            max_per_hour: 2,
            ..fast_config()
        };
        let worker = DeliveryWorker::new(db, channel.clone(), config);

        // Evaluate well past the min-interval gate so only the cap applies.
        let later = Utc::now() + chrono::Duration::minutes(30);
        let outcome = worker.process_at(later).await.unwrap();
        match outcome {
            DispatchOutcome::RateLimited(reason) => assert!(reason.contains("hourly")),
            other => panic!("expected RateLimited, got {:?}", other),
        }
        assert_eq!(channel.send_count(), 0);
    }
}
