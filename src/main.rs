use std::env;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};

use pressbox::channel::{ChannelSender, TelegramChannel};
use pressbox::clustering::{assign_article, assign_unprocessed, refresh_titles};
use pressbox::config::DeliveryConfig;
use pressbox::db::{iso, Database};
use pressbox::delivery::DeliveryWorker;
use pressbox::editor::{EditTracker, ReviseRequest};
use pressbox::fingerprint::{compute_fingerprint, RecognizedEntities};
use pressbox::types::{EditAction, ItemType};

#[derive(Parser)]
#[clap(name = "pressbox", about = "Sports news clustering and delivery")]
struct Cli {
    /// SQLite database path
    #[clap(long, env = "PRESSBOX_DB", default_value = "pressbox.db")]
    db: String,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest one article and assign it to a story
    Ingest {
        #[clap(required = true)]
        title: String,

        #[clap(long)]
        url: Option<String>,

        #[clap(long)]
        body: Option<String>,

        #[clap(long)]
        sport: Option<String>,

        #[clap(long)]
        tournament: Option<String>,

        #[clap(long)]
        team: Option<String>,

        #[clap(long)]
        player: Option<String>,
    },

    /// Assign recent unclustered articles to stories
    Cluster {
        /// How far back to look for unassigned articles
        #[clap(long, default_value = "3")]
        since_days: i64,

        /// Number of articles to process
        #[clap(short, long, default_value = "200")]
        limit: i64,
    },

    /// Refresh story titles from their most representative member
    RefreshTitles {
        #[clap(long, default_value = "3")]
        since_days: i64,

        #[clap(short, long, default_value = "50")]
        limit: i64,
    },

    /// Enqueue a story or article for delivery
    Enqueue {
        /// Story ID
        #[clap(long, conflicts_with = "article_id")]
        story_id: Option<i64>,

        /// Article ID
        #[clap(long)]
        article_id: Option<i64>,

        /// Higher goes out first
        #[clap(short, long, default_value = "0")]
        priority: i64,

        /// Earliest delivery time (RFC 3339)
        #[clap(long)]
        at: Option<String>,
    },

    /// Enqueue every story updated in a recent window
    EnqueueRecent {
        #[clap(long, default_value = "1")]
        since_days: i64,

        #[clap(short, long, default_value = "50")]
        limit: i64,

        #[clap(short, long, default_value = "0")]
        priority: i64,
    },

    /// Run the delivery worker
    Worker {
        /// Run a single dispatch pass instead of looping
        #[clap(long)]
        once: bool,
    },

    /// Edit or append to an already-delivered item
    Revise {
        #[clap(long, conflicts_with = "article_id")]
        story_id: Option<i64>,

        #[clap(long)]
        article_id: Option<i64>,

        /// Send a threaded follow-up instead of editing in place
        #[clap(long)]
        append: bool,

        #[clap(required = true)]
        text: String,
    },

    /// Cancel a still-queued item
    Skip {
        #[clap(required = true)]
        queue_id: i64,
    },
}

fn item_ref(story_id: Option<i64>, article_id: Option<i64>) -> Result<(ItemType, i64)> {
    match (story_id, article_id) {
        (Some(id), None) => Ok((ItemType::Story, id)),
        (None, Some(id)) => Ok((ItemType::Article, id)),
        _ => bail!("exactly one of --story-id or --article-id is required"),
    }
}

fn telegram_channel() -> Result<Arc<dyn ChannelSender>> {
    let token = env::var("TG_BOT_TOKEN").context("TG_BOT_TOKEN environment variable required")?;
    let chat_id: i64 = env::var("TG_CHAT_ID")
        .context("TG_CHAT_ID environment variable required")?
        .parse()
        .context("TG_CHAT_ID must be a numeric chat id")?;
    let channel = TelegramChannel::new(token, chat_id)
        .map_err(|e| anyhow::anyhow!("channel setup: {}", e))?;
    Ok(Arc::new(channel))
}

#[tokio::main]
async fn main() -> Result<()> {
    pressbox::logging::configure_logging();

    let args = Cli::parse();
    let db = Database::new(&args.db)
        .await
        .with_context(|| format!("opening database {}", args.db))?;

    match args.command {
        Commands::Ingest {
            title,
            url,
            body,
            sport,
            tournament,
            team,
            player,
        } => {
            let entities = RecognizedEntities {
                sport,
                tournament,
                team,
                player,
            };
            let fingerprint = compute_fingerprint(&title, &entities)?;
            let news_id = db
                .insert_article(&title, body.as_deref(), url.as_deref(), None)
                .await?;
            db.upsert_fingerprint(news_id, &fingerprint).await?;
            let assignment = assign_article(&db, news_id, &title, &fingerprint).await?;
            println!(
                "article {} -> story {} ({})",
                news_id,
                assignment.story_id,
                if assignment.created { "new" } else { "existing" }
            );
        }

        Commands::Cluster { since_days, limit } => {
            let since = iso(Utc::now() - Duration::days(since_days));
            let outcome = assign_unprocessed(&db, &since, limit).await?;
            println!(
                "processed {} articles ({} new stories, {} skipped)",
                outcome.processed, outcome.created, outcome.skipped
            );
        }

        Commands::RefreshTitles { since_days, limit } => {
            let since = iso(Utc::now() - Duration::days(since_days));
            let refreshed = refresh_titles(&db, &since, limit).await?;
            println!("retitled {} stories", refreshed);
        }

        Commands::Enqueue {
            story_id,
            article_id,
            priority,
            at,
        } => {
            let scheduled_at = at
                .map(|raw| {
                    DateTime::parse_from_rfc3339(&raw)
                        .map(|dt| dt.with_timezone(&Utc))
                        .with_context(|| format!("invalid --at timestamp: {}", raw))
                })
                .transpose()?;
            let (item_type, item_id) = item_ref(story_id, article_id)?;
            let outcome = match item_type {
                ItemType::Story => db.enqueue_story(item_id, priority, scheduled_at).await?,
                ItemType::Article => db.enqueue_article(item_id, priority, scheduled_at).await?,
            };
            println!(
                "queue_id {} ({})",
                outcome.queue_id,
                if outcome.inserted { "inserted" } else { "already queued" }
            );
        }

        Commands::EnqueueRecent {
            since_days,
            limit,
            priority,
        } => {
            let since = iso(Utc::now() - Duration::days(since_days));
            let stories = db.recent_stories(&since, limit).await?;
            let mut inserted = 0;
            for story in &stories {
                if db.enqueue_story(story.id, priority, None).await?.inserted {
                    inserted += 1;
                }
            }
            println!("enqueued {} of {} stories", inserted, stories.len());
        }

        Commands::Worker { once } => {
            let worker = DeliveryWorker::new(db, telegram_channel()?, DeliveryConfig::from_env());
            if once {
                let outcome = worker.process_once().await?;
                println!("{:?}", outcome);
            } else {
                worker.run().await?;
            }
        }

        Commands::Revise {
            story_id,
            article_id,
            append,
            text,
        } => {
            let (item_type, item_id) = item_ref(story_id, article_id)?;
            let tracker = EditTracker::new(db, telegram_channel()?);
            let outcome = tracker
                .revise(ReviseRequest {
                    item_type,
                    item_id,
                    action: if append {
                        EditAction::Append
                    } else {
                        EditAction::Edit
                    },
                    text,
                    mode: None,
                })
                .await?;
            println!("{:?} landed on message {}", outcome.action, outcome.message_id);
        }

        Commands::Skip { queue_id } => {
            if db.mark_skipped(queue_id).await? {
                println!("queue_id {} skipped", queue_id);
            } else {
                bail!("queue_id {} is not in a queued state", queue_id);
            }
        }
    }

    Ok(())
}
