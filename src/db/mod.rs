pub mod article;
pub mod core;
pub mod fingerprint;
pub mod publish;
pub mod queue;
pub mod schema;
pub mod story;

pub use core::{iso, now_iso, parse_iso, Database};
pub use publish::{NewPublishEdit, PublishEditRow, PublishMapEntry};
pub use queue::{dedup_key, EnqueueOutcome, QueueItem};
