pub mod channel;
pub mod clustering;
pub mod config;
pub mod db;
pub mod delivery;
pub mod editor;
pub mod error;
pub mod fingerprint;
pub mod logging;
pub mod render;
pub mod types;

pub use error::Error;

pub const TARGET_DB: &str = "db";
pub const TARGET_CHANNEL: &str = "channel";
pub const TARGET_DELIVERY: &str = "delivery";
