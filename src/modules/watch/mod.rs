//! # Watch Feed Module
//!
//! Consumes the cluster watch feed and keeps the backend registry current.
//!
//! The feed is newline-delimited JSON, one event per line:
//!
//! ```text
//! {"type":"ADDED","object":{"name":"server-0","namespace":"shutdownpoc","labels":{"app":"server"},"podIP":"10.0.0.1","ready":true}}
//! {"type":"MODIFIED","object":{"name":"server-0","podIP":"10.0.0.1","ready":true,"deletionTimestamp":"2024-01-01T00:00:00Z"}}
//! {"type":"DELETED","object":{"name":"server-0"}}
//! ```
//!
//! ## Configuration
//!
//! ```toml
//! [watch]
//! source = "-"
//! namespace = "shutdownpoc"
//! label_selector = "app=server"
//! ```

mod config;
mod consumer;
mod error;
mod event;
mod selector;

pub use config::{WatchSettings, STDIN_SOURCE};
pub use consumer::{open_feed, FeedReader, WatchConsumer, WatchFilter, WatchStats};
pub use error::{WatchError, WatchResult};
pub use event::{RawBackend, RawEventType, RawWatchEvent};
pub use selector::{LabelSelector, LabelSelectorOperator, LabelSelectorRequirement};
