//! Tail MongoDB change streams.
//!
//! A [`Watcher`] opens a change stream on the whole deployment, one database
//! or one collection, runs an optional aggregation pipeline on the server,
//! and hands every event to a [`Handle`] implementation until the stream
//! ends, fails, or is cancelled.
pub mod config;
pub mod mongo;
pub mod output;
pub mod pipeline;

pub use config::{Scope, Settings, StreamOptions, WatchConfig};
pub use mongo::event::{ChangeEvent, EventKind};
pub use mongo::watcher::{Closed, EventStream, Handle, HandlerError, Watcher};
