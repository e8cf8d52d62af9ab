pub mod event;
pub mod watcher;
