//! Core of the notification pipeline: durable cursors, the dedup pass that
//! turns a fetched window into dispatches, the watch configuration store and
//! the notification journal.

pub mod cursor;
pub mod dedup;
pub mod journal;
pub mod watch;
