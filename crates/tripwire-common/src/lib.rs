//! Domain types shared by the checker, notifier and storage crates.

pub mod id;
pub mod types;
