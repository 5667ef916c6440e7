//! Process wiring for the tripwire engine: configuration, store selection,
//! sender setup and the supervised set of checker, notifier and delivery
//! loops.

pub mod config;
pub mod runtime;
pub mod seed;
