//! Trigger evaluation: the per-trigger state machine, the lease that keeps
//! evaluation of one trigger exclusive across workers, and the worker pool
//! that drains the check queue.

pub mod check;
pub mod error;
pub mod lock;
pub mod state;
pub mod worker;

#[cfg(test)]
mod tests;
