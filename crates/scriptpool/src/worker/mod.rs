//! Worker process supervision.
//!
//! A [`Worker`] owns at most one live process at a time, launched with the
//! channel's child ends installed as descriptors 3 and 4.

mod spawn;
mod supervisor;

pub use supervisor::{Worker, WorkerState};
