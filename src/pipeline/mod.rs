//! The two long-running halves of the relay: the worker that turns
//! media into transcripts, and the drain that brings finished work
//! home.

pub mod drain;
pub mod worker;

pub use drain::{resummarize, DrainRunner};
pub use worker::{PollOutcome, RelayWorker};

#[cfg(test)]
mod tests;
