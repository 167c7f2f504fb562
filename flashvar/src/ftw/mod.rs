//! Fault-tolerant write engine.
//!
//! Wraps any multi-block flash mutation in a two-phase transaction staged in
//! a spare region, so that a power loss at any instant leaves the target with
//! either all of its old content or all of its new content.
//!
//! ```text
//!   Idle ──begin──► SpareWriting ──commit──► SpareComplete ──► DestinationComplete ──► Idle
//!                        │                        │
//!                   power loss:              power loss:
//!                   roll back                replay from spare
//! ```
//!
//! The working block holds the transaction record; a copy is kept by the
//! [secure relay](crate::relay) for as long as the transaction is live.

mod engine;
pub mod layout;
mod writer;

pub use engine::{FTW_RECORD_TAG, FtwEngine, FtwState, RecoveryOutcome, TransactionHandle};
pub use writer::TransactionWriter;
