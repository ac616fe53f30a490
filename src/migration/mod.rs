//! Migration module
//!
//! Statements, policy definitions, descriptors and the sequencer that turns
//! them into an ordered plan.

mod descriptor;
mod models;
mod sequencer;

pub use descriptor::{DescriptorError, MigrationDescriptor};
pub use models::*;
pub use sequencer::StatementSequencer;
