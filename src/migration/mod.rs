//! Data migrations driven by bulk commands
//!
//! A migration is a small state machine. Its current state is inferred from
//! the data with probe queries, and each step moves it to the next state by
//! running one bulk command over the matching records.

mod descriptor;
mod service;

pub use descriptor::{
    load_descriptors, parse_descriptors, CommandTemplate, MigrationDescriptor, MigrationStateDef,
    MigrationStep,
};
pub use service::{MigrationService, MigrationStatusView};
