//! # evo-db
//!
//! The evolutionary state layer: MAP-Elites grids nested in an island
//! model, with weighted sampling, ring migration, and durable JSON
//! checkpoints. All population state lives behind a single store-wide
//! readers-writer lock.

pub mod checkpoint;
pub mod grid;
pub mod island;
pub mod store;

pub use checkpoint::{Checkpoint, CHECKPOINT_VERSION};
pub use grid::MapGrid;
pub use island::{FeatureStats, Island};
pub use store::ProgramStore;
