//! Reference implementations of the collaborator ports.
//!
//! These make the engine runnable end to end (tests, the CLI, local trial
//! runs against fixture data). Production deployments plug in their own
//! [`LegacyConnector`](crate::core::LegacyConnector) and
//! [`TargetStore`](crate::core::TargetStore).

mod json_source;
mod local;
mod memory_target;

pub use json_source::{FixtureColumn, FixtureTable, JsonFileConnector, LegacyFixture};
pub use local::LocalRuntime;
pub use memory_target::MemoryTargetStore;
