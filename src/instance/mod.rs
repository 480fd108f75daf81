//! Instance lifecycle: state machine, start pipeline, teardown and the
//! process-wide safety net that cleans up on host exit.

pub mod hooks;
mod lifecycle;
pub mod registry;
mod seed;
mod state;

pub use lifecycle::{Instance, ServingInfo};
pub use registry::InstanceId;
pub use seed::{SeedOperation, Seeder, UnsupportedSeeder};
pub use state::InstanceState;
