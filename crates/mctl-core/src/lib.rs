pub mod approvals;
pub mod artifacts;
pub mod config;
pub mod engine_loop;
pub mod error;
pub mod event_bus;
pub mod fan_in;
pub mod intent;
pub mod maintenance;
pub mod notify;
pub mod orchestrator;
pub mod peer;
pub mod policy;
pub mod prompt;
pub mod replan;
pub mod roles;
pub mod runtime;
pub mod side_effects;
pub mod storage;
pub mod tenant;
pub mod tools;
pub mod verdicts;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub const DEFAULT_ENGINE_HOST: &str = "127.0.0.1";
pub const DEFAULT_ENGINE_PORT: u16 = 39741;

pub use artifacts::*;
pub use config::*;
pub use engine_loop::*;
pub use error::*;
pub use event_bus::*;
pub use fan_in::*;
pub use maintenance::*;
pub use notify::*;
pub use orchestrator::*;
pub use peer::*;
pub use policy::*;
pub use replan::*;
pub use roles::*;
pub use runtime::*;
pub use side_effects::*;
pub use storage::*;
pub use tools::*;
