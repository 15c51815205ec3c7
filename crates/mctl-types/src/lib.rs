mod approval;
mod event;
mod handoff;
mod insight;
pub mod legacy_status;
mod review;
mod role;
mod run;
mod span;
mod task;

pub use approval::*;
pub use event::*;
pub use handoff::*;
pub use insight::*;
pub use review::*;
pub use role::*;
pub use run::*;
pub use span::*;
pub use task::*;

pub fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", uuid::Uuid::new_v4().simple())
}
