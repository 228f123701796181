//! Data-serving member lifecycle: role at startup, launch, pre-stop

pub mod launch;
pub mod prestop;
pub mod role;

pub use launch::LaunchPlan;
pub use prestop::wait_for_demotion;
pub use role::{RoleDecision, RoleResolver};
