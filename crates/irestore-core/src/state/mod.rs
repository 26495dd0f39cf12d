//! Restore orchestrator state machine.

pub mod handlers;
pub mod machine;

pub use handlers::{
    HandleResult, HandlerContext, LoadAction, STAGING_PLAN, StagingStep, disable_autoboot,
    handle_state,
};
pub use machine::{RestoreState, StateMachineContext};
