//! Built-in actions.
//!
//! `finish`, `invalid_action` and `no_action` are sentinels the orchestration
//! loop relies on and are registered by every
//! [`ActionRegistryBuilder`](crate::ActionRegistryBuilder). `echo` is a demo
//! domain action registered on request.

mod echo;
mod sentinels;

pub use echo::EchoAction;
pub use sentinels::{FinishAction, InvalidAction, NoAction};

/// Name of the terminal action.
pub const FINISH: &str = "finish";
/// Name of the sentinel for unknown actions.
pub const INVALID_ACTION: &str = "invalid_action";
/// Name of the sentinel for a missing action.
pub const NO_ACTION: &str = "no_action";
