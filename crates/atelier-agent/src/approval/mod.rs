pub mod rules;
pub mod service;
pub mod waiter;

pub use rules::matches_auto_approve_rules;
pub use service::ApprovalService;
pub use waiter::{ApprovalWaiter, WaitOutcome};
