//! Domain layer: pure types, trait seams, and the signature/policy/approval
//! logic. Nothing in this module depends on `application`, `infrastructure`,
//! or `presentation` — infrastructure implements the traits defined here.

pub mod approval;
pub mod audit;
pub mod dispatcher;
pub mod ids;
pub mod messenger;
pub mod policy;
pub mod signature;
pub mod store;
pub mod tool;

pub use approval::{ApprovalAction, ApprovalResult, PendingRow, Waiter};
pub use audit::{AuditEntry, Resolution};
pub use dispatcher::{DispatchError, ServiceDispatcher};
pub use ids::RequestId;
pub use messenger::{ApprovalChoice, ApprovalPrompt, ApprovalResolver, MessengerAdapter, MessengerError};
pub use policy::{Decision, PolicyAction, PolicyEngine, PolicyRule, PolicyError};
pub use signature::{build_signature, validate_args, ValidationError};
pub use store::{ApprovalStore, StoreError};
pub use tool::{ArgDefinition, ToolCompileError, ToolDefinition, ToolLookup, ToolRequest};
