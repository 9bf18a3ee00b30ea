//! Application layer: use-case orchestration over the domain layer. Depends
//! only on `domain`, never on `infrastructure` or `presentation` concrete
//! types — infrastructure is injected as trait objects.

pub mod coordinator;
pub mod policy_service;
pub mod registry;

pub use coordinator::{ApprovalCoordinator, CoordinatorError};
pub use policy_service::{Evaluation, PolicyService};
pub use registry::{RegistryError, ToolRegistry};
