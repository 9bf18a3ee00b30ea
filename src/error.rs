//! Top-level process error type. Domain/application/infrastructure errors
//! are typed (`thiserror`); this is only the outer boundary `main` and
//! config loading report through, in the style of the teacher's own
//! top-level `anyhow::Result` usage in `cli/src/main.rs`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WardenError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Store(#[from] crate::domain::store::StoreError),
    #[error(transparent)]
    Registry(#[from] crate::application::registry::RegistryError),
    #[error(transparent)]
    Policy(#[from] crate::domain::policy::PolicyError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
