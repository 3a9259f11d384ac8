//! # Crate Error Types
//!
//! Every subsystem owns a `thiserror` enum; `DlstbxError` folds them together
//! for callers that cross subsystem boundaries (the service runtime and the
//! binaries).

use thiserror::Error;

use crate::config::ConfigurationError;
use crate::database::StoreError;
use crate::filewatcher::FilewatcherError;
use crate::ispyb::IspybError;
use crate::messaging::TransportError;
use crate::recipe::RecipeError;
use crate::service::ServiceError;
use crate::trigger::TriggerError;
use crate::wrapper::WrapperError;

#[derive(Error, Debug)]
pub enum DlstbxError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Recipe error: {0}")]
    Recipe(#[from] RecipeError),

    #[error("Metadata store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Filewatcher error: {0}")]
    Filewatcher(#[from] FilewatcherError),

    #[error("Trigger error: {0}")]
    Trigger(#[from] TriggerError),

    #[error("ISPyB connector error: {0}")]
    Ispyb(#[from] IspybError),

    #[error("Wrapper error: {0}")]
    Wrapper(#[from] WrapperError),
}

impl DlstbxError {
    /// The message itself is at fault; redelivering it cannot help
    pub fn is_malformed(&self) -> bool {
        match self {
            Self::Recipe(e) => e.is_malformed(),
            Self::Service(ServiceError::Malformed { .. }) => true,
            Self::Filewatcher(e) => e.is_malformed(),
            Self::Trigger(e) => e.is_malformed(),
            Self::Ispyb(e) => e.is_malformed(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, DlstbxError>;
