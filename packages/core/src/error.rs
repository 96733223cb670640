use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Could not read document package: {0}")]
    Package(String),

    #[error("Missing part '{0}' in document package")]
    MissingPart(String),

    #[error("Document structure check failed: {0}")]
    Structure(String),

    #[error("Could not reconcile package resources: {0}")]
    Resource(String),

    #[error("Remote document API failed: {0}")]
    Remote(String),

    #[error("Invalid engine configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("XML error: {0}")]
    Xml(#[from] roxmltree::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Errors a live update cannot continue past. Offsets of the remaining
    /// sections depend on a consistent remote state, so the whole pass must
    /// be restarted from a fresh fetch.
    pub fn is_fatal_for_update(&self) -> bool {
        matches!(self, EngineError::Remote(_) | EngineError::Io(_))
    }
}
