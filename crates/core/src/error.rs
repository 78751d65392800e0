use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid resource: {0}")]
    InvalidResource(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("invalid resource type descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("duplicate resource type: {0}")]
    DuplicateResourceType(String),

    #[error("invalid data: {0}")]
    InvalidData(String),
}
