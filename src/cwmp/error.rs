use thiserror::Error;

#[derive(Debug, Error)]
pub enum CwmpError {
    #[error("No ManagementServer.ConnectionRequestURL parameter in message")]
    NotFound,

    #[error("Malformed CWMP XML: {0}")]
    Malformed(String),

    #[error("Failed to read request body: {0}")]
    Io(#[from] std::io::Error),
}

impl CwmpError {
    pub(crate) fn malformed(err: impl std::fmt::Display) -> Self {
        CwmpError::Malformed(err.to_string())
    }
}
