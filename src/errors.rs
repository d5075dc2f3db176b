//! # Error Types
//!
//! One error enum for the whole agent. The variants correspond to the
//! behaviors the executor and the retry combinator key on: `NotFound` is
//! swallowed in delete paths and surfaced on reads, `AlreadyExists` is
//! swallowed in create paths, `Transient` is retried with backoff,
//! `Validation` is fatal before any side effect, `Execution` is fatal for
//! the run and leaves state untouched for the failing step.

use thiserror::Error;

/// Result alias used throughout the agent core.
pub type AgentResult<T> = Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    /// A parameter, file, job, pipeline or release tag does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// A resource that was being created already exists.
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// A network or throttling failure worth retrying.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Bad configuration; refused before any side effect.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A plan, apply or approval step failed remotely.
    #[error("execution failed: {0}")]
    Execution(String),

    /// A destroy step failed; downgraded to a warning outside hard-delete mode.
    #[error("destroy failed: {0}")]
    Destroy(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AgentError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, AgentError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, AgentError::AlreadyExists(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, AgentError::Transient(_))
    }

    /// Attach context to an error while keeping its kind intact for the
    /// variants the callers branch on.
    pub fn context(self, msg: &str) -> AgentError {
        match self {
            AgentError::NotFound(m) => AgentError::NotFound(format!("{msg}: {m}")),
            AgentError::AlreadyExists(m) => AgentError::AlreadyExists(format!("{msg}: {m}")),
            AgentError::Transient(m) => AgentError::Transient(format!("{msg}: {m}")),
            AgentError::Validation(m) => AgentError::Validation(format!("{msg}: {m}")),
            AgentError::Execution(m) => AgentError::Execution(format!("{msg}: {m}")),
            AgentError::Destroy(m) => AgentError::Destroy(format!("{msg}: {m}")),
            AgentError::Other(e) => AgentError::Other(e.context(msg.to_string())),
        }
    }
}

impl From<std::io::Error> for AgentError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::NotFound {
            AgentError::NotFound(e.to_string())
        } else {
            AgentError::Other(anyhow::Error::new(e))
        }
    }
}

impl From<serde_yaml::Error> for AgentError {
    fn from(e: serde_yaml::Error) -> Self {
        AgentError::Validation(format!("invalid YAML document: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_checks_match_variants() {
        assert!(AgentError::NotFound("x".into()).is_not_found());
        assert!(AgentError::AlreadyExists("x".into()).is_already_exists());
        assert!(AgentError::Transient("x".into()).is_transient());
        assert!(!AgentError::Execution("x".into()).is_transient());
    }

    #[test]
    fn context_preserves_kind() {
        let e = AgentError::NotFound("state.yaml".into()).context("loading state");
        assert!(e.is_not_found());
        assert!(e.to_string().contains("loading state"));
    }

    #[test]
    fn io_not_found_maps_to_not_found() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let e: AgentError = io.into();
        assert!(e.is_not_found());
    }
}
