use std::fmt;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures surfaced by the import engine.
///
/// Callers decide between a requeue and a terminal status by category; see
/// [`Error::is_retryable`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A referenced object does not exist. Usually a signal to fall through
    /// to the next discovery strategy.
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    /// Input that can never succeed as given: bad PEM, an unknown strategy,
    /// an empty required payload.
    #[error("{0}")]
    Malformed(String),

    /// The hub's public API address could not be determined.
    #[error("cannot determine the hub kube-apiserver address: {reason}")]
    ApiServerUnknown {
        reason: String,
        infrastructure_missing: bool,
    },

    /// A remote call failed; safe to retry.
    #[error(transparent)]
    Remote(#[from] anyhow::Error),

    /// An auto-import secret ran out of retries and was removed.
    #[error("auto-import retries exhausted for cluster {0}")]
    BudgetExhausted(String),
}

// === impl Error ===

impl Error {
    pub fn not_found(kind: &'static str, name: impl fmt::Display) -> Self {
        Self::NotFound {
            kind,
            name: name.to_string(),
        }
    }

    pub fn malformed(msg: impl fmt::Display) -> Self {
        Self::Malformed(msg.to_string())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Only transient remote failures warrant an automatic retry. Not-found
    /// conditions may resolve on their own once the missing object appears,
    /// so they are retried as well.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Remote(_) | Self::NotFound { .. } => true,
            Self::ApiServerUnknown {
                infrastructure_missing,
                ..
            } => !infrastructure_missing,
            Self::Malformed(_) | Self::BudgetExhausted(_) => false,
        }
    }
}
