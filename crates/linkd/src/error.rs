//! Error types for the link controller.

use std::fmt;

use crate::netlink;

/// Result type for linkd operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while reconciling declared links.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Netlink transport or kernel error.
    #[error(transparent)]
    Netlink(#[from] netlink::Error),

    /// Desired-state store failure.
    #[error("store error: {0}")]
    Store(String),

    /// A wireguard key that is not 32 bytes of base64.
    #[error("invalid wireguard key: {0}")]
    InvalidKey(String),

    /// A peer endpoint that cannot be parsed or resolved.
    #[error("invalid endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint {
        /// Endpoint text as declared.
        endpoint: String,
        /// Why it was rejected.
        reason: String,
    },

    /// An allowed-IP prefix that cannot be parsed.
    #[error("invalid IP prefix {0:?}")]
    InvalidPrefix(String),

    /// A wireguard link is declared but no wireguard client is available.
    #[error("wireguard is not available on this host (link {link})")]
    WireguardUnavailable {
        /// Link that needed the client.
        link: String,
    },

    /// A link was created but could not be found afterwards.
    #[error("link {name} missing after creation")]
    CreatedLinkMissing {
        /// Name of the created link.
        name: String,
    },

    /// Invalid declaration or controller settings.
    #[error("configuration error: {0}")]
    Config(String),

    /// Error with the step that produced it.
    #[error("{context}: {source}")]
    Context {
        /// What was being done.
        context: String,
        /// Underlying error.
        #[source]
        source: Box<Error>,
    },

    /// One or more items failed during a cycle.
    #[error(transparent)]
    Cycle(#[from] CycleError),
}

impl Error {
    /// Attach a description of the failing step.
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// True for declaration problems (keys, endpoints, prefixes, config)
    /// rather than kernel or store failures.
    pub fn is_invalid_input(&self) -> bool {
        match self {
            Self::InvalidKey(_)
            | Self::InvalidEndpoint { .. }
            | Self::InvalidPrefix(_)
            | Self::Config(_) => true,
            Self::Context { source, .. } => source.is_invalid_input(),
            _ => false,
        }
    }
}

/// Extension for attaching context to results.
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().context(context))
    }

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| e.into().context(f()))
    }
}

/// Aggregate of the per-item failures of one reconcile cycle.
#[derive(Debug, Default)]
pub struct CycleError {
    failures: Vec<(String, Error)>,
}

impl CycleError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, link: impl Into<String>, error: Error) {
        self.failures.push((link.into(), error));
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// Failures in item order as `(link name, error)`.
    pub fn failures(&self) -> &[(String, Error)] {
        &self.failures
    }

    /// `Ok(())` when nothing failed, the aggregate otherwise.
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::Cycle(self))
        }
    }
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} link(s) failed to sync", self.failures.len())?;
        for (link, error) in &self.failures {
            write!(f, "; {link}: {error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CycleError {}
