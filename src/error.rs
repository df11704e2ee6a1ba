//! Error types surfaced by limiter construction and transport bootstrap
use std::fmt;
use std::io;

/// Unified error type for limiter setup.
///
/// Transient DHT I/O failures never appear here: they are counted on the
/// limiter (`err_count`) and otherwise swallowed, and `check` itself is
/// infallible.
#[derive(Debug)]
pub enum LimiterError {
    /// Configuration rejected at construction
    Config { message: String },
    /// All bind attempts failed: the master port and every fallback port
    Bind { attempts: usize, source: io::Error },
    /// A seed address could not be resolved
    Resolve { seed: String, source: io::Error },
}

impl fmt::Display for LimiterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config { message } => write!(f, "invalid limiter configuration: {}", message),
            Self::Bind { attempts, source } => {
                write!(f, "transport bind failed after {} attempts: {}", attempts, source)
            }
            Self::Resolve { seed, source } => {
                write!(f, "seed {:?} did not resolve: {}", seed, source)
            }
        }
    }
}

impl std::error::Error for LimiterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config { .. } => None,
            Self::Bind { source, .. } => Some(source),
            Self::Resolve { source, .. } => Some(source),
        }
    }
}

impl LimiterError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    /// Check if this error is a configuration error
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config { .. })
    }

    /// Check if this error is a bind failure
    pub fn is_bind(&self) -> bool {
        matches!(self, Self::Bind { .. })
    }

    /// Check if this error is a seed resolution failure
    pub fn is_resolve(&self) -> bool {
        matches!(self, Self::Resolve { .. })
    }

    /// Access bind failure info as (attempts, io error kind).
    pub fn bind_details(&self) -> Option<(usize, io::ErrorKind)> {
        match self {
            Self::Bind { attempts, source } => Some((*attempts, source.kind())),
            _ => None,
        }
    }
}
