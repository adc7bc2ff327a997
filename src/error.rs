//! Error types for SAS topology discovery
//!
//! Provides structured error types for every discovery component: the
//! state-machine stack, expander enumeration, route configuration, device
//! bring-up and the async session driver.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the discovery core
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Topology Errors
    // =========================================================================
    #[error("Topology conflict at expander {expander}: subtractive paths lead to {first} and {second}")]
    TopologyConflict {
        expander: String,
        first: String,
        second: String,
    },

    #[error("Expander {expander} reports {reported} phys (maximum {max})")]
    TooManyPhys {
        expander: String,
        reported: usize,
        max: usize,
    },

    #[error("Route table full on expander {expander} phy {phy} (capacity {capacity})")]
    RouteTableFull {
        expander: String,
        phy: u8,
        capacity: usize,
    },

    #[error("Upstream expander {upstream} of {expander} is not part of the device set")]
    UpstreamMissing { expander: String, upstream: String },

    #[error("Attached device on port {port} is not an expander")]
    NotAnExpander { port: String },

    // =========================================================================
    // Request Errors
    // =========================================================================
    #[error("{operation} to {target} failed: {outcome}")]
    RequestFailed {
        operation: String,
        target: String,
        outcome: String,
    },

    #[error("{operation} to {target} returned function result {result}")]
    FunctionFailed {
        operation: String,
        target: String,
        result: String,
    },

    #[error("Malformed {operation} response: {reason}")]
    MalformedResponse { operation: String, reason: String },

    #[error("Request submission failed: {0}")]
    SubmissionFailed(String),

    // =========================================================================
    // Session Errors
    // =========================================================================
    #[error("Discovery already in progress on port {port}")]
    SessionInProgress { port: String },

    #[error("Discovery on port {port} was aborted")]
    SessionAborted { port: String },

    #[error("State-machine stack exceeded maximum depth {depth}")]
    StackOverflow { depth: usize },

    #[error("State-machine stack is empty")]
    StackEmpty,

    #[error("Machine {machine} woke with unexpected input in phase {phase}")]
    UnexpectedWake { machine: String, phase: String },

    // =========================================================================
    // Registry Errors
    // =========================================================================
    #[error("Target not found: {handle}")]
    TargetNotFound { handle: String },

    #[error("Target registry exhausted ({capacity} targets)")]
    RegistryExhausted { capacity: usize },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Action to take when a discovery session fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Rediscover with exponential backoff
    RetryWithBackoff,
    /// Rediscover after specific duration
    RetryAfter(Duration),
    /// Don't rediscover until the next external trigger
    NoRetry,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Link-level trouble usually clears up after the fabric settles
            Error::RequestFailed { .. }
            | Error::FunctionFailed { .. }
            | Error::SubmissionFailed(_) => ErrorAction::RetryWithBackoff,

            // Someone else is already walking this port
            Error::SessionInProgress { .. } => ErrorAction::RetryAfter(Duration::from_secs(5)),

            // Topology may be mid-change (cable pulled during the walk)
            Error::TopologyConflict { .. } | Error::UpstreamMissing { .. } => {
                ErrorAction::RetryAfter(Duration::from_secs(10))
            }

            // Hardware limits and operator intent won't change by retrying
            Error::Configuration(_)
            | Error::TooManyPhys { .. }
            | Error::RouteTableFull { .. }
            | Error::StackOverflow { .. }
            | Error::RegistryExhausted { .. }
            | Error::SessionAborted { .. }
            | Error::NotAnExpander { .. } => ErrorAction::NoRetry,

            _ => ErrorAction::RetryWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRetry)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::RequestFailed { .. }
                | Error::FunctionFailed { .. }
                | Error::SubmissionFailed(_)
                | Error::SessionInProgress { .. }
        )
    }

    /// Check if this error describes an inconsistent or over-limit topology
    pub fn is_topology(&self) -> bool {
        matches!(
            self,
            Error::TopologyConflict { .. }
                | Error::TooManyPhys { .. }
                | Error::RouteTableFull { .. }
                | Error::UpstreamMissing { .. }
        )
    }
}

/// Result type alias for discovery
pub type Result<T> = std::result::Result<T, Error>;
