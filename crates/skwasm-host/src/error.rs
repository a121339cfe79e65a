//! Error taxonomy for the plugin host.
//!
//! Mirrors the classification a caller needs to react correctly: load-time
//! failures put a plugin in `error` state, guest faults drive the crash
//! pathway, and marshalling/timeout failures are scoped to a single request
//! and never change plugin state. See the propagation rules in the crate's
//! top-level documentation.

use thiserror::Error;

/// Taxonomy of failures the host can report.
///
/// `CapabilityDenied` never surfaces through this type across the guest FFI
/// boundary — FFI calls return the documented sentinel instead (see
/// `runtime::imports`). It exists here because host-internal callers (e.g.
/// the HTTP bridge checking a provider registration) still need to
/// distinguish "denied" from "not found".
#[derive(Debug, Error)]
pub enum HostError {
    /// Guest binary failed to compile, was missing a required export, or
    /// its ABI dialect could not be classified.
    #[error("failed to load plugin '{plugin_id}': {reason}")]
    LoadError { plugin_id: String, reason: String },

    /// A privileged operation was attempted without the required capability.
    #[error("plugin '{plugin_id}' lacks capability '{capability}'")]
    CapabilityDenied { plugin_id: String, capability: String },

    /// The guest's `start` export returned a non-zero status.
    #[error("plugin '{plugin_id}' start failed with code {code}")]
    StartFailed { plugin_id: String, code: i32 },

    /// An uncaught guest fault (trap) during execution.
    #[error("plugin '{plugin_id}' faulted: {trap}")]
    RuntimeFault { plugin_id: String, trap: String },

    /// A guest call did not return within the wall-clock watchdog window.
    #[error("plugin '{plugin_id}' timed out after {elapsed_secs}s")]
    Timeout { plugin_id: String, elapsed_secs: u64 },

    /// Malformed JSON crossing the host/guest boundary.
    #[error("marshal error for plugin '{plugin_id}': {reason}")]
    MarshalError { plugin_id: String, reason: String },

    /// A bounded resource was exhausted (UDP receive buffer, replay
    /// buffer, ...). Not fatal — always paired with a drop-oldest policy.
    #[error("resource exhausted for plugin '{plugin_id}': {resource}")]
    ResourceExhausted { plugin_id: String, resource: String },

    /// Persisted configuration failed validation before being written.
    #[error("config error for plugin '{plugin_id}': {reason}")]
    ConfigError { plugin_id: String, reason: String },

    /// I/O failure underneath the VFS or persisted config file.
    #[error("io error for plugin '{plugin_id}': {source}")]
    Io {
        plugin_id: String,
        #[source]
        source: std::io::Error,
    },
}

impl HostError {
    pub fn plugin_id(&self) -> &str {
        match self {
            HostError::LoadError { plugin_id, .. }
            | HostError::CapabilityDenied { plugin_id, .. }
            | HostError::StartFailed { plugin_id, .. }
            | HostError::RuntimeFault { plugin_id, .. }
            | HostError::Timeout { plugin_id, .. }
            | HostError::MarshalError { plugin_id, .. }
            | HostError::ResourceExhausted { plugin_id, .. }
            | HostError::ConfigError { plugin_id, .. }
            | HostError::Io { plugin_id, .. } => plugin_id,
        }
    }
}

pub type HostResult<T> = Result<T, HostError>;
