//! Hierarchical error types for the specification compiler.
//!
//! Errors are grouped by the component that raises them:
//! - [`NamespaceError`]: namespace literal parsing and validation
//! - [`SecurityError`]: capabilities, seccomp, SELinux/AppArmor
//! - [`ResourceError`]: resource limit parsing and consistency
//! - [`PortError`]: port mapping validation and allocation
//! - [`MountError`]: volume/mount/tmpfs parsing and destination conflicts
//!
//! Every error maps onto one [`ErrorKind`], so callers can branch on the
//! category without matching individual variants.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;

/// Result alias used throughout the compiler.
pub type SpecgenResult<T> = Result<T, SpecgenError>;

// ============================================================================
// Error Kind
// ============================================================================

/// Coarse error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Mutually exclusive or missing required options.
    InvalidConfig,
    /// Malformed namespace, port, mount or device syntax.
    ParseError,
    /// Host lacks a cgroup or kernel capability.
    ResourceUnavailable,
    /// No free host port after the allowed attempts.
    AllocationFailure,
    /// Duplicate mount destination or overlapping port ranges.
    ConflictError,
    /// Referenced container or pod not found.
    LookupFailure,
    /// Unexpected failure inside the compiler or while talking to the host.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidConfig => "invalid configuration",
            ErrorKind::ParseError => "parse error",
            ErrorKind::ResourceUnavailable => "resource unavailable",
            ErrorKind::AllocationFailure => "allocation failure",
            ErrorKind::ConflictError => "conflict",
            ErrorKind::LookupFailure => "lookup failure",
            ErrorKind::Internal => "internal error",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Top-Level Error
// ============================================================================

/// Errors returned by the compiler.
///
/// ```ignore
/// match specgen::compile(&request, &ctx) {
///     Err(e) if e.kind() == ErrorKind::ConflictError => { /* report to user */ }
///     Err(e) => { /* abort */ }
///     Ok(compiled) => { /* hand spec to runtime */ }
/// }
/// ```
#[derive(Debug, Error)]
pub enum SpecgenError {
    #[error("namespace: {0}")]
    Namespace(#[from] NamespaceError),

    #[error("security: {0}")]
    Security(#[from] SecurityError),

    #[error("resources: {0}")]
    Resource(#[from] ResourceError),

    #[error("ports: {0}")]
    Port(#[from] PortError),

    #[error("mounts: {0}")]
    Mount(#[from] MountError),

    /// Mutually exclusive or missing required options.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Malformed input that belongs to no specific component.
    #[error("parse: {0}")]
    Parse(String),

    /// Neither the request nor the image supplied a command.
    #[error("no command or entrypoint provided, and no CMD or ENTRYPOINT from image")]
    NoCommand,

    /// A referenced container or pod could not be resolved.
    #[error("looking up {kind} {name:?}: {reason}")]
    LookupFailed {
        kind: &'static str,
        name: String,
        reason: String,
    },

    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal: {0}")]
    Internal(String),
}

impl SpecgenError {
    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SpecgenError::Namespace(e) => e.kind(),
            SpecgenError::Security(e) => e.kind(),
            SpecgenError::Resource(e) => e.kind(),
            SpecgenError::Port(e) => e.kind(),
            SpecgenError::Mount(e) => e.kind(),
            SpecgenError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            SpecgenError::Parse(_) | SpecgenError::Json(_) => ErrorKind::ParseError,
            SpecgenError::NoCommand => ErrorKind::InvalidConfig,
            SpecgenError::LookupFailed { .. } => ErrorKind::LookupFailure,
            SpecgenError::Io(_) | SpecgenError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Create a lookup failure for a container.
    pub fn container_not_found(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::LookupFailed {
            kind: "container",
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a lookup failure for a pod.
    pub fn pod_not_found(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::LookupFailed {
            kind: "pod",
            name: name.into(),
            reason: reason.into(),
        }
    }
}

// ============================================================================
// Namespace Errors
// ============================================================================

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NamespaceError {
    /// Literal not understood by the namespace family.
    #[error("unrecognized {family} namespace mode {value:?}")]
    Invalid { family: String, value: String },

    /// Path and container modes need a value.
    #[error("namespace mode {mode} requires a value")]
    MissingValue { mode: String },

    /// Every other mode rejects one.
    #[error("namespace value {value:?} cannot be provided with namespace mode {mode}")]
    UnexpectedValue { mode: String, value: String },

    /// Mode exists but does not apply to this namespace family.
    #[error("namespace mode {mode} is not valid for the {family} namespace")]
    NotAllowed { mode: String, family: String },

    /// Network option string (bridge, slirp4netns, pasta) is malformed.
    #[error("network option: {0}")]
    NetworkOption(String),
}

impl NamespaceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NamespaceError::Invalid { .. } | NamespaceError::NetworkOption(_) => {
                ErrorKind::ParseError
            }
            NamespaceError::MissingValue { .. }
            | NamespaceError::UnexpectedValue { .. }
            | NamespaceError::NotAllowed { .. } => ErrorKind::InvalidConfig,
        }
    }

    pub fn invalid(family: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Invalid {
            family: family.into(),
            value: value.into(),
        }
    }

    pub fn missing_value(mode: impl Into<String>) -> Self {
        Self::MissingValue { mode: mode.into() }
    }

    pub fn unexpected_value(mode: impl Into<String>, value: impl Into<String>) -> Self {
        Self::UnexpectedValue {
            mode: mode.into(),
            value: value.into(),
        }
    }

    pub fn not_allowed(mode: impl Into<String>, family: impl Into<String>) -> Self {
        Self::NotAllowed {
            mode: mode.into(),
            family: family.into(),
        }
    }
}

// ============================================================================
// Security Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum SecurityError {
    /// Capability name outside the known vocabulary.
    #[error("unknown capability {0:?}")]
    UnknownCapability(String),

    /// Seccomp policy `image` was requested but the image carries no profile label.
    #[error("seccomp policy \"image\" requested but image {image:?} has no {label:?} label")]
    NoSeccompPolicy { image: String, label: String },

    /// Seccomp profile could not be read or decoded.
    #[error("seccomp profile {source_name}: {reason}")]
    SeccompProfile { source_name: String, reason: String },

    /// Malformed `--security-opt label=` value.
    #[error("invalid label option {0:?}")]
    InvalidLabel(String),

    /// Mutually exclusive security inputs.
    #[error("{0}")]
    Conflict(String),
}

impl SecurityError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SecurityError::UnknownCapability(_)
            | SecurityError::SeccompProfile { .. }
            | SecurityError::InvalidLabel(_) => ErrorKind::ParseError,
            SecurityError::NoSeccompPolicy { .. } | SecurityError::Conflict(_) => {
                ErrorKind::InvalidConfig
            }
        }
    }

    pub fn seccomp_profile(source_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SeccompProfile {
            source_name: source_name.into(),
            reason: reason.into(),
        }
    }
}

// ============================================================================
// Resource Errors
// ============================================================================

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResourceError {
    /// Value could not be parsed.
    #[error("invalid {field} {value:?}: {reason}")]
    Parse {
        field: String,
        value: String,
        reason: String,
    },

    /// Value parsed but lies outside the accepted range.
    #[error("{0}")]
    InvalidValue(String),

    /// Two limits contradict each other (swap vs. memory, reservation vs. memory).
    #[error("{0}")]
    Inconsistent(String),

    /// Device referenced by a block I/O limit could not be resolved.
    #[error("device {path}: {reason}")]
    Device { path: String, reason: String },

    /// Host cgroup probe failed.
    #[error("cgroup probe: {0}")]
    Probe(String),
}

impl ResourceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ResourceError::Parse { .. } => ErrorKind::ParseError,
            ResourceError::InvalidValue(_) | ResourceError::Inconsistent(_) => {
                ErrorKind::InvalidConfig
            }
            ResourceError::Device { .. } => ErrorKind::LookupFailure,
            ResourceError::Probe(_) => ErrorKind::ResourceUnavailable,
        }
    }

    pub fn parse(
        field: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Parse {
            field: field.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_value(msg: impl Into<String>) -> Self {
        Self::InvalidValue(msg.into())
    }

    pub fn inconsistent(msg: impl Into<String>) -> Self {
        Self::Inconsistent(msg.into())
    }

    pub fn device(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Device {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

// ============================================================================
// Port Errors
// ============================================================================

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortError {
    /// Malformed or out-of-range port mapping.
    #[error("{0}")]
    Invalid(String),

    /// Overlapping host ranges whose container offsets disagree.
    #[error("conflicting port mappings for host port {host_port} (protocol {protocol})")]
    Conflict { host_port: u16, protocol: String },

    /// Random allocation gave up.
    #[error(
        "failed to find an open port to expose container port {container_port} with range {range} on the host"
    )]
    NoFreePort { container_port: u16, range: u32 },
}

impl PortError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PortError::Invalid(_) => ErrorKind::ParseError,
            PortError::Conflict { .. } => ErrorKind::ConflictError,
            PortError::NoFreePort { .. } => ErrorKind::AllocationFailure,
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}

// ============================================================================
// Mount Errors
// ============================================================================

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MountError {
    /// Two mounts claim the same destination with different source or options.
    #[error("duplicate mount destination {0:?}")]
    DuplicateDest(String),

    /// Mount spec has no destination.
    #[error("must set volume destination")]
    NoDestination,

    /// `type=` token outside the known set.
    #[error("invalid filesystem type {0:?}")]
    InvalidType(String),

    /// Malformed `--volume`, `--mount` or `--tmpfs` string.
    #[error("incorrect volume format {0:?}")]
    InvalidSyntax(String),

    /// Option invalid for its mount type, or repeated.
    #[error("{option:?}: {reason}")]
    InvalidOption { option: String, reason: String },
}

impl MountError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MountError::DuplicateDest(_) => ErrorKind::ConflictError,
            MountError::NoDestination
            | MountError::InvalidType(_)
            | MountError::InvalidSyntax(_)
            | MountError::InvalidOption { .. } => ErrorKind::ParseError,
        }
    }

    pub fn duplicate(dest: impl Into<String>) -> Self {
        Self::DuplicateDest(dest.into())
    }

    pub fn invalid_option(option: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidOption {
            option: option.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_hierarchy() {
        let err: SpecgenError = NamespaceError::missing_value("container").into();
        assert!(matches!(err, SpecgenError::Namespace(_)));
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);

        let err: SpecgenError = PortError::NoFreePort {
            container_port: 1,
            range: 65535,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::AllocationFailure);

        let err: SpecgenError = MountError::duplicate("/ctr").into();
        assert_eq!(err.kind(), ErrorKind::ConflictError);

        let err = SpecgenError::container_not_found("abc", "no such container");
        assert_eq!(err.kind(), ErrorKind::LookupFailure);
    }

    #[test]
    fn test_error_display() {
        let err = PortError::Conflict {
            host_port: 8081,
            protocol: "tcp".into(),
        };
        assert_eq!(
            err.to_string(),
            "conflicting port mappings for host port 8081 (protocol tcp)"
        );

        let err = PortError::NoFreePort {
            container_port: 1,
            range: 65535,
        };
        assert!(err.to_string().contains("container port 1 with range 65535"));

        let err: SpecgenError = NamespaceError::invalid("pid", "bogus").into();
        assert_eq!(
            err.to_string(),
            "namespace: unrecognized pid namespace mode \"bogus\""
        );

        assert_eq!(MountError::NoDestination.to_string(), "must set volume destination");
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(ErrorKind::ConflictError.to_string(), "conflict");
        assert_eq!(
            serde_json::to_string(&ErrorKind::AllocationFailure).unwrap(),
            "\"allocation_failure\""
        );
    }
}
