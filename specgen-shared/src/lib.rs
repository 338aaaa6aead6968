//! specgen shared types
//!
//! This crate contains the error taxonomy and constants used by the
//! compiler library, its command-line front end and the test utilities.

pub mod constants;
pub mod errors;

pub use errors::{
    ErrorKind, MountError, NamespaceError, PortError, ResourceError, SecurityError, SpecgenError,
    SpecgenResult,
};
