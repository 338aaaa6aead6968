//! specgen: compiles container creation requests into OCI runtime
//! specifications.
//!
//! A [`SpecGenerator`] describes what the user asked for. [`compile`] checks
//! it, resolves every namespace, security setting, resource limit, port and
//! mount against the engine configuration, the image and the host, and
//! returns the OCI runtime configuration plus the engine [`CreateOption`]s.
//!
//! ```no_run
//! use specgen::{CompileContext, EngineConfig, ImageMetadata, SpecGenerator, compile};
//!
//! let engine = EngineConfig::rootful();
//! let ctx = CompileContext::new(&engine);
//! let mut request = SpecGenerator::new("docker.io/library/alpine:latest");
//! request.basic.command = vec!["/bin/sh".into()];
//! let compiled = compile(&request, &ImageMetadata::default(), &ctx)?;
//! println!("{}", serde_json::to_string_pretty(&compiled.spec)?);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod context;
pub mod generate;
pub mod host;
pub mod image;
pub mod lookup;
pub mod mounts;
pub mod namespace;
pub mod ports;
pub mod request;
pub mod resources;
pub mod security;

pub use config::{EngineConfig, EngineConfigBuilder};
pub use context::CompileContext;
pub use generate::{Compiled, CreateOption, compile};
pub use host::{CgroupFeatures, CgroupVersion, HostIntrospector, StaticHost};
pub use image::ImageMetadata;
pub use lookup::{ContainerInfo, ContainerLookup, NoLookup, PodInfo};
pub use namespace::{Namespace, NamespaceFamily, NamespaceMode};
pub use ports::{PortMapping, PortPicker};
pub use request::SpecGenerator;

pub use specgen_shared::{ErrorKind, SpecgenError, SpecgenResult};
