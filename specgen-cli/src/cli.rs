use crate::commands::{compile::CompileArgs, parse_namespace::ParseNamespaceArgs, parse_port::ParsePortArgs};
use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use specgen::host::{self, HostIntrospector, StaticHost};
use specgen::EngineConfig;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "specgen", version, about = "Compile container creation requests into OCI runtime configurations")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalFlags,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Compile a creation request into an OCI runtime configuration
    Compile(CompileArgs),
    /// Parse a namespace flag and print the result
    ParseNamespace(ParseNamespaceArgs),
    /// Parse a port publish flag and print the mapping
    ParsePort(ParsePortArgs),
}

#[derive(Args, Debug)]
pub struct GlobalFlags {
    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Engine configuration file (.json, .yaml or .yml)
    #[arg(long, global = true, env = "SPECGEN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Describe the host with a profile file instead of probing this machine
    #[arg(long, global = true, env = "SPECGEN_HOST")]
    pub host: Option<PathBuf>,
}

/// Host answering compile-time questions.
pub enum HostSource {
    Profile(StaticHost),
    Current,
}

impl HostSource {
    pub fn get(&self) -> &dyn HostIntrospector {
        match self {
            HostSource::Profile(profile) => profile,
            HostSource::Current => host::current(),
        }
    }
}

impl GlobalFlags {
    pub fn load_host(&self) -> anyhow::Result<HostSource> {
        match &self.host {
            Some(path) => {
                let profile = StaticHost::load(path)
                    .with_context(|| format!("Failed to load host profile {}", path.display()))?;
                Ok(HostSource::Profile(profile))
            }
            None => Ok(HostSource::Current),
        }
    }

    pub fn load_engine(&self, host: &dyn HostIntrospector) -> anyhow::Result<EngineConfig> {
        let config = match &self.config {
            Some(path) => EngineConfig::load(path)
                .with_context(|| format!("Failed to load engine config {}", path.display()))?,
            None => EngineConfig::load_default(host.is_rootless())?,
        };
        tracing::debug!(rootless = config.rootless, host = host.name(), "Loaded engine configuration");
        Ok(config)
    }
}
