//! Image metadata consumed as fallback input.
//!
//! Nothing here overrides an explicit request value; the generator only reads
//! these fields when the request leaves the corresponding field unset.

use serde::{Deserialize, Serialize};
use specgen_shared::{SpecgenError, SpecgenResult};
use std::collections::{BTreeMap, BTreeSet};

/// Runtime configuration carried by an OCI image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageMetadata {
    /// Image reference, for error messages.
    pub name: String,
    pub id: String,

    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub working_dir: String,
    /// `KEY=VALUE` entries.
    pub env: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,

    /// Exposed ports (e.g., `["8080/tcp", "53/udp"]`).
    pub exposed_ports: Vec<String>,
    pub stop_signal: Option<String>,
    pub user: String,
    /// `VOLUME` declarations.
    pub volumes: Vec<String>,
}

impl ImageMetadata {
    /// Parse port number and protocol from an exposed port string
    ///
    /// # Examples
    /// - "8080/tcp" -> Some((8080, "tcp"))
    /// - "53/udp" -> Some((53, "udp"))
    /// - "8080" -> Some((8080, "tcp"))
    pub fn parse_exposed_port(port_spec: &str) -> Option<(u16, &str)> {
        let mut parts = port_spec.split('/');
        let port: u16 = parts.next()?.parse().ok()?;
        let protocol = parts.next().unwrap_or("tcp");
        Some((port, protocol))
    }

    /// Exposed ports grouped by port number.
    pub fn exposed(&self) -> SpecgenResult<BTreeMap<u16, BTreeSet<String>>> {
        let mut out: BTreeMap<u16, BTreeSet<String>> = BTreeMap::new();
        for spec in &self.exposed_ports {
            let (port, protocol) = Self::parse_exposed_port(spec).ok_or_else(|| {
                SpecgenError::parse(format!(
                    "image {} exposes invalid port {:?}",
                    self.name, spec
                ))
            })?;
            out.entry(port).or_default().insert(protocol.to_ascii_lowercase());
        }
        Ok(out)
    }

    /// Value of `key` in the image environment.
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|entry| {
            entry
                .split_once('=')
                .filter(|(k, _)| *k == key)
                .map(|(_, v)| v)
        })
    }

    /// Convert an OCI image configuration.
    pub fn from_oci_config(
        name: &str,
        image_config: &oci_spec::image::ImageConfiguration,
    ) -> SpecgenResult<Self> {
        let config = image_config.config().as_ref().ok_or_else(|| {
            SpecgenError::parse(format!("image {}: config object missing", name))
        })?;

        Ok(Self {
            name: name.to_string(),
            id: String::new(),
            entrypoint: config.entrypoint().clone().unwrap_or_default(),
            cmd: config.cmd().clone().unwrap_or_default(),
            working_dir: config.working_dir().clone().unwrap_or_default(),
            env: config.env().clone().unwrap_or_default(),
            labels: config
                .labels()
                .clone()
                .unwrap_or_default()
                .into_iter()
                .collect(),
            annotations: BTreeMap::new(),
            exposed_ports: config.exposed_ports().clone().unwrap_or_default(),
            stop_signal: config.stop_signal().clone(),
            user: config.user().clone().unwrap_or_default(),
            volumes: config.volumes().clone().unwrap_or_default(),
        })
    }
}
