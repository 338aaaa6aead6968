//! Everything a compilation reads besides the request and the image.

use crate::config::EngineConfig;
use crate::host::{self, HostIntrospector};
use crate::lookup::{ContainerLookup, NoLookup};
use crate::ports::PortPicker;

/// Collaborators for one compilation.
///
/// Borrowed, never owned: the same host, lookup and picker can serve any
/// number of concurrent compilations.
#[derive(Clone, Copy)]
pub struct CompileContext<'a> {
    pub engine: &'a EngineConfig,
    pub host: &'a dyn HostIntrospector,
    pub lookup: &'a dyn ContainerLookup,
    pub picker: &'a dyn PortPicker,
}

static NO_LOOKUP: NoLookup = NoLookup;

impl<'a> CompileContext<'a> {
    /// The running host, no other containers, and the engine's port picker.
    pub fn new(engine: &'a EngineConfig) -> Self {
        Self {
            engine,
            host: host::current(),
            lookup: &NO_LOOKUP,
            picker: engine.port_allocation.picker(),
        }
    }

    pub fn with_host(mut self, host: &'a dyn HostIntrospector) -> Self {
        self.host = host;
        self
    }

    pub fn with_lookup(mut self, lookup: &'a dyn ContainerLookup) -> Self {
        self.lookup = lookup;
        self
    }

    pub fn with_picker(mut self, picker: &'a dyn PortPicker) -> Self {
        self.picker = picker;
        self
    }
}

impl std::fmt::Debug for CompileContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompileContext")
            .field("host", &self.host.name())
            .field("rootless", &self.engine.rootless)
            .finish_non_exhaustive()
    }
}
