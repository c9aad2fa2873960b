//! The bridge context.
//!
//! One `Bridge` per module instance. It owns the handle table, the view
//! cache, the text codec, the finalization registry and the last-exception
//! slot, and borrows nothing from globals. Every boundary operation is a
//! method on it.

use alloc::boxed::Box;

use crate::externref::{ExternrefTable, Handle};
use crate::finalize::FinalizationRegistry;
use crate::host::{self, HostImports};
use crate::marshal::TextCodec;
use crate::memory::LinearMemory;
use crate::module::ModuleRuntime;
use crate::view::{ByteView, DataView, ViewCache, WordView};
use crate::{BridgeConfig, BridgeError, BridgeResult};

/// Host side of one module instance.
pub struct Bridge {
    config: BridgeConfig,
    pub(crate) runtime: Box<dyn ModuleRuntime>,
    pub(crate) views: ViewCache,
    pub(crate) codec: TextCodec,
    pub(crate) externs: ExternrefTable,
    pub(crate) imports: HostImports,
    pub(crate) finalizers: FinalizationRegistry,
    pub(crate) exception: Option<Handle>,
    started: bool,
}

impl Bridge {
    /// Wire a bridge to a module runtime.
    ///
    /// Populates the reserved handles, primes the decoder, clears any cached
    /// views and installs the bridge intrinsics.
    pub fn new<R: ModuleRuntime + 'static>(runtime: R, config: BridgeConfig) -> Self {
        let mut imports = HostImports::new();
        host::register_intrinsics(&mut imports);

        let mut views = ViewCache::new();
        views.reset();

        log::debug!(
            "bridge initialized: {} pages, checked handles: {}",
            runtime.memory().pages(),
            config.checked_handles
        );

        Bridge {
            runtime: Box::new(runtime),
            views,
            codec: TextCodec::new(config.decoder_byte_limit),
            externs: ExternrefTable::new(config.table_grow_chunk, config.checked_handles),
            imports,
            finalizers: FinalizationRegistry::new(config.finalizer_sweep_threshold),
            exception: None,
            started: false,
            config,
        }
    }

    /// Run the module entry point. Only the first call does anything.
    pub fn start(&mut self) -> BridgeResult<()> {
        if self.started {
            return Err(BridgeError::AlreadyStarted);
        }
        let entry = self
            .runtime
            .entry_point()
            .ok_or(BridgeError::MissingEntryPoint)?;
        self.started = true;
        log::debug!("starting module");
        entry(self)
    }

    /// Whether [`start`](Self::start) has run.
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Active configuration.
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// The module runtime.
    pub fn runtime(&self) -> &dyn ModuleRuntime {
        &*self.runtime
    }

    /// Mutable access to the module runtime.
    pub fn runtime_mut(&mut self) -> &mut dyn ModuleRuntime {
        &mut *self.runtime
    }

    /// The module's linear memory.
    pub fn memory(&self) -> &LinearMemory {
        self.runtime.memory()
    }

    /// Grow the module's memory. Cached views re-sync on next use.
    pub fn grow_memory(&mut self, delta_pages: u32) -> BridgeResult<u32> {
        self.runtime.memory_mut().grow(delta_pages)
    }

    /// Live byte view.
    pub fn bytes(&mut self) -> &ByteView {
        self.views.bytes(self.runtime.memory())
    }

    /// Live 32-bit word view.
    pub fn words(&mut self) -> &WordView {
        self.views.words(self.runtime.memory())
    }

    /// Live mixed-width view.
    pub fn data(&mut self) -> &DataView {
        self.views.data(self.runtime.memory())
    }

    /// View cache, for rebuild statistics.
    pub fn views(&self) -> &ViewCache {
        &self.views
    }

    /// The external reference table.
    pub fn externs(&self) -> &ExternrefTable {
        &self.externs
    }

    /// Mutable access to the external reference table.
    pub fn externs_mut(&mut self) -> &mut ExternrefTable {
        &mut self.externs
    }

    /// Registered host imports.
    pub fn imports(&self) -> &HostImports {
        &self.imports
    }

    /// Register additional host imports.
    pub fn imports_mut(&mut self) -> &mut HostImports {
        &mut self.imports
    }
}
