//! Module loading and the resulting instance.
//!
//! Loading checks the module's bridge imports against the [`ImportTable`]
//! before anything is instantiated, so a missing registration is reported by
//! name instead of as an engine link error.

use ferry_runtime::closure::Release;
use ferry_runtime::{codec, intrinsics, Bridge, Guest, HostResult, HostValue, MarshalledStr};
use ferry_types::{AbiValue, BridgeConfig, BridgeError, BridgeResult, Handle};
use sha2::{Digest, Sha256};
use wasmi::{Engine, Linker, Module, Store};
use wasmparser::{Parser, Payload};

use crate::error::load_error;
use crate::guest::WasmiGuest;
use crate::imports::ImportTable;
use crate::state::{GuestExports, HostState};

/// Compiles and instantiates modules against one configuration.
pub struct ModuleLoader {
    engine: Engine,
    config: BridgeConfig,
}

impl ModuleLoader {
    pub fn new(config: BridgeConfig) -> BridgeResult<Self> {
        config.validate()?;
        Ok(Self {
            engine: Engine::default(),
            config,
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Load `wasm`, link it against `imports` and run its start function.
    ///
    /// The start function runs before the bridge exports are resolved and
    /// must not call into the bridge.
    pub fn load(&self, wasm: &[u8], imports: &ImportTable) -> BridgeResult<Instance> {
        let namespace = self.config.import_namespace.as_str();
        let unresolved = unresolved_imports(wasm, namespace, imports)?;
        if !unresolved.is_empty() {
            tracing::warn!(count = unresolved.len(), "module has unresolved bridge imports");
            return Err(BridgeError::UnresolvedImports(unresolved));
        }

        let digest = sha256_hex(wasm);
        let module = Module::new(&self.engine, wasm).map_err(load_error)?;
        let mut store = Store::new(&self.engine, HostState::new(self.config.clone()));
        let mut linker = <Linker<HostState>>::new(&self.engine);
        imports.link(&mut linker, namespace)?;

        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(load_error)?
            .start(&mut store)
            .map_err(load_error)?;
        let exports = resolve_exports(&store, instance, &self.config)?;
        store.data_mut().exports = Some(exports);

        tracing::debug!(%digest, bytes = wasm.len(), "module loaded");
        Ok(Instance { store, digest })
    }
}

/// A loaded module and its bridge state.
pub struct Instance {
    store: Store<HostState>,
    digest: String,
}

impl Instance {
    /// Hex SHA-256 of the module binary.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn bridge(&self) -> &Bridge {
        &self.store.data().bridge
    }

    pub fn bridge_mut(&mut self) -> &mut Bridge {
        &mut self.store.data_mut().bridge
    }

    pub fn store(&self) -> &Store<HostState> {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut Store<HostState> {
        &mut self.store
    }

    /// The instance as a [`ferry_runtime::Guest`].
    pub fn guest(&mut self) -> BridgeResult<WasmiGuest<&mut Store<HostState>>> {
        WasmiGuest::new(&mut self.store)
    }

    /// Current size of linear memory in bytes.
    pub fn memory_size(&self) -> usize {
        self.store
            .data()
            .exports
            .map_or(0, |exports| exports.memory.data(&self.store).len())
    }

    pub fn call_export(&mut self, name: &str, args: &[AbiValue]) -> HostResult<Vec<AbiValue>> {
        self.guest()?.call_export(name, args)
    }

    /// Encode `text` into module memory. The module owns the allocation.
    pub fn pass_string(&mut self, text: &str) -> BridgeResult<MarshalledStr> {
        codec::encode(&mut self.guest()?, text)
    }

    pub fn read_string(&mut self, ptr: u32, len: u32) -> BridgeResult<String> {
        codec::decode_owned(&mut self.guest()?, ptr, len)
    }

    /// Park a host value and return a handle the module will own.
    pub fn add_value(&mut self, value: HostValue) -> Handle {
        self.bridge_mut().add(value)
    }

    pub fn take_value(&mut self, handle: Handle) -> BridgeResult<HostValue> {
        self.bridge_mut().take(handle)
    }

    /// Keep the function at `handle` as a host-side listener.
    pub fn register_callback(&mut self, handle: Handle) -> BridgeResult<Handle> {
        intrinsics::register_callback(&mut self.guest()?, handle)
    }

    /// Deliver a host event to a registered listener.
    pub fn fire_callback(&mut self, handle: Handle, args: &[HostValue]) -> HostResult<HostValue> {
        intrinsics::call_function(&mut self.guest()?, handle, args)
    }

    pub fn release_callback(&mut self, handle: Handle) -> BridgeResult<Release> {
        intrinsics::unregister_callback(&mut self.guest()?, handle)
    }

    /// Drop every dynamic handle. Returns how many were live.
    pub fn teardown(&mut self) -> usize {
        let state = self.store.data_mut();
        if let Some(raised) = state.pending.take() {
            tracing::warn!(?raised, "discarding pending host exception");
        }
        state.bridge.teardown()
    }
}

/// `namespace.name` of every bridge import the table does not provide,
/// sorted and deduplicated.
pub fn unresolved_imports(
    wasm: &[u8],
    namespace: &str,
    imports: &ImportTable,
) -> BridgeResult<Vec<String>> {
    let mut missing = Vec::new();
    for payload in Parser::new(0).parse_all(wasm) {
        if let Payload::ImportSection(reader) = payload.map_err(load_error)? {
            for import in reader {
                let import = import.map_err(load_error)?;
                if import.module == namespace && !imports.contains(import.name) {
                    missing.push(format!("{}.{}", import.module, import.name));
                }
            }
        }
    }
    missing.sort();
    missing.dedup();
    Ok(missing)
}

fn sha256_hex(wasm: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(wasm);
    format!("{:x}", hasher.finalize())
}

fn resolve_exports(
    store: &Store<HostState>,
    instance: wasmi::Instance,
    config: &BridgeConfig,
) -> BridgeResult<GuestExports> {
    let required_func = |name: &str| {
        instance
            .get_func(store, name)
            .ok_or_else(|| BridgeError::MissingExport(name.to_owned()))
    };
    let optional_func = |name: &Option<String>| {
        let name = name.as_deref()?;
        let func = instance.get_func(store, name);
        if func.is_none() {
            tracing::debug!(name, "optional export absent");
        }
        func
    };

    let memory = instance
        .get_memory(store, &config.memory_export)
        .ok_or_else(|| BridgeError::MissingExport(config.memory_export.clone()))?;
    let destructors = instance.get_table(store, &config.destructor_table);
    if destructors.is_none() {
        tracing::debug!(name = %config.destructor_table, "no destructor table exported");
    }

    Ok(GuestExports {
        instance,
        memory,
        malloc: required_func(&config.malloc_export)?,
        realloc: optional_func(&config.realloc_export),
        free: required_func(&config.free_export)?,
        exn_store: optional_func(&config.exn_store_export),
        destructors,
    })
}
