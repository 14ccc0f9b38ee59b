//! [`Guest`] over a `wasmi` store.
//!
//! The same type serves both directions: wrapped around a `Caller` inside an
//! import, and around `&mut Store` when the embedder calls into the module.

use ferry_runtime::closure::ClosureEnv;
use ferry_runtime::{Bridge, Guest, HostResult, Raised};
use ferry_types::{AbiValue, BridgeError, BridgeResult, Handle};
use wasmi::{AsContext, AsContextMut, Func, Val, WasmParams, WasmResults};

use crate::state::{GuestExports, HostState};

/// A running module seen through any `wasmi` context carrying [`HostState`].
pub struct WasmiGuest<C> {
    ctx: C,
    exports: GuestExports,
}

impl<C: AsContextMut<Data = HostState>> WasmiGuest<C> {
    /// Fails when the loader has not resolved the module's exports yet, for
    /// instance while the start function runs.
    pub fn new(ctx: C) -> BridgeResult<Self> {
        let exports = ctx
            .as_context()
            .data()
            .exports
            .ok_or_else(|| BridgeError::MissingExport("exports not resolved yet".into()))?;
        Ok(Self { ctx, exports })
    }

    pub fn state_mut(&mut self) -> &mut HostState {
        self.exports
            .memory
            .data_and_store_mut(self.ctx.as_context_mut())
            .1
    }

    pub fn exports(&self) -> &GuestExports {
        &self.exports
    }

    /// Park what an import raised so the outer call can report it.
    pub(crate) fn set_pending(&mut self, raised: Raised) {
        let state = self.state_mut();
        if let Some(previous) = state.pending.replace(raised) {
            tracing::warn!(?previous, "pending host exception overwritten");
        }
    }

    /// Translate a failed module call into what the host sees.
    fn trapped(&mut self, what: &str, err: wasmi::Error) -> Raised {
        match self.state_mut().pending.take() {
            Some(raised) => raised,
            None => {
                tracing::debug!(what, error = %err, "module call trapped");
                BridgeError::Guest(format!("{what}: {err}")).into()
            }
        }
    }

    fn call_typed<P, R>(&mut self, func: Func, what: &str, params: P) -> BridgeResult<R>
    where
        P: WasmParams,
        R: WasmResults,
    {
        let typed = func
            .typed::<P, R>(&self.ctx)
            .map_err(|e| BridgeError::MissingExport(format!("{what}: {e}")))?;
        match typed.call(&mut self.ctx, params) {
            Ok(out) => Ok(out),
            Err(err) => match self.trapped(what, err) {
                Raised::Violation(err) => Err(err),
                Raised::Thrown(value) => Err(BridgeError::Guest(format!("{what} raised {value}"))),
            },
        }
    }
}

impl<C: AsContextMut<Data = HostState>> Guest for WasmiGuest<C> {
    fn parts(&mut self) -> (&mut [u8], &mut Bridge) {
        let (memory, state) = self
            .exports
            .memory
            .data_and_store_mut(self.ctx.as_context_mut());
        (memory, &mut state.bridge)
    }

    fn malloc(&mut self, size: u32) -> BridgeResult<u32> {
        let malloc = self.exports.malloc;
        let ptr: i32 = self
            .call_typed(malloc, "malloc", size as i32)
            .map_err(|e| BridgeError::Allocation {
                size,
                reason: e.to_string(),
            })?;
        tracing::trace!(size, ptr, "malloc");
        Ok(ptr as u32)
    }

    fn realloc(&mut self, ptr: u32, old_size: u32, new_size: u32) -> BridgeResult<u32> {
        let realloc = self
            .exports
            .realloc
            .ok_or_else(|| BridgeError::MissingExport("realloc".into()))?;
        let moved: i32 = self
            .call_typed(realloc, "realloc", (ptr as i32, old_size as i32, new_size as i32))
            .map_err(|e| BridgeError::Allocation {
                size: new_size,
                reason: e.to_string(),
            })?;
        tracing::trace!(ptr, old_size, new_size, moved, "realloc");
        Ok(moved as u32)
    }

    fn supports_realloc(&self) -> bool {
        self.exports.realloc.is_some()
    }

    fn free(&mut self, ptr: u32, size: u32) -> BridgeResult<()> {
        let free = self.exports.free;
        self.call_typed(free, "free", (ptr as i32, size as i32))
    }

    fn call_export(&mut self, name: &str, args: &[AbiValue]) -> HostResult<Vec<AbiValue>> {
        let func = self
            .exports
            .instance
            .get_func(&self.ctx, name)
            .ok_or_else(|| BridgeError::MissingExport(name.to_owned()))?;
        let ty = func.ty(&self.ctx);
        let params: Vec<Val> = args.iter().map(|&arg| to_val(arg)).collect();
        let mut results: Vec<Val> = ty.results().iter().map(|&t| Val::default(t)).collect();
        if let Err(err) = func.call(&mut self.ctx, &params, &mut results) {
            return Err(self.trapped(name, err));
        }
        results
            .iter()
            .map(|val| from_val(name, val).map_err(Raised::from))
            .collect()
    }

    fn destroy_closure(&mut self, destructor: u32, env: ClosureEnv) -> BridgeResult<()> {
        let table = self
            .exports
            .destructors
            .ok_or_else(|| BridgeError::MissingExport("destructor table".into()))?;
        let entry = table.get(&self.ctx, destructor.into());
        let Some(Val::FuncRef(func_ref)) = entry else {
            return Err(BridgeError::MissingExport(format!("destructor {destructor}")));
        };
        let Some(&func) = func_ref.func() else {
            return Err(BridgeError::MissingExport(format!("destructor {destructor} is null")));
        };
        self.call_typed(func, "closure destructor", (env.ptr as i32, env.aux as i32))
    }

    fn store_exception(&mut self, handle: Handle) -> BridgeResult<()> {
        let exn_store = self
            .exports
            .exn_store
            .ok_or_else(|| BridgeError::MissingExport("exn_store".into()))?;
        self.call_typed(exn_store, "exn_store", handle.to_abi())
    }
}

fn to_val(value: AbiValue) -> Val {
    match value {
        AbiValue::I32(v) => Val::I32(v),
        AbiValue::F64(v) => Val::F64(v.into()),
    }
}

fn from_val(what: &str, val: &Val) -> BridgeResult<AbiValue> {
    match val {
        Val::I32(v) => Ok(AbiValue::I32(*v)),
        Val::F64(v) => Ok(AbiValue::F64(v.to_float())),
        other => Err(BridgeError::Guest(format!(
            "{what} returned unsupported {:?}",
            other.ty()
        ))),
    }
}
