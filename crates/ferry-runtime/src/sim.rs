//! In-process simulated module.
//!
//! `SimGuest` stands in for a compiled module: a bump allocator over a
//! [`VecMemory`], exports implemented as Rust closures, and a record of every
//! allocator call, destructor run and stored exception. Growth is real (the
//! buffer is replaced), so view refresh is exercised exactly as with an
//! engine-backed module.

use std::collections::HashMap;
use std::rc::Rc;

use ferry_types::{AbiValue, BridgeConfig, BridgeError, BridgeResult, Handle};

use crate::bridge::Bridge;
use crate::closure::ClosureEnv;
use crate::exception::HostResult;
use crate::guest::Guest;
use crate::memory::{VecMemory, PAGE_SIZE};

/// Bytes below the heap reserved for the shadow stack.
const STACK_TOP: u32 = 1024;
const ALIGN: u32 = 8;

/// An export of the simulated module.
pub type SimExport = Rc<dyn Fn(&mut SimGuest, &[AbiValue]) -> HostResult<Vec<AbiValue>>>;

/// One call into the simulated allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocEvent {
    Malloc { ptr: u32, size: u32 },
    Realloc { ptr: u32, old_size: u32, new_size: u32, new_ptr: u32 },
    Free { ptr: u32, size: u32 },
}

pub struct SimGuest {
    memory: VecMemory,
    bridge: Bridge,
    heap_top: u32,
    stack_pointer: u32,
    realloc_enabled: bool,
    exports: HashMap<String, SimExport>,
    destroyed: Vec<(u32, ClosureEnv)>,
    exceptions: Vec<Handle>,
    allocations: Vec<AllocEvent>,
}

impl SimGuest {
    /// One page of memory, default configuration.
    pub fn new() -> Self {
        Self::with_config(BridgeConfig::default())
    }

    pub fn with_config(config: BridgeConfig) -> Self {
        let realloc_enabled = config.realloc_export.is_some();
        let stack_export = config.stack_pointer_export.clone();
        let mut guest = Self {
            memory: VecMemory::new(1),
            bridge: Bridge::with_config(config),
            heap_top: STACK_TOP,
            stack_pointer: STACK_TOP,
            realloc_enabled,
            exports: HashMap::new(),
            destroyed: Vec::new(),
            exceptions: Vec::new(),
            allocations: Vec::new(),
        };
        if let Some(name) = stack_export {
            guest.export(&name, |g, args| {
                let delta = args.first().and_then(|a| a.as_i32()).unwrap_or(0);
                g.stack_pointer = g.stack_pointer.wrapping_add_signed(delta);
                Ok(vec![AbiValue::from(g.stack_pointer)])
            });
        }
        guest
    }

    /// A module without a reallocator.
    pub fn without_realloc() -> Self {
        Self::with_config(BridgeConfig {
            realloc_export: None,
            ..BridgeConfig::default()
        })
    }

    /// Define an export.
    pub fn export(
        &mut self,
        name: &str,
        f: impl Fn(&mut SimGuest, &[AbiValue]) -> HostResult<Vec<AbiValue>> + 'static,
    ) -> &mut Self {
        self.exports.insert(name.to_owned(), Rc::new(f));
        self
    }

    pub fn memory(&self) -> &VecMemory {
        &self.memory
    }

    /// Grow memory as module code would.
    pub fn grow(&mut self, pages: u32) -> Option<u32> {
        self.memory.grow(pages)
    }

    pub fn bridge_ref(&self) -> &Bridge {
        &self.bridge
    }

    /// Destructor runs, in order.
    pub fn destroyed(&self) -> &[(u32, ClosureEnv)] {
        &self.destroyed
    }

    /// Handles passed to `exn_store`, in order.
    pub fn exceptions(&self) -> &[Handle] {
        &self.exceptions
    }

    pub fn allocations(&self) -> &[AllocEvent] {
        &self.allocations
    }

    pub fn stack_pointer(&self) -> u32 {
        self.stack_pointer
    }

    /// Write raw bytes, bypassing the bridge. Test setup only.
    pub fn poke(&mut self, ptr: u32, bytes: &[u8]) {
        let start = ptr as usize;
        self.memory.data_mut()[start..start + bytes.len()].copy_from_slice(bytes);
    }

    /// Read raw bytes, bypassing the bridge.
    pub fn peek(&self, ptr: u32, len: u32) -> &[u8] {
        &self.memory.data()[ptr as usize..(ptr + len) as usize]
    }

    fn bump(&mut self, size: u32) -> BridgeResult<u32> {
        let ptr = self.heap_top.next_multiple_of(ALIGN);
        let end = ptr.checked_add(size).ok_or_else(|| BridgeError::Allocation {
            size,
            reason: "address space exhausted".into(),
        })?;
        let have = self.memory.data().len() as u64;
        if u64::from(end) > have {
            let pages = (u64::from(end) - have).div_ceil(PAGE_SIZE as u64) as u32;
            self.memory.grow(pages).ok_or_else(|| BridgeError::Allocation {
                size,
                reason: format!("memory cannot grow by {pages} pages"),
            })?;
        }
        self.heap_top = end;
        Ok(ptr)
    }
}

impl Default for SimGuest {
    fn default() -> Self {
        Self::new()
    }
}

impl Guest for SimGuest {
    fn parts(&mut self) -> (&mut [u8], &mut Bridge) {
        (self.memory.data_mut(), &mut self.bridge)
    }

    fn malloc(&mut self, size: u32) -> BridgeResult<u32> {
        let ptr = self.bump(size)?;
        self.allocations.push(AllocEvent::Malloc { ptr, size });
        Ok(ptr)
    }

    fn realloc(&mut self, ptr: u32, old_size: u32, new_size: u32) -> BridgeResult<u32> {
        if !self.realloc_enabled {
            return Err(BridgeError::MissingExport("realloc".into()));
        }
        let new_ptr = self.bump(new_size)?;
        let keep = old_size.min(new_size) as usize;
        let data = self.memory.data_mut();
        data.copy_within(ptr as usize..ptr as usize + keep, new_ptr as usize);
        self.allocations.push(AllocEvent::Realloc {
            ptr,
            old_size,
            new_size,
            new_ptr,
        });
        Ok(new_ptr)
    }

    fn supports_realloc(&self) -> bool {
        self.realloc_enabled
    }

    fn free(&mut self, ptr: u32, size: u32) -> BridgeResult<()> {
        self.allocations.push(AllocEvent::Free { ptr, size });
        Ok(())
    }

    fn call_export(&mut self, name: &str, args: &[AbiValue]) -> HostResult<Vec<AbiValue>> {
        let export = self
            .exports
            .get(name)
            .cloned()
            .ok_or_else(|| BridgeError::MissingExport(name.to_owned()))?;
        export(self, args)
    }

    fn destroy_closure(&mut self, destructor: u32, env: ClosureEnv) -> BridgeResult<()> {
        self.destroyed.push((destructor, env));
        Ok(())
    }

    fn store_exception(&mut self, handle: Handle) -> BridgeResult<()> {
        self.exceptions.push(handle);
        Ok(())
    }
}
