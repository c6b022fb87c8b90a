//! Compiles and hosts the wasm build of the PDF library

use std::collections::HashMap;
use std::path::Path;

use log::{debug, info};
use wasmer::{Function, FunctionEnv, Instance, Memory, Module, RuntimeError, Store, Value};

use super::SandboxError;
use super::memory::GrowthPolicy;
use super::syscalls;
use super::vfs::VirtualFileSystem;

const INITIALIZERS: [&str; 2] = ["_initialize", "__wasm_call_ctors"];
const MALLOC: [&str; 2] = ["malloc", "_malloc"];
const FREE: [&str; 2] = ["free", "_free"];

/// State reachable from every host import
pub struct SandboxEnv {
    pub vfs: VirtualFileSystem,
    pub memory: Option<Memory>,
    pub growth: GrowthPolicy,
}

impl SandboxEnv {
    pub fn new(growth: GrowthPolicy) -> Self {
        Self {
            vfs: VirtualFileSystem::new(),
            memory: None,
            growth,
        }
    }
}

/// One instantiated module plus its store.
///
/// Not `Sync`: the store is owned by the single worker thread that drives it.
pub struct SandboxRuntime {
    store: Store,
    instance: Instance,
    env: FunctionEnv<SandboxEnv>,
    memory: Memory,
    functions: HashMap<String, Function>,
}

impl SandboxRuntime {
    pub fn from_file(path: impl AsRef<Path>, growth: GrowthPolicy) -> Result<Self, SandboxError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        info!("loading sandbox module {path:?} ({} bytes)", bytes.len());
        Self::new(&bytes, growth)
    }

    /// Compile and instantiate `wasm` (binary or text format) and run its constructors.
    pub fn new(wasm: &[u8], growth: GrowthPolicy) -> Result<Self, SandboxError> {
        let mut store = Store::default();
        let module = Module::new(&store, wasm)?;
        let env = FunctionEnv::new(&mut store, SandboxEnv::new(growth));
        let imports = syscalls::build_imports(&mut store, &env, &module)?;
        let instance = Instance::new(&mut store, &module, &imports)?;

        if let Ok(exported) = instance.exports.get_memory("memory") {
            env.as_mut(&mut store).memory = Some(exported.clone());
        }
        let memory = env
            .as_ref(&store)
            .memory
            .clone()
            .ok_or(SandboxError::MissingMemory)?;

        let mut runtime = Self {
            store,
            instance,
            env,
            memory,
            functions: HashMap::new(),
        };

        if let Some(init) = INITIALIZERS.iter().find(|name| runtime.has_export(name)) {
            debug!("running {init}");
            runtime.call(init, &[])?;
        }
        info!(
            "sandbox ready, {} bytes of linear memory",
            runtime.memory_size()
        );
        Ok(runtime)
    }

    pub fn vfs(&self) -> &VirtualFileSystem {
        &self.env.as_ref(&self.store).vfs
    }

    pub fn vfs_mut(&mut self) -> &mut VirtualFileSystem {
        &mut self.env.as_mut(&mut self.store).vfs
    }

    #[must_use]
    pub fn has_export(&self, name: &str) -> bool {
        self.functions.contains_key(name) || self.instance.exports.get_function(name).is_ok()
    }

    fn function(&mut self, name: &str) -> Result<Function, SandboxError> {
        if let Some(function) = self.functions.get(name) {
            return Ok(function.clone());
        }
        let function = self
            .instance
            .exports
            .get_function(name)
            .map_err(|_| SandboxError::MissingExport(name.to_string()))?
            .clone();
        self.functions.insert(name.to_string(), function.clone());
        Ok(function)
    }

    fn first_export(&mut self, names: &[&str]) -> Result<Function, SandboxError> {
        for name in names {
            if self.has_export(name) {
                return self.function(name);
            }
        }
        Err(SandboxError::MissingExport(names.join("|")))
    }

    /// Call an exported function by name.
    pub fn call(&mut self, name: &str, args: &[Value]) -> Result<Box<[Value]>, SandboxError> {
        let function = self.function(name)?;
        function.call(&mut self.store, args).map_err(unwrap_trap)
    }

    /// Call an export returning a single `i32` (pointers, handles, counts, booleans).
    pub fn call_i32(&mut self, name: &str, args: &[Value]) -> Result<i32, SandboxError> {
        let results = self.call(name, args)?;
        match results.first() {
            Some(Value::I32(value)) => Ok(*value),
            _ => Err(SandboxError::BadReturn(name.to_string())),
        }
    }

    /// Call an export returning a single `f64`.
    pub fn call_f64(&mut self, name: &str, args: &[Value]) -> Result<f64, SandboxError> {
        let results = self.call(name, args)?;
        match results.first() {
            Some(Value::F64(value)) => Ok(*value),
            Some(Value::F32(value)) => Ok(f64::from(*value)),
            _ => Err(SandboxError::BadReturn(name.to_string())),
        }
    }

    /// Call an export with no meaningful return value.
    pub fn call_void(&mut self, name: &str, args: &[Value]) -> Result<(), SandboxError> {
        self.call(name, args).map(|_| ())
    }

    /// Allocate `size` bytes on the guest heap.
    pub fn alloc(&mut self, size: usize) -> Result<u32, SandboxError> {
        let malloc = self.first_export(&MALLOC)?;
        let request = i32::try_from(size.max(1)).map_err(|_| SandboxError::OutOfMemory(size))?;
        let results = malloc
            .call(&mut self.store, &[Value::I32(request)])
            .map_err(unwrap_trap)?;
        match results.first() {
            Some(Value::I32(0)) => Err(SandboxError::OutOfMemory(size)),
            Some(Value::I32(ptr)) => Ok(*ptr as u32),
            _ => Err(SandboxError::BadReturn("malloc".to_string())),
        }
    }

    pub fn free(&mut self, ptr: u32) -> Result<(), SandboxError> {
        if ptr == 0 {
            return Ok(());
        }
        let free = self.first_export(&FREE)?;
        free.call(&mut self.store, &[Value::I32(ptr as i32)])
            .map_err(unwrap_trap)?;
        Ok(())
    }

    /// Copy `data` into a fresh guest allocation.
    pub fn alloc_bytes(&mut self, data: &[u8]) -> Result<u32, SandboxError> {
        let ptr = self.alloc(data.len())?;
        if let Err(e) = self.write_bytes(ptr, data) {
            self.free(ptr)?;
            return Err(e);
        }
        Ok(ptr)
    }

    /// NUL-terminated copy of `text` on the guest heap.
    pub fn alloc_c_string(&mut self, text: &str) -> Result<u32, SandboxError> {
        let mut bytes = Vec::with_capacity(text.len() + 1);
        bytes.extend_from_slice(text.as_bytes());
        bytes.push(0);
        self.alloc_bytes(&bytes)
    }

    pub fn write_bytes(&self, ptr: u32, data: &[u8]) -> Result<(), SandboxError> {
        self.memory
            .view(&self.store)
            .write(u64::from(ptr), data)?;
        Ok(())
    }

    pub fn read_bytes(&self, ptr: u32, len: usize) -> Result<Vec<u8>, SandboxError> {
        let mut out = vec![0u8; len];
        self.memory.view(&self.store).read(u64::from(ptr), &mut out)?;
        Ok(out)
    }

    pub fn read_c_string(&self, ptr: u32) -> Result<String, SandboxError> {
        let view = self.memory.view(&self.store);
        Ok(syscalls::read_c_string(&view, u64::from(ptr))?)
    }

    pub fn read_u32(&self, ptr: u32) -> Result<u32, SandboxError> {
        let mut bytes = [0u8; 4];
        self.memory.view(&self.store).read(u64::from(ptr), &mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn read_i32(&self, ptr: u32) -> Result<i32, SandboxError> {
        self.read_u32(ptr).map(|v| v as i32)
    }

    pub fn read_f32(&self, ptr: u32) -> Result<f32, SandboxError> {
        self.read_u32(ptr).map(f32::from_bits)
    }

    pub fn read_f64(&self, ptr: u32) -> Result<f64, SandboxError> {
        let mut bytes = [0u8; 8];
        self.memory.view(&self.store).read(u64::from(ptr), &mut bytes)?;
        Ok(f64::from_le_bytes(bytes))
    }

    /// Current linear memory size in bytes
    #[must_use]
    pub fn memory_size(&self) -> u64 {
        self.memory.view(&self.store).data_size()
    }
}

impl std::fmt::Debug for SandboxRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxRuntime")
            .field("memory_size", &self.memory_size())
            .field("vfs", self.vfs())
            .finish_non_exhaustive()
    }
}

/// Surface a host-side error raised inside an import instead of the generic trap.
fn unwrap_trap(e: RuntimeError) -> SandboxError {
    match e.downcast::<SandboxError>() {
        Ok(inner) => inner,
        Err(e) => SandboxError::Runtime(e),
    }
}
