//! Host implementations of the emscripten/WASI imports the PDFium build needs.
//!
//! Every file syscall is served from the session's [`VirtualFileSystem`]; any
//! import not listed here is bound to a stub that traps when called.

use log::{debug, error, trace, warn};
use wasmer::{
    Extern, ExternType, Function, FunctionEnv, FunctionEnvMut, FunctionType, Imports, Memory,
    MemoryAccessError, MemoryView, Module, Pages, RuntimeError, Store, Table, Value,
};

use super::SandboxError;
use super::runtime::SandboxEnv;
use super::vfs::{AT_FDCWD, O_CREAT, errno};

/// Size of the emscripten `struct stat` written by the stat family
pub const STAT_SIZE: usize = 96;
/// Offset of `st_size` inside [`STAT_SIZE`] bytes
pub const STAT_SIZE_OFFSET: usize = 24;

const IOVEC_SIZE: u64 = 8;
const MAX_PATH: usize = 4096;

/// Build the import object for `module`, creating any imported memory or table.
pub(crate) fn build_imports(
    store: &mut Store,
    env: &FunctionEnv<SandboxEnv>,
    module: &Module,
) -> Result<Imports, SandboxError> {
    let mut imports = Imports::new();

    for import in module.imports() {
        let (namespace, name) = (import.module(), import.name());
        let label = format!("{namespace}.{name}");
        let external: Extern = match import.ty() {
            ExternType::Function(ty) => host_function(store, env, namespace, name, ty).into(),
            ExternType::Memory(ty) => {
                let memory = Memory::new(store, ty.clone())?;
                env.as_mut(store).memory = Some(memory.clone());
                debug!("created imported memory {label}");
                memory.into()
            }
            ExternType::Table(ty) => Table::new(store, ty.clone(), Value::FuncRef(None))?.into(),
            _ => return Err(SandboxError::UnsupportedImport(label)),
        };
        imports.define(namespace, name, external);
    }

    Ok(imports)
}

fn host_function(
    store: &mut Store,
    env: &FunctionEnv<SandboxEnv>,
    namespace: &str,
    name: &str,
    ty: &FunctionType,
) -> Function {
    let candidate = match (namespace, name) {
        ("env", "__syscall_openat") => Some(Function::new_typed_with_env(store, env, syscall_openat)),
        ("env", "__syscall_fstat64") => {
            Some(Function::new_typed_with_env(store, env, syscall_fstat64))
        }
        ("env", "__syscall_stat64" | "__syscall_lstat64") => {
            Some(Function::new_typed_with_env(store, env, syscall_stat64))
        }
        ("env", "__syscall_getdents64") => {
            Some(Function::new_typed_with_env(store, env, syscall_getdents64))
        }
        ("env", "emscripten_resize_heap") => {
            Some(Function::new_typed_with_env(store, env, emscripten_resize_heap))
        }
        ("wasi_snapshot_preview1", "fd_read") => {
            Some(Function::new_typed_with_env(store, env, fd_read))
        }
        ("wasi_snapshot_preview1", "fd_write") => {
            Some(Function::new_typed_with_env(store, env, fd_write))
        }
        ("wasi_snapshot_preview1", "fd_seek") if ty.params().len() == 4 => {
            Some(Function::new_typed_with_env(store, env, fd_seek_i64))
        }
        ("wasi_snapshot_preview1", "fd_seek") => {
            Some(Function::new_typed_with_env(store, env, fd_seek))
        }
        ("wasi_snapshot_preview1", "fd_close") => {
            Some(Function::new_typed_with_env(store, env, fd_close))
        }
        ("wasi_snapshot_preview1", "fd_sync") => {
            Some(Function::new_typed_with_env(store, env, fd_sync))
        }
        _ => None,
    };

    let label = format!("{namespace}.{name}");
    match candidate {
        Some(function) if function.ty(&*store) == *ty => function,
        Some(function) => {
            warn!(
                "import {label} declared as {ty:?} but host provides {:?}; binding trap",
                function.ty(&*store)
            );
            unsupported(store, ty, label)
        }
        None => unsupported(store, ty, label),
    }
}

/// Stub that fails loudly instead of returning made-up data.
fn unsupported(store: &mut Store, ty: &FunctionType, label: String) -> Function {
    trace!("binding trap stub for {label}");
    Function::new(store, ty.clone(), move |_args: &[Value]| {
        error!("sandbox called unsupported import {label}");
        Err(RuntimeError::user(Box::new(SandboxError::SyscallUnsupported(
            label.clone(),
        ))))
    })
}

fn guest_fault(e: MemoryAccessError) -> RuntimeError {
    RuntimeError::user(Box::new(SandboxError::MemoryAccess(e)))
}

fn memory_of(env: &SandboxEnv) -> Result<Memory, RuntimeError> {
    env.memory
        .clone()
        .ok_or_else(|| RuntimeError::user(Box::new(SandboxError::MissingMemory)))
}

fn offset(ptr: i32) -> u64 {
    u64::from(ptr as u32)
}

fn read_u32(view: &MemoryView, ptr: u64) -> Result<u32, MemoryAccessError> {
    let mut bytes = [0u8; 4];
    view.read(ptr, &mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

pub(crate) fn read_c_string(view: &MemoryView, ptr: u64) -> Result<String, MemoryAccessError> {
    let mut bytes = Vec::new();
    let mut cursor = ptr;
    while bytes.len() < MAX_PATH {
        let byte = view.read_u8(cursor)?;
        if byte == 0 {
            break;
        }
        bytes.push(byte);
        cursor += 1;
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// `(pointer, length)` pairs of an iovec array, or `None` if the array or any
/// buffer lies outside memory.
///
/// The combined length is bounded by the memory size so a single transfer
/// never stages more host memory than the guest has.
fn read_iovecs(
    view: &MemoryView,
    iovs: i32,
    iovcnt: i32,
) -> Result<Option<Vec<(u64, usize)>>, MemoryAccessError> {
    let count = u64::from(iovcnt.max(0) as u32);
    let limit = view.data_size();
    if offset(iovs) + count * IOVEC_SIZE > limit {
        return Ok(None);
    }
    let mut out = Vec::with_capacity(count as usize);
    let mut total = 0u64;
    for i in 0..count {
        let base = offset(iovs) + i * IOVEC_SIZE;
        let ptr = u64::from(read_u32(view, base)?);
        let len = u64::from(read_u32(view, base + 4)?);
        total += len;
        if ptr + len > limit || total > limit {
            return Ok(None);
        }
        out.push((ptr, len as usize));
    }
    Ok(Some(out))
}

fn write_stat(view: &MemoryView, buf: i32, size: u64) -> Result<(), MemoryAccessError> {
    let mut stat = [0u8; STAT_SIZE];
    let size = i64::try_from(size).unwrap_or(i64::MAX);
    stat[STAT_SIZE_OFFSET..STAT_SIZE_OFFSET + 8].copy_from_slice(&size.to_le_bytes());
    view.write(offset(buf), &stat)
}

fn syscall_openat(
    mut ctx: FunctionEnvMut<SandboxEnv>,
    dirfd: i32,
    path: i32,
    flags: i32,
    varargs: i32,
) -> Result<i32, RuntimeError> {
    let (env, store) = ctx.data_and_store_mut();
    let memory = memory_of(env)?;
    let view = memory.view(&store);
    let name = read_c_string(&view, offset(path)).map_err(guest_fault)?;
    let mode = if flags & O_CREAT != 0 && varargs != 0 {
        read_u32(&view, offset(varargs)).map_err(guest_fault)?
    } else {
        0
    };

    match env.vfs.open(dirfd, &name, flags, mode) {
        Ok(fd) => Ok(fd),
        Err(e) => {
            debug!("openat({dirfd}, {name:?}) failed: {e}");
            Ok(-1)
        }
    }
}

fn fd_read(
    mut ctx: FunctionEnvMut<SandboxEnv>,
    fd: i32,
    iovs: i32,
    iovcnt: i32,
    nread: i32,
) -> Result<i32, RuntimeError> {
    let (env, store) = ctx.data_and_store_mut();
    let memory = memory_of(env)?;
    let view = memory.view(&store);
    let Some(iovecs) = read_iovecs(&view, iovs, iovcnt).map_err(guest_fault)? else {
        return Ok(errno::EFAULT);
    };

    let mut buffers: Vec<Vec<u8>> = iovecs.iter().map(|&(_, len)| vec![0; len]).collect();
    let result = {
        let mut slices: Vec<&mut [u8]> = buffers.iter_mut().map(Vec::as_mut_slice).collect();
        env.vfs.read_vectored(fd, &mut slices)
    };
    let total = match result {
        Ok(total) => total,
        Err(e) => {
            debug!("fd_read({fd}) failed: {e}");
            return Ok(e.errno());
        }
    };

    let mut remaining = total;
    for ((ptr, _), buffer) in iovecs.iter().zip(&buffers) {
        if remaining == 0 {
            break;
        }
        let n = remaining.min(buffer.len());
        view.write(*ptr, &buffer[..n]).map_err(guest_fault)?;
        remaining -= n;
    }
    view.write(offset(nread), &(total as u32).to_le_bytes())
        .map_err(guest_fault)?;
    Ok(errno::SUCCESS)
}

fn fd_write(
    mut ctx: FunctionEnvMut<SandboxEnv>,
    fd: i32,
    iovs: i32,
    iovcnt: i32,
    nwritten: i32,
) -> Result<i32, RuntimeError> {
    let (env, store) = ctx.data_and_store_mut();
    let memory = memory_of(env)?;
    let view = memory.view(&store);
    let Some(iovecs) = read_iovecs(&view, iovs, iovcnt).map_err(guest_fault)? else {
        return Ok(errno::EFAULT);
    };

    let mut buffers = Vec::with_capacity(iovecs.len());
    for &(ptr, len) in &iovecs {
        let mut buffer = vec![0; len];
        view.read(ptr, &mut buffer).map_err(guest_fault)?;
        buffers.push(buffer);
    }
    let slices: Vec<&[u8]> = buffers.iter().map(Vec::as_slice).collect();
    match env.vfs.write_vectored(fd, &slices) {
        Ok(total) => {
            view.write(offset(nwritten), &(total as u32).to_le_bytes())
                .map_err(guest_fault)?;
            Ok(errno::SUCCESS)
        }
        Err(e) => {
            debug!("fd_write({fd}) failed: {e}");
            Ok(e.errno())
        }
    }
}

/// Offset from a legalized `(low, high)` pair: high must be 0, or -1 for a negative low half.
pub(crate) fn join_offset(low: i32, high: i32) -> Option<i64> {
    match high {
        0 => Some(i64::from(low as u32)),
        -1 if low < 0 => Some(i64::from(low)),
        _ => None,
    }
}

fn seek_and_report(
    ctx: &mut FunctionEnvMut<SandboxEnv>,
    fd: i32,
    offset_value: i64,
    whence: i32,
    new_offset: i32,
) -> Result<i32, RuntimeError> {
    let (env, store) = ctx.data_and_store_mut();
    let position = match env.vfs.seek(fd, offset_value, whence) {
        Ok(position) => position,
        Err(e) => {
            debug!("fd_seek({fd}, {offset_value}, {whence}) failed: {e}");
            return Ok(e.errno());
        }
    };
    let memory = memory_of(env)?;
    let view = memory.view(&store);
    view.write(offset(new_offset), &position.to_le_bytes())
        .map_err(guest_fault)?;
    Ok(errno::SUCCESS)
}

fn fd_seek(
    mut ctx: FunctionEnvMut<SandboxEnv>,
    fd: i32,
    offset_low: i32,
    offset_high: i32,
    whence: i32,
    new_offset: i32,
) -> Result<i32, RuntimeError> {
    let Some(offset_value) = join_offset(offset_low, offset_high) else {
        debug!("fd_seek({fd}) offset {offset_high}:{offset_low} out of range");
        return Ok(errno::EOVERFLOW);
    };
    seek_and_report(&mut ctx, fd, offset_value, whence, new_offset)
}

fn fd_seek_i64(
    mut ctx: FunctionEnvMut<SandboxEnv>,
    fd: i32,
    offset_value: i64,
    whence: i32,
    new_offset: i32,
) -> Result<i32, RuntimeError> {
    seek_and_report(&mut ctx, fd, offset_value, whence, new_offset)
}

fn fd_close(mut ctx: FunctionEnvMut<SandboxEnv>, fd: i32) -> Result<i32, RuntimeError> {
    let env = ctx.data_mut();
    Ok(match env.vfs.close(fd) {
        Ok(()) => errno::SUCCESS,
        Err(e) => e.errno(),
    })
}

fn fd_sync(ctx: FunctionEnvMut<SandboxEnv>, fd: i32) -> Result<i32, RuntimeError> {
    Ok(match ctx.data().vfs.sync(fd) {
        Ok(()) => errno::SUCCESS,
        Err(e) => e.errno(),
    })
}

fn syscall_fstat64(
    mut ctx: FunctionEnvMut<SandboxEnv>,
    fd: i32,
    buf: i32,
) -> Result<i32, RuntimeError> {
    let (env, store) = ctx.data_and_store_mut();
    let size = match env.vfs.fstat(fd) {
        Ok(size) => size,
        Err(e) => return Ok(-e.errno()),
    };
    let memory = memory_of(env)?;
    write_stat(&memory.view(&store), buf, size).map_err(guest_fault)?;
    Ok(0)
}

fn syscall_stat64(
    mut ctx: FunctionEnvMut<SandboxEnv>,
    path: i32,
    buf: i32,
) -> Result<i32, RuntimeError> {
    let (env, store) = ctx.data_and_store_mut();
    let memory = memory_of(env)?;
    let view = memory.view(&store);
    let name = read_c_string(&view, offset(path)).map_err(guest_fault)?;
    match env.vfs.stat(AT_FDCWD, &name) {
        Ok(size) => {
            write_stat(&view, buf, size).map_err(guest_fault)?;
            Ok(0)
        }
        Err(e) => {
            debug!("stat({name:?}) failed: {e}");
            Ok(-e.errno())
        }
    }
}

fn syscall_getdents64(
    mut ctx: FunctionEnvMut<SandboxEnv>,
    fd: i32,
    dirp: i32,
    count: i32,
) -> Result<i32, RuntimeError> {
    let (env, store) = ctx.data_and_store_mut();
    let capacity = usize::try_from(count).unwrap_or(0);
    let records = match env.vfs.getdents(fd, capacity) {
        Ok(records) => records,
        Err(e) => return Ok(-e.errno()),
    };
    let memory = memory_of(env)?;
    memory
        .view(&store)
        .write(offset(dirp), &records)
        .map_err(guest_fault)?;
    Ok(records.len() as i32)
}

fn emscripten_resize_heap(
    mut ctx: FunctionEnvMut<SandboxEnv>,
    requested: i32,
) -> Result<i32, RuntimeError> {
    let (env, mut store) = ctx.data_and_store_mut();
    let memory = memory_of(env)?;
    let requested = offset(requested);
    let current = memory.view(&store).data_size();

    let Some(pages) = env.growth.pages_to_add(current, requested) else {
        warn!(
            "heap growth to {requested} bytes refused (ceiling {} bytes)",
            env.growth.ceiling
        );
        return Ok(0);
    };
    if pages == 0 {
        return Ok(1);
    }

    match memory.grow(&mut store, Pages(pages)) {
        Ok(previous) => {
            debug!(
                "heap grown from {} to {} pages for a {requested} byte request",
                previous.0,
                previous.0 + pages
            );
            Ok(1)
        }
        Err(e) => {
            error!("heap growth by {pages} pages failed: {e}");
            Ok(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_pairs() {
        assert_eq!(join_offset(100, 0), Some(100));
        assert_eq!(join_offset(-1, 0), Some(u32::MAX as i64));
        assert_eq!(join_offset(-5, -1), Some(-5));
        assert_eq!(join_offset(5, -1), None);
        assert_eq!(join_offset(0, 1), None);
    }
}
