//! WebAssembly sandbox hosting the PDF library with no real disk access

pub mod memory;
pub mod pdfium;
pub mod runtime;
pub mod syscalls;
pub mod vfs;

use thiserror::Error;

pub use memory::GrowthPolicy;
pub use pdfium::{SandboxConfig, SandboxEngine};
pub use runtime::{SandboxEnv, SandboxRuntime};
pub use vfs::{BridgedFile, FileContext, HostFile, MemoryFile, VirtualFileSystem};

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to compile module: {0}")]
    Compile(#[from] wasmer::CompileError),
    #[error("failed to instantiate module: {0}")]
    Instantiation(#[from] wasmer::InstantiationError),
    #[error("memory error: {0}")]
    Memory(#[from] wasmer::MemoryError),
    #[error("guest memory access: {0}")]
    MemoryAccess(#[from] wasmer::MemoryAccessError),
    #[error("module neither imports nor exports a memory")]
    MissingMemory,
    #[error("module has no export named {0}")]
    MissingExport(String),
    #[error("import {0} cannot be provided")]
    UnsupportedImport(String),
    #[error("sandbox called unsupported function {0}")]
    SyscallUnsupported(String),
    #[error("guest allocation of {0} bytes failed")]
    OutOfMemory(usize),
    #[error("unexpected return value from {0}")]
    BadReturn(String),
    #[error("trap: {0}")]
    Runtime(#[from] wasmer::RuntimeError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
