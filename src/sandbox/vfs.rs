//! In-memory file system the sandboxed library sees instead of a disk.
//!
//! Every byte source is a host-owned [`FileContext`] registered under an
//! absolute name. Descriptors are handed out by [`VirtualFileSystem::open`] in
//! increasing order starting at 3; 1 and 2 are pre-opened log sinks that
//! forward the guest's stdout/stderr to the logger.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use log::{debug, info, warn};
use thiserror::Error;

use crate::bridge::BlockingReader;

pub type Fd = i32;

/// `dirfd` value meaning "relative to the current directory" (always `/`)
pub const AT_FDCWD: Fd = -100;

pub const SEEK_SET: i32 = 0;
pub const SEEK_CUR: i32 = 1;
pub const SEEK_END: i32 = 2;

pub const O_CREAT: i32 = 0o100;
pub const O_DIRECTORY: i32 = 0o200000;

pub const DT_DIR: u8 = 4;
pub const DT_REG: u8 = 8;

/// Size of one `getdents64` record
pub const DIRENT_SIZE: usize = 280;
const DIRENT_NAME_OFFSET: usize = 19;
const DIRENT_NAME_MAX: usize = 255;

/// Largest size a writable [`MemoryFile`] grows to by default
pub const DEFAULT_MEMORY_FILE_LIMIT: u64 = 2 * 1024 * 1024 * 1024;

/// errno values of the emscripten/WASI ABI
pub mod errno {
    pub const SUCCESS: i32 = 0;
    pub const EBADF: i32 = 8;
    pub const EFAULT: i32 = 21;
    pub const EFBIG: i32 = 22;
    pub const EIO: i32 = 29;
    pub const EINVAL: i32 = 28;
    pub const EISDIR: i32 = 31;
    pub const ENOENT: i32 = 44;
    pub const ENOTDIR: i32 = 54;
    pub const ENOTSUP: i32 = 58;
    pub const EOVERFLOW: i32 = 61;
}

#[derive(Debug, Error)]
pub enum VfsError {
    #[error("no such file: {0}")]
    NotFound(String),
    #[error("bad file descriptor {0}")]
    BadDescriptor(Fd),
    #[error("seek to negative offset")]
    InvalidSeek,
    #[error("descriptor {0} is not a directory")]
    NotADirectory(Fd),
    #[error("descriptor {0} is a directory")]
    IsADirectory(Fd),
    #[error("{0} bytes cannot hold a directory record")]
    BufferTooSmall(usize),
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl VfsError {
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            VfsError::NotFound(_) => errno::ENOENT,
            VfsError::BadDescriptor(_) => errno::EBADF,
            VfsError::InvalidSeek => errno::EINVAL,
            VfsError::NotADirectory(_) => errno::ENOTDIR,
            VfsError::IsADirectory(_) => errno::EISDIR,
            VfsError::BufferTooSmall(_) => errno::EINVAL,
            VfsError::Unsupported(_) => errno::ENOTSUP,
            VfsError::Io(e) if e.kind() == io::ErrorKind::Unsupported => errno::ENOTSUP,
            VfsError::Io(e) if e.kind() == io::ErrorKind::FileTooLarge => errno::EFBIG,
            VfsError::Io(_) => errno::EIO,
        }
    }
}

pub type Result<T> = std::result::Result<T, VfsError>;

/// Host-owned addressable byte source
pub trait FileContext: Send + Sync {
    fn size(&self) -> u64;

    /// Read up to `buf.len()` bytes at `position`; a short count means end of data.
    fn read(&self, position: u64, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&self, _position: u64, _data: &[u8]) -> io::Result<usize> {
        Err(io::ErrorKind::Unsupported.into())
    }

    fn sync(&self) -> io::Result<()> {
        Ok(())
    }

    fn close(&self) {}
}

/// Whole file held in memory
#[derive(Debug, Default)]
pub struct MemoryFile {
    data: RwLock<Vec<u8>>,
    writable: bool,
    limit: u64,
}

impl MemoryFile {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
            writable: false,
            limit: DEFAULT_MEMORY_FILE_LIMIT,
        }
    }

    pub fn writable(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
            writable: true,
            limit: DEFAULT_MEMORY_FILE_LIMIT,
        }
    }

    /// Refuse writes that would grow the file past `limit` bytes.
    #[must_use]
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl FileContext for MemoryFile {
    fn size(&self) -> u64 {
        self.data.read().unwrap_or_else(PoisonError::into_inner).len() as u64
    }

    fn read(&self, position: u64, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        let Ok(start) = usize::try_from(position) else {
            return Ok(0);
        };
        if start >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn write(&self, position: u64, bytes: &[u8]) -> io::Result<usize> {
        if !self.writable {
            return Err(io::ErrorKind::Unsupported.into());
        }
        let end = position.saturating_add(bytes.len() as u64);
        if end > self.limit {
            return Err(io::ErrorKind::FileTooLarge.into());
        }
        let start = usize::try_from(position).map_err(|_| io::ErrorKind::InvalidInput)?;
        let end = start + bytes.len();
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(bytes);
        Ok(bytes.len())
    }
}

/// A host file read positionally
#[derive(Debug)]
pub struct HostFile {
    file: Mutex<File>,
    size: u64,
}

impl HostFile {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::open(path.as_ref())?;
        let size = file.metadata()?.len();
        debug!("opened host file {:?} ({size} bytes)", path.as_ref());
        Ok(Self {
            file: Mutex::new(file),
            size,
        })
    }
}

impl FileContext for HostFile {
    fn size(&self) -> u64 {
        self.size
    }

    fn read(&self, position: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.seek(SeekFrom::Start(position))?;
        let mut total = 0;
        while total < buf.len() {
            match file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }
}

/// Host asynchronous read function behind the blocking bridge
pub struct BridgedFile {
    size: u64,
    reader: BlockingReader,
}

impl BridgedFile {
    pub fn new(size: u64, reader: BlockingReader) -> Self {
        Self { size, reader }
    }
}

impl FileContext for BridgedFile {
    fn size(&self) -> u64 {
        self.size
    }

    fn read(&self, position: u64, buf: &mut [u8]) -> io::Result<usize> {
        if position >= self.size || buf.is_empty() {
            return Ok(0);
        }
        let remaining = usize::try_from(self.size - position).unwrap_or(usize::MAX);
        let len = buf.len().min(remaining);
        // Host sources may deliver less than asked; keep asking until end of data.
        let mut total = 0;
        while total < len {
            let n = self
                .reader
                .read_at(position + total as u64, &mut buf[total..len]);
            if n < 0 && total == 0 {
                return Err(io::Error::other(format!("host read failed with {n}")));
            }
            if n <= 0 {
                break;
            }
            total += usize::try_from(n).unwrap_or(0).min(len - total);
        }
        Ok(total)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Write-only sink forwarding complete lines to the logger
#[derive(Debug)]
pub struct LogSink {
    stream: Stream,
    pending: Mutex<Vec<u8>>,
}

impl LogSink {
    pub fn new(stream: Stream) -> Self {
        Self {
            stream,
            pending: Mutex::new(Vec::new()),
        }
    }

    fn emit(&self, line: &[u8]) {
        let text = String::from_utf8_lossy(line);
        let text = text.trim_end_matches('\r');
        match self.stream {
            Stream::Stdout => info!("[sandbox] {text}"),
            Stream::Stderr => warn!("[sandbox] {text}"),
        }
    }
}

impl FileContext for LogSink {
    fn size(&self) -> u64 {
        0
    }

    fn read(&self, _position: u64, _buf: &mut [u8]) -> io::Result<usize> {
        Ok(0)
    }

    fn write(&self, _position: u64, data: &[u8]) -> io::Result<usize> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.extend_from_slice(data);
        while let Some(end) = pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = pending.drain(..=end).collect();
            self.emit(&line[..line.len() - 1]);
        }
        Ok(data.len())
    }

    fn close(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if !pending.is_empty() {
            let line = std::mem::take(&mut *pending);
            self.emit(&line);
        }
    }
}

struct FileDescriptor {
    name: String,
    context: Arc<dyn FileContext>,
    flags: i32,
    mode: u32,
    dirfd: Fd,
    position: u64,
}

struct DirectoryDescriptor {
    path: String,
    entries: Vec<String>,
    cursor: u64,
}

enum Descriptor {
    File(FileDescriptor),
    Directory(DirectoryDescriptor),
}

/// Snapshot of an open file descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorInfo {
    pub fd: Fd,
    pub name: String,
    pub flags: i32,
    pub mode: u32,
    pub dirfd: Fd,
    pub position: u64,
    pub is_directory: bool,
}

/// Per-session name and descriptor tables
pub struct VirtualFileSystem {
    files: HashMap<String, Arc<dyn FileContext>>,
    directories: HashMap<String, Vec<String>>,
    descriptors: BTreeMap<Fd, Descriptor>,
    next_fd: Fd,
}

impl Default for VirtualFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualFileSystem {
    pub fn new() -> Self {
        let mut descriptors = BTreeMap::new();
        for (fd, stream, name) in [(1, Stream::Stdout, "<stdout>"), (2, Stream::Stderr, "<stderr>")] {
            descriptors.insert(
                fd,
                Descriptor::File(FileDescriptor {
                    name: name.to_string(),
                    context: Arc::new(LogSink::new(stream)),
                    flags: 1,
                    mode: 0,
                    dirfd: AT_FDCWD,
                    position: 0,
                }),
            );
        }
        Self {
            files: HashMap::new(),
            directories: HashMap::new(),
            descriptors,
            next_fd: 3,
        }
    }

    pub fn register_file(&mut self, name: &str, context: Arc<dyn FileContext>) {
        let name = normalize_path(name);
        debug!("vfs: registered {name} ({} bytes)", context.size());
        self.files.insert(name, context);
    }

    /// Remove a name. Descriptors already open on it keep working until closed.
    pub fn unregister_file(&mut self, name: &str) -> bool {
        let name = normalize_path(name);
        let removed = self.files.remove(&name).is_some();
        if removed {
            debug!("vfs: unregistered {name}");
        }
        removed
    }

    /// Register a directory listing; a trailing `/` marks a subdirectory entry.
    pub fn register_directory(&mut self, name: &str, entries: Vec<String>) {
        self.directories.insert(normalize_path(name), entries);
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.files.contains_key(&normalize_path(name))
    }

    pub fn open(&mut self, dirfd: Fd, name: &str, flags: i32, mode: u32) -> Result<Fd> {
        let path = self.resolve(dirfd, name)?;

        let descriptor = if let Some(entries) = self.directories.get(&path) {
            Descriptor::Directory(DirectoryDescriptor {
                path: path.clone(),
                entries: entries.clone(),
                cursor: 0,
            })
        } else if let Some(context) = self.files.get(&path) {
            if flags & O_DIRECTORY != 0 {
                return Err(VfsError::NotFound(path));
            }
            Descriptor::File(FileDescriptor {
                name: path.clone(),
                context: Arc::clone(context),
                flags,
                mode,
                dirfd,
                position: 0,
            })
        } else {
            return Err(VfsError::NotFound(path));
        };

        let fd = self.next_fd;
        self.next_fd += 1;
        self.descriptors.insert(fd, descriptor);
        debug!("vfs: open {path} -> fd {fd}");
        Ok(fd)
    }

    pub fn close(&mut self, fd: Fd) -> Result<()> {
        match self.descriptors.remove(&fd) {
            Some(Descriptor::File(file)) => {
                file.context.close();
                debug!("vfs: closed fd {fd} ({})", file.name);
                Ok(())
            }
            Some(Descriptor::Directory(_)) => Ok(()),
            None => Err(VfsError::BadDescriptor(fd)),
        }
    }

    pub fn seek(&mut self, fd: Fd, offset: i64, whence: i32) -> Result<u64> {
        let (position, end) = match self.descriptors.get_mut(&fd) {
            Some(Descriptor::File(file)) => (&mut file.position, file.context.size()),
            Some(Descriptor::Directory(dir)) => (
                &mut dir.cursor,
                (dir.entries.len() * DIRENT_SIZE) as u64,
            ),
            None => return Err(VfsError::BadDescriptor(fd)),
        };

        let base = match whence {
            SEEK_SET => 0,
            SEEK_CUR => i128::from(*position),
            SEEK_END => i128::from(end),
            _ => return Err(VfsError::InvalidSeek),
        };
        let target = base + i128::from(offset);
        let target = u64::try_from(target).map_err(|_| VfsError::InvalidSeek)?;
        *position = target;
        Ok(target)
    }

    /// Fill `bufs` in order, stopping at the first short read.
    pub fn read_vectored(&mut self, fd: Fd, bufs: &mut [&mut [u8]]) -> Result<usize> {
        let file = self.file_mut(fd)?;
        let mut total = 0;
        for buf in bufs.iter_mut() {
            let n = match file.context.read(file.position, buf) {
                Ok(n) => n.min(buf.len()),
                Err(e) if total == 0 => return Err(e.into()),
                Err(e) => {
                    warn!("vfs: read on fd {fd} failed after {total} bytes: {e}");
                    break;
                }
            };
            file.position += n as u64;
            total += n;
            if n < buf.len() {
                break;
            }
        }
        Ok(total)
    }

    /// Write `bufs` in order, stopping at the first short write.
    pub fn write_vectored(&mut self, fd: Fd, bufs: &[&[u8]]) -> Result<usize> {
        let file = self.file_mut(fd)?;
        let mut total = 0;
        for buf in bufs {
            let n = match file.context.write(file.position, buf) {
                Ok(n) => n.min(buf.len()),
                Err(e) if total == 0 => return Err(e.into()),
                Err(e) => {
                    warn!("vfs: write on fd {fd} failed after {total} bytes: {e}");
                    break;
                }
            };
            file.position += n as u64;
            total += n;
            if n < buf.len() {
                break;
            }
        }
        Ok(total)
    }

    pub fn sync(&self, fd: Fd) -> Result<()> {
        match self.descriptors.get(&fd) {
            Some(Descriptor::File(file)) => Ok(file.context.sync()?),
            Some(Descriptor::Directory(_)) => Ok(()),
            None => Err(VfsError::BadDescriptor(fd)),
        }
    }

    /// Size of a named file (0 for directories)
    pub fn stat(&self, dirfd: Fd, name: &str) -> Result<u64> {
        let path = self.resolve(dirfd, name)?;
        if let Some(context) = self.files.get(&path) {
            Ok(context.size())
        } else if self.directories.contains_key(&path) {
            Ok(0)
        } else {
            Err(VfsError::NotFound(path))
        }
    }

    pub fn fstat(&self, fd: Fd) -> Result<u64> {
        match self.descriptors.get(&fd) {
            Some(Descriptor::File(file)) => Ok(file.context.size()),
            Some(Descriptor::Directory(_)) => Ok(0),
            None => Err(VfsError::BadDescriptor(fd)),
        }
    }

    /// Encode as many directory records as fit in `capacity` bytes and advance the cursor.
    pub fn getdents(&mut self, fd: Fd, capacity: usize) -> Result<Vec<u8>> {
        let dir = match self.descriptors.get_mut(&fd) {
            Some(Descriptor::Directory(dir)) => dir,
            Some(Descriptor::File(_)) => return Err(VfsError::NotADirectory(fd)),
            None => return Err(VfsError::BadDescriptor(fd)),
        };

        let mut index = usize::try_from(dir.cursor).unwrap_or(usize::MAX) / DIRENT_SIZE;
        let mut out = Vec::new();
        while index < dir.entries.len() && out.len() + DIRENT_SIZE <= capacity {
            out.extend_from_slice(&encode_dirent(index, &dir.entries[index]));
            index += 1;
        }
        if out.is_empty() && index < dir.entries.len() {
            return Err(VfsError::BufferTooSmall(capacity));
        }
        dir.cursor = (index * DIRENT_SIZE) as u64;
        debug!(
            "vfs: getdents {} -> {} records",
            dir.path,
            out.len() / DIRENT_SIZE
        );
        Ok(out)
    }

    #[must_use]
    pub fn open_descriptors(&self) -> Vec<DescriptorInfo> {
        self.descriptors
            .iter()
            .map(|(&fd, descriptor)| match descriptor {
                Descriptor::File(file) => DescriptorInfo {
                    fd,
                    name: file.name.clone(),
                    flags: file.flags,
                    mode: file.mode,
                    dirfd: file.dirfd,
                    position: file.position,
                    is_directory: false,
                },
                Descriptor::Directory(dir) => DescriptorInfo {
                    fd,
                    name: dir.path.clone(),
                    flags: O_DIRECTORY,
                    mode: 0,
                    dirfd: AT_FDCWD,
                    position: dir.cursor,
                    is_directory: true,
                },
            })
            .collect()
    }

    fn file_mut(&mut self, fd: Fd) -> Result<&mut FileDescriptor> {
        match self.descriptors.get_mut(&fd) {
            Some(Descriptor::File(file)) => Ok(file),
            Some(Descriptor::Directory(_)) => Err(VfsError::IsADirectory(fd)),
            None => Err(VfsError::BadDescriptor(fd)),
        }
    }

    fn resolve(&self, dirfd: Fd, name: &str) -> Result<String> {
        if name.starts_with('/') || dirfd == AT_FDCWD {
            return Ok(normalize_path(name));
        }
        match self.descriptors.get(&dirfd) {
            Some(Descriptor::Directory(dir)) => Ok(normalize_path(&format!("{}/{name}", dir.path))),
            Some(Descriptor::File(_)) => Err(VfsError::NotADirectory(dirfd)),
            None => Err(VfsError::BadDescriptor(dirfd)),
        }
    }
}

impl std::fmt::Debug for VirtualFileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.files.keys().collect();
        names.sort();
        f.debug_struct("VirtualFileSystem")
            .field("files", &names)
            .field("descriptors", &self.descriptors.keys().collect::<Vec<_>>())
            .field("next_fd", &self.next_fd)
            .finish()
    }
}

/// Absolute path with `.`/`..` and duplicate separators removed
pub fn normalize_path(name: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in name.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

fn encode_dirent(index: usize, entry: &str) -> [u8; DIRENT_SIZE] {
    let (name, kind) = match entry.strip_suffix('/') {
        Some(dir) => (dir, DT_DIR),
        None => (entry, DT_REG),
    };
    let name = name.as_bytes();
    let name = &name[..name.len().min(DIRENT_NAME_MAX)];

    let mut record = [0u8; DIRENT_SIZE];
    record[0..8].copy_from_slice(&(index as u64 + 1).to_le_bytes());
    record[8..16].copy_from_slice(&(((index + 1) * DIRENT_SIZE) as i64).to_le_bytes());
    record[16..18].copy_from_slice(&(DIRENT_SIZE as u16).to_le_bytes());
    record[18] = kind;
    record[DIRENT_NAME_OFFSET..DIRENT_NAME_OFFSET + name.len()].copy_from_slice(name);
    record
}
