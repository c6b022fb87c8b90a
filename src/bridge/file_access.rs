//! PDFium `FPDF_FILEACCESS` block backed by a [`BlockingReader`]

use std::ffi::{c_int, c_uchar, c_ulong, c_void};

use log::{debug, error};

use super::slot::{BlockingReader, PendingRead, ReadBlock};

/// Signature PDFium uses for `FPDF_FILEACCESS::m_GetBlock`
pub type GetBlockFn = unsafe extern "system" fn(
    param: *mut c_void,
    position: c_ulong,
    buf: *mut c_uchar,
    size: c_ulong,
) -> c_int;

/// Foreign read function accepted by [`pdfgate_file_access_create`].
///
/// It must start the read and return; the result is reported later through
/// [`pdfgate_file_access_set_value`], after the bytes were written to `buf`.
pub type RawReadFn =
    unsafe extern "system" fn(param: *mut c_void, position: usize, buf: *mut c_uchar, size: usize);

/// Layout-compatible mirror of PDFium's `FPDF_FILEACCESS`
#[repr(C)]
#[derive(Debug)]
pub struct FpdfFileAccess {
    pub file_len: c_ulong,
    pub get_block: Option<GetBlockFn>,
    pub param: *mut c_void,
}

/// One allocation handed to PDFium as its file access.
///
/// The header comes first so a pointer to the block is also a valid
/// `FPDF_FILEACCESS*`. `header.param` points back at the block itself.
#[repr(C)]
pub struct FileAccess {
    header: FpdfFileAccess,
    reader: BlockingReader,
}

// The header only points at the block itself; the reader is Send + Sync.
unsafe impl Send for FileAccess {}
unsafe impl Sync for FileAccess {}

impl FileAccess {
    /// Allocate a block for a document of `file_size` bytes.
    pub fn new(file_size: u64, reader: impl ReadBlock + 'static) -> Box<Self> {
        Self::with_reader(file_size, BlockingReader::new(reader))
    }

    pub fn with_reader(file_size: u64, reader: BlockingReader) -> Box<Self> {
        let mut block = Box::new(Self {
            header: FpdfFileAccess {
                file_len: c_ulong::try_from(file_size).unwrap_or(c_ulong::MAX),
                get_block: Some(get_block),
                param: std::ptr::null_mut(),
            },
            reader,
        });
        block.header.param = std::ptr::from_mut::<FileAccess>(&mut *block).cast::<c_void>();
        debug!("file access created for {file_size} bytes");
        block
    }

    #[must_use]
    pub fn file_len(&self) -> u64 {
        u64::from(self.header.file_len)
    }

    /// Pointer to pass to `FPDF_LoadCustomDocument`
    pub fn as_fpdf_file_access(&mut self) -> *mut FpdfFileAccess {
        std::ptr::from_mut(&mut self.header)
    }

    /// Read through the installed `m_GetBlock`, the way PDFium does.
    pub fn get_block(&self, position: u64, buf: &mut [u8]) -> i32 {
        let Some(callback) = self.header.get_block else {
            return 0;
        };
        let (Ok(position), Ok(size)) = (c_ulong::try_from(position), c_ulong::try_from(buf.len()))
        else {
            return 0;
        };
        // SAFETY: `param` points at this live block and `buf` is valid for `size` bytes.
        unsafe { callback(self.header.param, position, buf.as_mut_ptr(), size) }
    }

    /// Complete the in-flight read with a raw return value.
    pub fn set_value(&self, value: i32) -> bool {
        self.reader.set_value(value)
    }

    #[must_use]
    pub fn reader(&self) -> &BlockingReader {
        &self.reader
    }
}

impl std::fmt::Debug for FileAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileAccess")
            .field("file_len", &self.header.file_len)
            .field("reader", &self.reader)
            .finish()
    }
}

unsafe extern "system" fn get_block(
    param: *mut c_void,
    position: c_ulong,
    buf: *mut c_uchar,
    size: c_ulong,
) -> c_int {
    if param.is_null() {
        error!("m_GetBlock called without a file access block");
        return 0;
    }
    // SAFETY: `param` was set by `FileAccess::with_reader` to the block itself,
    // which outlives every document that references it.
    let block = unsafe { &*param.cast::<FileAccess>() };
    let Ok(len) = usize::try_from(size) else {
        return 0;
    };
    if buf.is_null() || len == 0 {
        return 0;
    }
    // SAFETY: PDFium guarantees `buf` is writable for `size` bytes for the
    // duration of the call, and the call does not return before completion.
    let dest = unsafe { std::slice::from_raw_parts_mut(buf, len) };
    block.reader.read_at(u64::from(position), dest)
}

struct ForeignParam(*mut c_void);

// Ownership of `param` stays with the foreign caller, who promised it may be
// used from the thread PDFium reads on.
unsafe impl Send for ForeignParam {}
unsafe impl Sync for ForeignParam {}

struct RawReader {
    read: RawReadFn,
    param: ForeignParam,
}

impl ReadBlock for RawReader {
    fn read_block(&self, request: PendingRead) {
        let position = usize::try_from(request.position()).unwrap_or(usize::MAX);
        let size = request.len();
        let dest = request.into_detached();
        // SAFETY: the foreign function contract; the destination stays valid
        // until it calls `pdfgate_file_access_set_value`.
        unsafe { (self.read)(self.param.0, position, dest, size) };
    }
}

/// Allocate a file access block for foreign callers.
///
/// # Safety
/// `read_block` must follow the [`RawReadFn`] contract and `param` must stay
/// valid until the block is destroyed.
#[unsafe(no_mangle)]
pub unsafe extern "system" fn pdfgate_file_access_create(
    file_size: c_ulong,
    read_block: Option<RawReadFn>,
    param: *mut c_void,
) -> *mut FileAccess {
    let Some(read) = read_block else {
        error!("pdfgate_file_access_create called without a read function");
        return std::ptr::null_mut();
    };
    let reader = RawReader {
        read,
        param: ForeignParam(param),
    };
    Box::into_raw(FileAccess::new(u64::from(file_size), reader))
}

/// Free a block created by [`pdfgate_file_access_create`].
///
/// # Safety
/// `block` must come from [`pdfgate_file_access_create`], must not be used
/// afterwards, and no document may still reference it.
#[unsafe(no_mangle)]
pub unsafe extern "system" fn pdfgate_file_access_destroy(block: *mut FileAccess) {
    if block.is_null() {
        return;
    }
    // SAFETY: caller contract.
    drop(unsafe { Box::from_raw(block) });
}

/// Report the result of the read currently in flight.
///
/// # Safety
/// `block` must be a live block from [`pdfgate_file_access_create`].
#[unsafe(no_mangle)]
pub unsafe extern "system" fn pdfgate_file_access_set_value(block: *mut FileAccess, value: c_int) {
    if block.is_null() {
        return;
    }
    // SAFETY: caller contract.
    let block = unsafe { &*block };
    if !block.set_value(value) {
        debug!("set_value({value}) with no read in flight");
    }
}
