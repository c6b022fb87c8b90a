//! Synchronous read callbacks satisfied by asynchronous host I/O

mod file_access;
mod slot;

pub use file_access::{
    FileAccess, FpdfFileAccess, GetBlockFn, RawReadFn, pdfgate_file_access_create,
    pdfgate_file_access_destroy, pdfgate_file_access_set_value,
};
pub use slot::{BlockingReader, PendingRead, ReadBlock};
