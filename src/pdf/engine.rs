//! Operations every PDF engine backend provides

use std::path::PathBuf;
use std::sync::Arc;

use crate::bridge::ReadBlock;

use super::error::PdfError;
use super::links::LinkSources;
use super::outline::OutlineNode;
use super::types::{
    CharGeometry, DocumentHandle, DocumentInfo, LoadedPage, PageHandle, RenderOptions,
    RenderedBitmap,
};

/// Where a document's bytes come from
pub enum DocumentSource {
    /// Whole document in memory
    Data(Vec<u8>),
    /// Host file, read on demand
    Path(PathBuf),
    /// Host asynchronous read function of a document of `size` bytes
    Reader {
        size: u64,
        reader: Arc<dyn ReadBlock>,
    },
}

impl std::fmt::Debug for DocumentSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Data(data) => f.debug_tuple("Data").field(&data.len()).finish(),
            Self::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Self::Reader { size, .. } => f.debug_struct("Reader").field("size", size).finish(),
        }
    }
}

/// Synchronous engine, driven from a single worker thread.
///
/// Handles returned by one engine are meaningless to another. Every opened
/// document and loaded page must be closed explicitly.
pub trait PdfEngine {
    fn open_document(
        &mut self,
        source: DocumentSource,
        password: Option<&str>,
    ) -> Result<DocumentInfo, PdfError>;

    /// Close a document and release its byte source.
    fn close_document(&mut self, document: DocumentHandle) -> Result<(), PdfError>;

    fn load_outline(&mut self, document: DocumentHandle) -> Result<Vec<OutlineNode>, PdfError>;

    fn load_page(&mut self, document: DocumentHandle, index: usize)
    -> Result<LoadedPage, PdfError>;

    fn close_page(&mut self, page: PageHandle) -> Result<(), PdfError>;

    fn render_page(
        &mut self,
        page: PageHandle,
        options: &RenderOptions,
    ) -> Result<RenderedBitmap, PdfError>;

    /// Every character on the page with its box, in engine order
    fn page_chars(&mut self, page: PageHandle) -> Result<Vec<CharGeometry>, PdfError>;

    /// Auto-detected web links and link annotations of the page
    fn page_link_sources(&mut self, page: PageHandle) -> Result<LinkSources, PdfError>;
}
