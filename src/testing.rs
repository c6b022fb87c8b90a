//! Deterministic in-memory engine for exercising the worker and dispatcher

use std::collections::HashMap;

use crate::bridge::BlockingReader;
use crate::pdf::links::{LinkAnnotation, LinkSources, RawAction, RawDest, WebLink};
use crate::pdf::{
    CharGeometry, DestCommand, DocumentHandle, DocumentInfo, DocumentSource, LoadedPage,
    OutlineNode, PageHandle, PageInfo, PdfDest, PdfEngine, PdfError, PdfErrorCode, PdfRect,
    RenderOptions, RenderedBitmap,
};

pub const PAGE_WIDTH: f64 = 612.0;
pub const PAGE_HEIGHT: f64 = 792.0;

/// Every document has `page_count` US Letter pages reading "Hi yo".
///
/// Documents whose bytes start with `locked` need the password `secret`.
#[derive(Debug)]
pub struct FakeEngine {
    pub page_count: usize,
    pub panic_on_outline: bool,
    documents: HashMap<DocumentHandle, usize>,
    pages: HashMap<PageHandle, DocumentHandle>,
    next_handle: u64,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self {
            page_count: 2,
            panic_on_outline: false,
            documents: HashMap::new(),
            pages: HashMap::new(),
            next_handle: 1,
        }
    }
}

impl FakeEngine {
    #[must_use]
    pub fn open_documents(&self) -> usize {
        self.documents.len()
    }

    fn check_bytes(data: &[u8], password: Option<&str>) -> Result<(), PdfError> {
        if data.is_empty() {
            return Err(PdfError::open(PdfErrorCode::Format, "empty document"));
        }
        if data.starts_with(b"locked") && password != Some("secret") {
            return Err(PdfError::open(PdfErrorCode::Password, "password required"));
        }
        Ok(())
    }

    fn page(&self, page: PageHandle) -> Result<DocumentHandle, PdfError> {
        self.pages.get(&page).copied().ok_or(PdfError::UnknownHandle {
            kind: "page",
            handle: page.0,
        })
    }
}

impl PdfEngine for FakeEngine {
    fn open_document(
        &mut self,
        source: DocumentSource,
        password: Option<&str>,
    ) -> Result<DocumentInfo, PdfError> {
        match source {
            DocumentSource::Data(data) => Self::check_bytes(&data, password)?,
            DocumentSource::Path(path) => {
                let data = std::fs::read(&path)
                    .map_err(|e| PdfError::open(PdfErrorCode::File, e.to_string()))?;
                Self::check_bytes(&data, password)?;
            }
            DocumentSource::Reader { size, reader } => {
                let bridge = BlockingReader::new(move |request| reader.read_block(request));
                let mut head = vec![0u8; size.min(8) as usize];
                if bridge.read_at(0, &mut head) <= 0 {
                    return Err(PdfError::open(PdfErrorCode::File, "read failed"));
                }
                Self::check_bytes(&head, password)?;
            }
        }

        let handle = DocumentHandle(self.next_handle);
        self.next_handle += 1;
        self.documents.insert(handle, self.page_count);
        Ok(DocumentInfo {
            handle,
            page_count: self.page_count,
            permissions: 0xFFFF_FFFC,
            security_handler_revision: -1,
            pages: (0..self.page_count)
                .map(|index| PageInfo {
                    index,
                    width: PAGE_WIDTH,
                    height: PAGE_HEIGHT,
                    rotation: 0,
                })
                .collect(),
        })
    }

    fn close_document(&mut self, document: DocumentHandle) -> Result<(), PdfError> {
        self.documents
            .remove(&document)
            .ok_or(PdfError::UnknownHandle {
                kind: "document",
                handle: document.0,
            })?;
        self.pages.retain(|_, owner| *owner != document);
        Ok(())
    }

    fn load_outline(&mut self, _document: DocumentHandle) -> Result<Vec<OutlineNode>, PdfError> {
        if self.panic_on_outline {
            panic!("outline exploded");
        }
        Ok(vec![OutlineNode {
            title: "Chapter 1".into(),
            dest: Some(PdfDest {
                page_number: 1,
                command: DestCommand::Fit,
                params: Vec::new(),
            }),
            children: Vec::new(),
        }])
    }

    fn load_page(&mut self, document: DocumentHandle, index: usize) -> Result<LoadedPage, PdfError> {
        let count = *self.documents.get(&document).ok_or(PdfError::UnknownHandle {
            kind: "document",
            handle: document.0,
        })?;
        if index >= count {
            return Err(PdfError::PageLoadFailure { index });
        }
        let handle = PageHandle(self.next_handle);
        self.next_handle += 1;
        self.pages.insert(handle, document);
        Ok(LoadedPage {
            handle,
            info: PageInfo {
                index,
                width: PAGE_WIDTH,
                height: PAGE_HEIGHT,
                rotation: 0,
            },
        })
    }

    fn close_page(&mut self, page: PageHandle) -> Result<(), PdfError> {
        self.page(page)?;
        self.pages.remove(&page);
        Ok(())
    }

    fn render_page(
        &mut self,
        page: PageHandle,
        options: &RenderOptions,
    ) -> Result<RenderedBitmap, PdfError> {
        self.page(page)?;
        let [a, r, g, b] = options.background.to_be_bytes();
        let pixels = [r, g, b, a]
            .repeat(options.width as usize * options.height as usize);
        Ok(RenderedBitmap {
            width: options.width,
            height: options.height,
            pixels,
        })
    }

    fn page_chars(&mut self, page: PageHandle) -> Result<Vec<CharGeometry>, PdfError> {
        self.page(page)?;
        Ok("Hi yo"
            .chars()
            .enumerate()
            .map(|(i, ch)| {
                let left = 72.0 + i as f64 * 10.0;
                CharGeometry::new(ch, PdfRect::new(left, 710.0, left + 8.0, 700.0))
            })
            .collect())
    }

    fn page_link_sources(&mut self, page: PageHandle) -> Result<LinkSources, PdfError> {
        self.page(page)?;
        Ok(LinkSources {
            web_links: vec![WebLink {
                url: "https://example.com".into(),
                rects: vec![PdfRect::new(72.0, 700.0, 200.0, 690.0)],
            }],
            annotations: vec![LinkAnnotation {
                rect: PdfRect::new(72.0, 100.0, 144.0, 120.0),
                dest: None,
                action: Some(RawAction::GoTo(Some(RawDest {
                    page_index: 1,
                    view: 1,
                    params: vec![0.0, 792.0, 0.0],
                }))),
            }],
        })
    }
}
