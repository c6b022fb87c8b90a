//! [`PdfEngine`] backed by the wasm build of PDFium

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use wasmer::Value;

use super::SandboxError;
use super::memory::GrowthPolicy;
use super::runtime::SandboxRuntime;
use super::vfs::{BridgedFile, FileContext, HostFile, MemoryFile};
use crate::bridge::BlockingReader;
use crate::pdf::links::{LinkAnnotation, LinkSources, RawAction, RawDest, WebLink};
use crate::pdf::outline::{OutlineNode, RawBookmark};
use crate::pdf::{
    CharGeometry, DocumentHandle, DocumentInfo, DocumentSource, LoadedPage, PageHandle, PageInfo,
    PdfEngine, PdfError, PdfErrorCode, PdfRect, RenderOptions, RenderedBitmap,
};

/// Directory synthetic document names are registered under
pub const DOCUMENT_DIR: &str = "/pdfgate";
pub const DEFAULT_LARGE_DOCUMENT_THRESHOLD: u64 = 16 * 1024 * 1024;

const FPDF_ANNOT: i32 = 0x01;
const FPDF_REVERSE_BYTE_ORDER: i32 = 0x10;
const FPDF_BITMAP_BGRA: i32 = 4;
const FPDF_ANNOT_LINK: i32 = 2;
const MAX_OUTLINE_DEPTH: usize = 64;

#[derive(Clone, Debug, PartialEq)]
pub struct SandboxConfig {
    pub growth: GrowthPolicy,
    /// In-memory documents larger than this are opened by name instead of copied into the guest
    pub large_document_threshold: u64,
    /// Bound on each bridged host read; `None` waits forever
    pub read_timeout: Option<Duration>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            growth: GrowthPolicy::default(),
            large_document_threshold: DEFAULT_LARGE_DOCUMENT_THRESHOLD,
            read_timeout: None,
        }
    }
}

struct OpenDocument {
    ptr: i32,
    file_name: Option<String>,
    buffers: Vec<u32>,
    pages: HashSet<PageHandle>,
}

struct OpenPage {
    document: DocumentHandle,
    ptr: i32,
    index: usize,
}

pub struct SandboxEngine {
    runtime: SandboxRuntime,
    config: SandboxConfig,
    documents: HashMap<DocumentHandle, OpenDocument>,
    pages: HashMap<PageHandle, OpenPage>,
    next_handle: u64,
    next_file: u64,
}

fn ptr(value: u32) -> Value {
    Value::I32(value as i32)
}

fn int(value: i32) -> Value {
    Value::I32(value)
}

/// ARGB to ABGR
fn swap_red_blue(argb: u32) -> u32 {
    (argb & 0xFF00_FF00) | ((argb >> 16) & 0xFF) | ((argb & 0xFF) << 16)
}

fn decode_utf16(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .take_while(|&unit| unit != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

impl SandboxEngine {
    pub fn load(wasm_path: impl AsRef<Path>, config: SandboxConfig) -> Result<Self, PdfError> {
        let runtime = SandboxRuntime::from_file(wasm_path, config.growth)?;
        Self::new(runtime, config)
    }

    /// Initialize the library inside an already instantiated runtime.
    pub fn new(mut runtime: SandboxRuntime, config: SandboxConfig) -> Result<Self, PdfError> {
        runtime.call_void("FPDF_InitLibrary", &[])?;
        info!("PDFium initialized in sandbox");
        Ok(Self {
            runtime,
            config,
            documents: HashMap::new(),
            pages: HashMap::new(),
            next_handle: 1,
            next_file: 1,
        })
    }

    pub fn runtime(&self) -> &SandboxRuntime {
        &self.runtime
    }

    pub fn runtime_mut(&mut self) -> &mut SandboxRuntime {
        &mut self.runtime
    }

    fn next_handle(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn register_source(&mut self, context: Arc<dyn FileContext>) -> String {
        let name = format!("{DOCUMENT_DIR}/doc-{}.pdf", self.next_file);
        self.next_file += 1;
        self.runtime.vfs_mut().register_file(&name, context);
        self.refresh_listing();
        name
    }

    fn refresh_listing(&mut self) {
        let mut entries: Vec<String> = self
            .documents
            .values()
            .filter_map(|doc| doc.file_name.as_deref())
            .filter_map(|name| name.rsplit('/').next())
            .map(str::to_string)
            .collect();
        entries.sort();
        self.runtime
            .vfs_mut()
            .register_directory(DOCUMENT_DIR, entries);
    }

    fn free_all(&mut self, buffers: &[u32]) {
        for &buffer in buffers {
            if let Err(e) = self.runtime.free(buffer) {
                warn!("failed to free guest buffer {buffer:#x}: {e}");
            }
        }
    }

    fn last_error(&mut self) -> PdfErrorCode {
        self.runtime
            .call_i32("FPDF_GetLastError", &[])
            .map(PdfErrorCode::from_code)
            .unwrap_or(PdfErrorCode::Unknown)
    }

    fn load_by_name(&mut self, name: &str, password: u32) -> Result<i32, PdfError> {
        let path = self.runtime.alloc_c_string(name)?;
        let result = self
            .runtime
            .call_i32("FPDF_LoadDocument", &[ptr(path), ptr(password)]);
        self.runtime.free(path)?;
        Ok(result?)
    }

    fn document(&self, handle: DocumentHandle) -> Result<&OpenDocument, PdfError> {
        self.documents.get(&handle).ok_or(PdfError::UnknownHandle {
            kind: "document",
            handle: handle.0,
        })
    }

    fn page(&self, handle: PageHandle) -> Result<&OpenPage, PdfError> {
        self.pages.get(&handle).ok_or(PdfError::UnknownHandle {
            kind: "page",
            handle: handle.0,
        })
    }

    fn page_size(&mut self, page: i32) -> Result<(f64, f64, i32), SandboxError> {
        let width = self.runtime.call_f64("FPDF_GetPageWidth", &[int(page)])?;
        let height = self.runtime.call_f64("FPDF_GetPageHeight", &[int(page)])?;
        let rotation = self.runtime.call_i32("FPDFPage_GetRotation", &[int(page)])?;
        Ok((width, height, rotation))
    }

    fn describe_pages(&mut self, doc: i32, count: usize) -> Result<Vec<PageInfo>, SandboxError> {
        let mut pages = Vec::with_capacity(count);
        for index in 0..count {
            let page = self.runtime.call_i32("FPDF_LoadPage", &[int(doc), int(index as i32)])?;
            if page == 0 {
                warn!("page {index} failed to load while describing document");
                pages.push(PageInfo {
                    index,
                    width: 0.0,
                    height: 0.0,
                    rotation: 0,
                });
                continue;
            }
            let size = self.page_size(page);
            self.runtime.call_void("FPDF_ClosePage", &[int(page)])?;
            let (width, height, rotation) = size?;
            pages.push(PageInfo {
                index,
                width,
                height,
                rotation,
            });
        }
        Ok(pages)
    }

    fn read_f64s<const N: usize>(&self, base: u32) -> Result<[f64; N], SandboxError> {
        let mut out = [0.0; N];
        for (i, value) in out.iter_mut().enumerate() {
            *value = self.runtime.read_f64(base + (i as u32) * 8)?;
        }
        Ok(out)
    }

    fn collect_chars(&mut self, text_page: i32, scratch: u32) -> Result<Vec<CharGeometry>, SandboxError> {
        let count = self.runtime.call_i32("FPDFText_CountChars", &[int(text_page)])?;
        let mut chars = Vec::with_capacity(count.max(0) as usize);
        for i in 0..count.max(0) {
            let codepoint = self
                .runtime
                .call_i32("FPDFText_GetUnicode", &[int(text_page), int(i)])? as u32;
            let ok = self.runtime.call_i32(
                "FPDFText_GetCharBox",
                &[
                    int(text_page),
                    int(i),
                    ptr(scratch),
                    ptr(scratch + 8),
                    ptr(scratch + 16),
                    ptr(scratch + 24),
                ],
            )?;
            let rect = if ok != 0 {
                let [left, right, bottom, top] = self.read_f64s::<4>(scratch)?;
                PdfRect::new(left, top, right, bottom)
            } else {
                PdfRect::default()
            };
            chars.push(CharGeometry { codepoint, rect });
        }
        Ok(chars)
    }

    fn collect_web_links(&mut self, text_page: i32, scratch: u32) -> Result<Vec<WebLink>, SandboxError> {
        let links = self.runtime.call_i32("FPDFLink_LoadWebLinks", &[int(text_page)])?;
        if links == 0 {
            return Ok(Vec::new());
        }
        let result = self.walk_web_links(links, scratch);
        self.runtime.call_void("FPDFLink_CloseWebLinks", &[int(links)])?;
        result
    }

    fn walk_web_links(&mut self, links: i32, scratch: u32) -> Result<Vec<WebLink>, SandboxError> {
        let count = self.runtime.call_i32("FPDFLink_CountWebLinks", &[int(links)])?;
        let mut out = Vec::new();
        for i in 0..count.max(0) {
            let units = self
                .runtime
                .call_i32("FPDFLink_GetURL", &[int(links), int(i), int(0), int(0)])?;
            let url = if units > 0 {
                let buffer = self.runtime.alloc(units as usize * 2)?;
                let read = self
                    .runtime
                    .call_i32("FPDFLink_GetURL", &[int(links), int(i), ptr(buffer), int(units)]);
                let bytes = self.runtime.read_bytes(buffer, units as usize * 2);
                self.runtime.free(buffer)?;
                read?;
                decode_utf16(&bytes?)
            } else {
                String::new()
            };

            let rect_count = self
                .runtime
                .call_i32("FPDFLink_CountRects", &[int(links), int(i)])?;
            let mut rects = Vec::new();
            for r in 0..rect_count.max(0) {
                let ok = self.runtime.call_i32(
                    "FPDFLink_GetRect",
                    &[
                        int(links),
                        int(i),
                        int(r),
                        ptr(scratch),
                        ptr(scratch + 8),
                        ptr(scratch + 16),
                        ptr(scratch + 24),
                    ],
                )?;
                if ok != 0 {
                    let [left, top, right, bottom] = self.read_f64s::<4>(scratch)?;
                    rects.push(PdfRect::new(left, top, right, bottom));
                }
            }
            out.push(WebLink { url, rects });
        }
        Ok(out)
    }

    fn raw_dest(&mut self, doc: i32, dest: i32, scratch: u32) -> Result<Option<RawDest>, SandboxError> {
        if dest == 0 {
            return Ok(None);
        }
        let page_index = self
            .runtime
            .call_i32("FPDFDest_GetDestPageIndex", &[int(doc), int(dest)])?;
        let view = self.runtime.call_i32(
            "FPDFDest_GetView",
            &[int(dest), ptr(scratch), ptr(scratch + 4)],
        )?;
        let count = self.runtime.read_u32(scratch)?.min(4);
        let mut params = Vec::with_capacity(count as usize);
        for i in 0..count {
            params.push(self.runtime.read_f32(scratch + 4 + i * 4)?);
        }
        Ok(Some(RawDest {
            page_index,
            view,
            params,
        }))
    }

    fn raw_action(&mut self, doc: i32, action: i32, scratch: u32) -> Result<Option<RawAction>, SandboxError> {
        if action == 0 {
            return Ok(None);
        }
        let kind = self.runtime.call_i32("FPDFAction_GetType", &[int(action)])?;
        let action = match kind {
            1 => {
                let dest = self
                    .runtime
                    .call_i32("FPDFAction_GetDest", &[int(doc), int(action)])?;
                RawAction::GoTo(self.raw_dest(doc, dest, scratch)?)
            }
            2 => RawAction::RemoteGoTo,
            3 => {
                let len = self
                    .runtime
                    .call_i32("FPDFAction_GetURIPath", &[int(doc), int(action), int(0), int(0)])?;
                if len <= 0 {
                    RawAction::Uri(String::new())
                } else {
                    let buffer = self.runtime.alloc(len as usize)?;
                    let read = self.runtime.call_i32(
                        "FPDFAction_GetURIPath",
                        &[int(doc), int(action), ptr(buffer), int(len)],
                    );
                    let text = self.runtime.read_c_string(buffer);
                    self.runtime.free(buffer)?;
                    read?;
                    RawAction::Uri(text?)
                }
            }
            4 => RawAction::Launch,
            5 => RawAction::EmbeddedGoTo,
            _ => RawAction::Unsupported,
        };
        Ok(Some(action))
    }

    fn collect_annotations(&mut self, doc: i32, page: i32, scratch: u32) -> Result<Vec<LinkAnnotation>, SandboxError> {
        let count = self.runtime.call_i32("FPDFPage_GetAnnotCount", &[int(page)])?;
        let mut out = Vec::new();
        for i in 0..count.max(0) {
            let annot = self.runtime.call_i32("FPDFPage_GetAnnot", &[int(page), int(i)])?;
            if annot == 0 {
                continue;
            }
            let link = self.read_link_annotation(doc, annot, scratch);
            self.runtime.call_void("FPDFPage_CloseAnnot", &[int(annot)])?;
            if let Some(link) = link? {
                out.push(link);
            }
        }
        Ok(out)
    }

    fn read_link_annotation(&mut self, doc: i32, annot: i32, scratch: u32) -> Result<Option<LinkAnnotation>, SandboxError> {
        let subtype = self.runtime.call_i32("FPDFAnnot_GetSubtype", &[int(annot)])?;
        if subtype != FPDF_ANNOT_LINK {
            return Ok(None);
        }
        if self.runtime.call_i32("FPDFAnnot_GetRect", &[int(annot), ptr(scratch)])? == 0 {
            return Ok(None);
        }
        let mut corners = [0.0f64; 4];
        for (i, value) in corners.iter_mut().enumerate() {
            *value = f64::from(self.runtime.read_f32(scratch + i as u32 * 4)?);
        }
        let [left, top, right, bottom] = corners;

        let link = self.runtime.call_i32("FPDFAnnot_GetLink", &[int(annot)])?;
        if link == 0 {
            return Ok(None);
        }
        let dest = self.runtime.call_i32("FPDFLink_GetDest", &[int(doc), int(link)])?;
        let dest = self.raw_dest(doc, dest, scratch)?;
        let action = self.runtime.call_i32("FPDFLink_GetAction", &[int(link)])?;
        let action = self.raw_action(doc, action, scratch)?;
        Ok(Some(LinkAnnotation {
            rect: PdfRect::new(left, top, right, bottom),
            dest,
            action,
        }))
    }

    fn bookmark_title(&mut self, bookmark: i32) -> Result<String, SandboxError> {
        let len = self
            .runtime
            .call_i32("FPDFBookmark_GetTitle", &[int(bookmark), int(0), int(0)])?;
        if len <= 2 {
            return Ok(String::new());
        }
        let buffer = self.runtime.alloc(len as usize)?;
        let read = self
            .runtime
            .call_i32("FPDFBookmark_GetTitle", &[int(bookmark), ptr(buffer), int(len)]);
        let bytes = self.runtime.read_bytes(buffer, len as usize);
        self.runtime.free(buffer)?;
        read?;
        Ok(decode_utf16(&bytes?))
    }

    fn walk_bookmarks(
        &mut self,
        doc: i32,
        parent: i32,
        depth: usize,
        seen: &mut HashSet<i32>,
        scratch: u32,
    ) -> Result<Vec<RawBookmark>, SandboxError> {
        let mut out = Vec::new();
        if depth > MAX_OUTLINE_DEPTH {
            warn!("outline deeper than {MAX_OUTLINE_DEPTH} levels; truncating");
            return Ok(out);
        }
        let mut current = self
            .runtime
            .call_i32("FPDFBookmark_GetFirstChild", &[int(doc), int(parent)])?;
        while current != 0 && seen.insert(current) {
            let title = self.bookmark_title(current)?;
            let dest = self
                .runtime
                .call_i32("FPDFBookmark_GetDest", &[int(doc), int(current)])?;
            let dest = self.raw_dest(doc, dest, scratch)?;
            let action = self.runtime.call_i32("FPDFBookmark_GetAction", &[int(current)])?;
            let action = self.raw_action(doc, action, scratch)?;
            let children = self.walk_bookmarks(doc, current, depth + 1, seen, scratch)?;
            out.push(RawBookmark {
                title,
                dest,
                action,
                children,
            });
            current = self
                .runtime
                .call_i32("FPDFBookmark_GetNextSibling", &[int(doc), int(current)])?;
        }
        Ok(out)
    }

    /// Run `f` with a 32-byte guest scratch area, freeing it afterwards.
    fn with_scratch<T>(
        &mut self,
        f: impl FnOnce(&mut Self, u32) -> Result<T, SandboxError>,
    ) -> Result<T, PdfError> {
        let scratch = self.runtime.alloc(32)?;
        let result = f(self, scratch);
        self.runtime.free(scratch)?;
        Ok(result?)
    }

    fn with_text_page<T>(
        &mut self,
        page: PageHandle,
        f: impl FnOnce(&mut Self, i32, u32) -> Result<T, SandboxError>,
    ) -> Result<T, PdfError> {
        let (page_ptr, index) = {
            let page = self.page(page)?;
            (page.ptr, page.index)
        };
        let text_page = self.runtime.call_i32("FPDFText_LoadPage", &[int(page_ptr)])?;
        if text_page == 0 {
            return Err(PdfError::PageLoadFailure { index });
        }
        let result = self.with_scratch(|engine, scratch| f(engine, text_page, scratch));
        self.runtime.call_void("FPDFText_ClosePage", &[int(text_page)])?;
        result
    }

    fn render_into(
        &mut self,
        bitmap: i32,
        page: i32,
        options: &RenderOptions,
    ) -> Result<RenderedBitmap, SandboxError> {
        let (width, height) = (options.width as i32, options.height as i32);
        let mut flags = FPDF_REVERSE_BYTE_ORDER;
        if options.annotations {
            flags |= FPDF_ANNOT;
        }
        // FillRect always writes BGRA; the reversed render reads the buffer as RGBA
        let fill = if flags & FPDF_REVERSE_BYTE_ORDER != 0 {
            swap_red_blue(options.background)
        } else {
            options.background
        };
        self.runtime.call(
            "FPDFBitmap_FillRect",
            &[
                int(bitmap),
                int(0),
                int(0),
                int(width),
                int(height),
                int(fill as i32),
            ],
        )?;
        self.runtime.call_void(
            "FPDF_RenderPageBitmap",
            &[
                int(bitmap),
                int(page),
                int(-options.x),
                int(-options.y),
                int(options.full_width.round() as i32),
                int(options.full_height.round() as i32),
                int(0),
                int(flags),
            ],
        )?;

        let buffer = self.runtime.call_i32("FPDFBitmap_GetBuffer", &[int(bitmap)])? as u32;
        let stride = self.runtime.call_i32("FPDFBitmap_GetStride", &[int(bitmap)])?.max(0) as usize;
        let row = options.width as usize * 4;
        let raw = self
            .runtime
            .read_bytes(buffer, stride * options.height as usize)?;
        let pixels = if stride == row {
            raw
        } else {
            raw.chunks(stride.max(1))
                .flat_map(|line| &line[..row.min(line.len())])
                .copied()
                .collect()
        };
        Ok(RenderedBitmap {
            width: options.width,
            height: options.height,
            pixels,
        })
    }
}

impl PdfEngine for SandboxEngine {
    fn open_document(
        &mut self,
        source: DocumentSource,
        password: Option<&str>,
    ) -> Result<DocumentInfo, PdfError> {
        let password_ptr = match password {
            Some(password) => self.runtime.alloc_c_string(password)?,
            None => 0,
        };

        let mut buffers = Vec::new();
        let mut file_name = None;
        let loaded = match source {
            DocumentSource::Data(data) if data.len() as u64 > self.config.large_document_threshold => {
                debug!("opening {} byte document by name", data.len());
                let name = self.register_source(Arc::new(MemoryFile::new(data)));
                file_name = Some(name.clone());
                self.load_by_name(&name, password_ptr)
            }
            DocumentSource::Data(data) => match self.runtime.alloc_bytes(&data) {
                Ok(buffer) => {
                    buffers.push(buffer);
                    self.runtime
                        .call_i32(
                            "FPDF_LoadMemDocument",
                            &[ptr(buffer), int(data.len() as i32), ptr(password_ptr)],
                        )
                        .map_err(PdfError::from)
                }
                Err(e) => Err(e.into()),
            },
            DocumentSource::Path(path) => match HostFile::open(&path) {
                Ok(file) => {
                    let name = self.register_source(Arc::new(file));
                    file_name = Some(name.clone());
                    self.load_by_name(&name, password_ptr)
                }
                Err(e) => Err(PdfError::open(
                    PdfErrorCode::File,
                    format!("{}: {e}", path.display()),
                )),
            },
            DocumentSource::Reader { size, reader } => {
                let blocking = BlockingReader::new(move |request| reader.read_block(request))
                    .with_timeout(self.config.read_timeout);
                let name = self.register_source(Arc::new(BridgedFile::new(size, blocking)));
                file_name = Some(name.clone());
                self.load_by_name(&name, password_ptr)
            }
        };
        self.free_all(&[password_ptr]);

        let doc = match loaded {
            Ok(doc) if doc != 0 => doc,
            other => {
                let error = match other {
                    Err(e) => e,
                    Ok(_) => {
                        let code = self.last_error();
                        PdfError::open(code, "library rejected the document")
                    }
                };
                if let Some(name) = &file_name {
                    self.runtime.vfs_mut().unregister_file(name);
                    self.refresh_listing();
                }
                self.free_all(&buffers);
                return Err(error);
            }
        };

        let handle = DocumentHandle(self.next_handle());
        self.documents.insert(
            handle,
            OpenDocument {
                ptr: doc,
                file_name,
                buffers,
                pages: HashSet::new(),
            },
        );
        self.refresh_listing();

        let info = (|| -> Result<DocumentInfo, SandboxError> {
            let page_count = self.runtime.call_i32("FPDF_GetPageCount", &[int(doc)])?.max(0) as usize;
            let permissions = self.runtime.call_i32("FPDF_GetDocPermissions", &[int(doc)])? as u32;
            let security_handler_revision = self
                .runtime
                .call_i32("FPDF_GetSecurityHandlerRevision", &[int(doc)])?;
            let pages = self.describe_pages(doc, page_count)?;
            Ok(DocumentInfo {
                handle,
                page_count,
                permissions,
                security_handler_revision,
                pages,
            })
        })();

        match info {
            Ok(info) => {
                info!("opened document {} ({} pages)", handle.0, info.page_count);
                Ok(info)
            }
            Err(e) => {
                if let Err(close) = self.close_document(handle) {
                    warn!("closing document {} after failed open: {close}", handle.0);
                }
                Err(e.into())
            }
        }
    }

    fn close_document(&mut self, document: DocumentHandle) -> Result<(), PdfError> {
        let doc = self.documents.remove(&document).ok_or(PdfError::UnknownHandle {
            kind: "document",
            handle: document.0,
        })?;
        for page in &doc.pages {
            if let Some(open) = self.pages.remove(page) {
                self.runtime.call_void("FPDF_ClosePage", &[int(open.ptr)])?;
            }
        }
        let closed = self.runtime.call_void("FPDF_CloseDocument", &[int(doc.ptr)]);
        if let Some(name) = &doc.file_name {
            self.runtime.vfs_mut().unregister_file(name);
            for leaked in self.runtime.vfs().open_descriptors() {
                if leaked.name == *name {
                    warn!(
                        "descriptor {} on {name} still open after close (position {})",
                        leaked.fd, leaked.position
                    );
                }
            }
        }
        self.refresh_listing();
        self.free_all(&doc.buffers);
        debug!("closed document {}", document.0);
        Ok(closed?)
    }

    fn load_outline(&mut self, document: DocumentHandle) -> Result<Vec<OutlineNode>, PdfError> {
        let doc = self.document(document)?.ptr;
        let raw = self.with_scratch(|engine, scratch| {
            engine.walk_bookmarks(doc, 0, 0, &mut HashSet::new(), scratch)
        })?;
        Ok(raw.iter().map(OutlineNode::from_raw).collect())
    }

    fn load_page(&mut self, document: DocumentHandle, index: usize) -> Result<LoadedPage, PdfError> {
        let doc = self.document(document)?.ptr;
        let page = self
            .runtime
            .call_i32("FPDF_LoadPage", &[int(doc), int(index as i32)])?;
        if page == 0 {
            return Err(PdfError::PageLoadFailure { index });
        }
        let (width, height, rotation) = match self.page_size(page) {
            Ok(size) => size,
            Err(e) => {
                self.runtime.call_void("FPDF_ClosePage", &[int(page)])?;
                return Err(e.into());
            }
        };

        let handle = PageHandle(self.next_handle());
        self.pages.insert(
            handle,
            OpenPage {
                document,
                ptr: page,
                index,
            },
        );
        if let Some(doc) = self.documents.get_mut(&document) {
            doc.pages.insert(handle);
        }
        Ok(LoadedPage {
            handle,
            info: PageInfo {
                index,
                width,
                height,
                rotation,
            },
        })
    }

    fn close_page(&mut self, page: PageHandle) -> Result<(), PdfError> {
        let open = self.pages.remove(&page).ok_or(PdfError::UnknownHandle {
            kind: "page",
            handle: page.0,
        })?;
        if let Some(doc) = self.documents.get_mut(&open.document) {
            doc.pages.remove(&page);
        }
        self.runtime.call_void("FPDF_ClosePage", &[int(open.ptr)])?;
        Ok(())
    }

    fn render_page(
        &mut self,
        page: PageHandle,
        options: &RenderOptions,
    ) -> Result<RenderedBitmap, PdfError> {
        let page_ptr = self.page(page)?.ptr;
        if options.width == 0 || options.height == 0 {
            return Err(PdfError::RenderFailure(format!(
                "empty target {}x{}",
                options.width, options.height
            )));
        }
        let bitmap = self.runtime.call_i32(
            "FPDFBitmap_CreateEx",
            &[
                int(options.width as i32),
                int(options.height as i32),
                int(FPDF_BITMAP_BGRA),
                int(0),
                int(0),
            ],
        )?;
        if bitmap == 0 {
            return Err(PdfError::RenderFailure(format!(
                "cannot allocate {}x{} bitmap",
                options.width, options.height
            )));
        }
        let rendered = self.render_into(bitmap, page_ptr, options);
        self.runtime.call_void("FPDFBitmap_Destroy", &[int(bitmap)])?;
        rendered.map_err(|e| match e {
            SandboxError::OutOfMemory(_) | SandboxError::Runtime(_) => {
                PdfError::RenderFailure(e.to_string())
            }
            other => other.into(),
        })
    }

    fn page_chars(&mut self, page: PageHandle) -> Result<Vec<CharGeometry>, PdfError> {
        self.with_text_page(page, |engine, text_page, scratch| {
            engine.collect_chars(text_page, scratch)
        })
    }

    fn page_link_sources(&mut self, page: PageHandle) -> Result<LinkSources, PdfError> {
        let (page_ptr, document) = {
            let open = self.page(page)?;
            (open.ptr, open.document)
        };
        let doc = self.document(document)?.ptr;
        let web_links = self.with_text_page(page, |engine, text_page, scratch| {
            engine.collect_web_links(text_page, scratch)
        })?;
        let annotations = self.with_scratch(|engine, scratch| {
            engine.collect_annotations(doc, page_ptr, scratch)
        })?;
        Ok(LinkSources {
            web_links,
            annotations,
        })
    }
}

impl Drop for SandboxEngine {
    fn drop(&mut self) {
        let handles: Vec<_> = self.documents.keys().copied().collect();
        for handle in handles {
            if let Err(e) = self.close_document(handle) {
                warn!("closing document {} on shutdown failed: {e}", handle.0);
            }
        }
        if let Err(e) = self.runtime.call_void("FPDF_DestroyLibrary", &[]) {
            debug!("FPDF_DestroyLibrary: {e}");
        }
    }
}

impl std::fmt::Debug for SandboxEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxEngine")
            .field("documents", &self.documents.len())
            .field("pages", &self.pages.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
