use std::sync::Arc;
use std::thread;

use pdfgate::bridge::PendingRead;
use pdfgate::pdf::links::extract_links;
use pdfgate::pdf::{
    DestCommand, DocumentHandle, DocumentSource, LayoutPolicy, LinkTarget, PageHandle, PageText,
    PdfEngine, PdfError, PdfErrorCode, RenderOptions,
};
use pdfgate::sandbox::{GrowthPolicy, SandboxConfig, SandboxEngine, SandboxRuntime};

/// Stand-in for the PDFium build: documents must start with `%`, every
/// document has two pages (the second rotated and blank), bitmaps pad each
/// row by 8 bytes, the fill writes the color as a little-endian word and
/// rendering writes `[x, y, flags, 255]` into every pixel.
const FAKE_PDFIUM: &str = r#"
(module
  (import "env" "__syscall_openat" (func $openat (param i32 i32 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_read" (func $fd_read (param i32 i32 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_close" (func $fd_close (param i32) (result i32)))
  (memory (export "memory") 2)
  (data (i32.const 96) "Hi!")
  (data (i32.const 128) "https://example.org\00")
  (data (i32.const 160) "I\00n\00t\00r\00o\00\00\00")
  (global $heap (mut i32) (i32.const 4096))
  (global $error (mut i32) (i32.const 0))
  (global $open_docs (mut i32) (i32.const 0))
  (global $live_bitmaps (mut i32) (i32.const 0))
  (global $bw (mut i32) (i32.const 0))
  (global $bh (mut i32) (i32.const 0))
  (global $bbuf (mut i32) (i32.const 0))

  (func $malloc (export "malloc") (param $n i32) (result i32)
    (local $p i32)
    (local.set $p (global.get $heap))
    (global.set $heap
      (i32.and (i32.add (i32.add (global.get $heap) (local.get $n)) (i32.const 7)) (i32.const -8)))
    (local.get $p))
  (func (export "free") (param i32))

  (func $copy (param $dst i32) (param $src i32) (param $n i32)
    (local $i i32)
    (block $done
      (loop $next
        (br_if $done (i32.ge_u (local.get $i) (local.get $n)))
        (i32.store8 (i32.add (local.get $dst) (local.get $i))
          (i32.load8_u (i32.add (local.get $src) (local.get $i))))
        (local.set $i (i32.add (local.get $i) (i32.const 1)))
        (br $next))))

  (func $opened (result i32)
    (global.set $open_docs (i32.add (global.get $open_docs) (i32.const 1)))
    (i32.const 1000))
  (func $reject (param $code i32) (result i32)
    (global.set $error (local.get $code))
    (i32.const 0))

  (func (export "FPDF_InitLibrary"))
  (func (export "FPDF_DestroyLibrary"))
  (func (export "FPDF_GetLastError") (result i32) (global.get $error))
  (func (export "open_documents") (result i32) (global.get $open_docs))
  (func (export "live_bitmaps") (result i32) (global.get $live_bitmaps))

  (func (export "FPDF_LoadMemDocument") (param $data i32) (param $len i32) (param $pw i32) (result i32)
    (if (i32.eqz (local.get $len)) (then (return (call $reject (i32.const 3)))))
    (if (i32.ne (i32.load8_u (local.get $data)) (i32.const 37))
      (then (return (call $reject (i32.const 3)))))
    ;; "%!" opens a document whose page count traps
    (if (i32.and (i32.gt_u (local.get $len) (i32.const 1))
          (i32.eq (i32.load8_u offset=1 (local.get $data)) (i32.const 33)))
      (then (drop (call $opened)) (return (i32.const 1001))))
    (call $opened))

  (func (export "FPDF_LoadDocument") (param $path i32) (param $pw i32) (result i32)
    (local $fd i32)
    (local.set $fd (call $openat (i32.const -100) (local.get $path) (i32.const 0) (i32.const 0)))
    (if (i32.lt_s (local.get $fd) (i32.const 0)) (then (return (call $reject (i32.const 2)))))
    (i32.store8 (i32.const 64) (i32.const 0))
    (i32.store (i32.const 0) (i32.const 64))
    (i32.store (i32.const 4) (i32.const 1))
    (drop (call $fd_read (local.get $fd) (i32.const 0) (i32.const 1) (i32.const 8)))
    (drop (call $fd_close (local.get $fd)))
    (if (i32.ne (i32.load8_u (i32.const 64)) (i32.const 37))
      (then (return (call $reject (i32.const 3)))))
    (call $opened))

  (func (export "FPDF_CloseDocument") (param i32)
    (global.set $open_docs (i32.sub (global.get $open_docs) (i32.const 1))))
  (func (export "FPDF_GetPageCount") (param $doc i32) (result i32)
    (if (i32.eq (local.get $doc) (i32.const 1001)) (then unreachable))
    (i32.const 2))
  (func (export "FPDF_GetDocPermissions") (param i32) (result i32) (i32.const -4))
  (func (export "FPDF_GetSecurityHandlerRevision") (param i32) (result i32) (i32.const -1))

  (func (export "FPDF_LoadPage") (param $doc i32) (param $index i32) (result i32)
    (if (result i32) (i32.lt_u (local.get $index) (i32.const 2))
      (then (i32.add (i32.const 100) (local.get $index)))
      (else (i32.const 0))))
  (func (export "FPDF_ClosePage") (param i32))
  (func (export "FPDF_GetPageWidth") (param i32) (result f64) (f64.const 612))
  (func (export "FPDF_GetPageHeight") (param i32) (result f64) (f64.const 792))
  (func (export "FPDFPage_GetRotation") (param $page i32) (result i32)
    (i32.sub (local.get $page) (i32.const 100)))

  (func $stride (result i32)
    (i32.add (i32.mul (global.get $bw) (i32.const 4)) (i32.const 8)))
  (func (export "FPDFBitmap_CreateEx")
    (param $w i32) (param $h i32) (param $format i32) (param $buf i32) (param $stride i32) (result i32)
    (global.set $bw (local.get $w))
    (global.set $bh (local.get $h))
    (global.set $bbuf (call $malloc (i32.mul (call $stride) (local.get $h))))
    (global.set $live_bitmaps (i32.add (global.get $live_bitmaps) (i32.const 1)))
    (i32.const 1))
  (func (export "FPDFBitmap_FillRect")
    (param $bmp i32) (param $l i32) (param $t i32) (param $w i32) (param $h i32) (param $color i32)
    (result i32)
    (local $x i32) (local $y i32)
    (block $rows_done
      (loop $rows
        (br_if $rows_done (i32.ge_u (local.get $y) (global.get $bh)))
        (local.set $x (i32.const 0))
        (block $cols_done
          (loop $cols
            (br_if $cols_done (i32.ge_u (local.get $x) (global.get $bw)))
            (i32.store
              (i32.add (global.get $bbuf)
                (i32.add (i32.mul (local.get $y) (call $stride))
                  (i32.mul (local.get $x) (i32.const 4))))
              (local.get $color))
            (local.set $x (i32.add (local.get $x) (i32.const 1)))
            (br $cols)))
        (local.set $y (i32.add (local.get $y) (i32.const 1)))
        (br $rows)))
    (i32.const 1))
  (func (export "FPDFBitmap_GetBuffer") (param i32) (result i32) (global.get $bbuf))
  (func (export "FPDFBitmap_GetStride") (param i32) (result i32) (call $stride))
  (func (export "FPDFBitmap_Destroy") (param i32)
    (global.set $live_bitmaps (i32.sub (global.get $live_bitmaps) (i32.const 1))))

  (func (export "FPDF_RenderPageBitmap")
    (param $bmp i32) (param $page i32) (param $sx i32) (param $sy i32)
    (param $fw i32) (param $fh i32) (param $rotate i32) (param $flags i32)
    (local $x i32) (local $y i32) (local $p i32)
    ;; the second page is blank
    (if (i32.eq (local.get $page) (i32.const 101)) (then (return)))
    (block $rows_done
      (loop $rows
        (br_if $rows_done (i32.ge_u (local.get $y) (global.get $bh)))
        (local.set $x (i32.const 0))
        (block $cols_done
          (loop $cols
            (br_if $cols_done (i32.ge_u (local.get $x) (global.get $bw)))
            (local.set $p
              (i32.add (global.get $bbuf)
                (i32.add (i32.mul (local.get $y) (call $stride))
                  (i32.mul (local.get $x) (i32.const 4)))))
            (i32.store8 (local.get $p) (local.get $x))
            (i32.store8 (i32.add (local.get $p) (i32.const 1)) (local.get $y))
            (i32.store8 (i32.add (local.get $p) (i32.const 2)) (local.get $flags))
            (i32.store8 (i32.add (local.get $p) (i32.const 3)) (i32.const 255))
            (local.set $x (i32.add (local.get $x) (i32.const 1)))
            (br $cols)))
        (local.set $y (i32.add (local.get $y) (i32.const 1)))
        (br $rows))))

  (func (export "FPDFText_LoadPage") (param i32) (result i32) (i32.const 7))
  (func (export "FPDFText_ClosePage") (param i32))
  (func (export "FPDFText_CountChars") (param i32) (result i32) (i32.const 3))
  (func (export "FPDFText_GetUnicode") (param $tp i32) (param $i i32) (result i32)
    (i32.load8_u (i32.add (i32.const 96) (local.get $i))))
  (func (export "FPDFText_GetCharBox")
    (param $tp i32) (param $i i32) (param $l i32) (param $r i32) (param $b i32) (param $t i32)
    (result i32)
    (f64.store (local.get $l) (f64.convert_i32_s (i32.mul (local.get $i) (i32.const 10))))
    (f64.store (local.get $r)
      (f64.convert_i32_s (i32.add (i32.mul (local.get $i) (i32.const 10)) (i32.const 8))))
    (f64.store (local.get $b) (f64.const 700))
    (f64.store (local.get $t) (f64.const 710))
    (i32.const 1))

  (func (export "FPDFLink_LoadWebLinks") (param i32) (result i32) (i32.const 0))
  (func (export "FPDFPage_GetAnnotCount") (param i32) (result i32) (i32.const 1))
  (func (export "FPDFPage_GetAnnot") (param i32) (param i32) (result i32) (i32.const 55))
  (func (export "FPDFPage_CloseAnnot") (param i32))
  (func (export "FPDFAnnot_GetSubtype") (param i32) (result i32) (i32.const 2))
  (func (export "FPDFAnnot_GetRect") (param $annot i32) (param $rect i32) (result i32)
    (f32.store (local.get $rect) (f32.const 10))
    (f32.store offset=4 (local.get $rect) (f32.const 100))
    (f32.store offset=8 (local.get $rect) (f32.const 50))
    (f32.store offset=12 (local.get $rect) (f32.const 120))
    (i32.const 1))
  (func (export "FPDFAnnot_GetLink") (param i32) (result i32) (i32.const 66))
  (func (export "FPDFLink_GetDest") (param i32) (param i32) (result i32) (i32.const 0))
  (func (export "FPDFLink_GetAction") (param i32) (result i32) (i32.const 77))
  (func (export "FPDFAction_GetType") (param i32) (result i32) (i32.const 3))
  (func (export "FPDFAction_GetURIPath")
    (param $doc i32) (param $action i32) (param $buf i32) (param $len i32) (result i32)
    (if (i32.and (i32.ne (local.get $buf) (i32.const 0)) (i32.ge_u (local.get $len) (i32.const 20)))
      (then (call $copy (local.get $buf) (i32.const 128) (i32.const 20))))
    (i32.const 20))

  (func (export "FPDFBookmark_GetFirstChild") (param $doc i32) (param $parent i32) (result i32)
    (if (result i32) (i32.eqz (local.get $parent)) (then (i32.const 500)) (else (i32.const 0))))
  (func (export "FPDFBookmark_GetNextSibling") (param i32) (param i32) (result i32) (i32.const 0))
  (func (export "FPDFBookmark_GetTitle") (param $bm i32) (param $buf i32) (param $len i32) (result i32)
    (if (i32.and (i32.ne (local.get $buf) (i32.const 0)) (i32.ge_u (local.get $len) (i32.const 12)))
      (then (call $copy (local.get $buf) (i32.const 160) (i32.const 12))))
    (i32.const 12))
  (func (export "FPDFBookmark_GetDest") (param i32) (param i32) (result i32) (i32.const 600))
  (func (export "FPDFBookmark_GetAction") (param i32) (result i32) (i32.const 0))
  (func (export "FPDFDest_GetDestPageIndex") (param i32) (param i32) (result i32) (i32.const 1))
  (func (export "FPDFDest_GetView") (param $dest i32) (param $count i32) (param $params i32) (result i32)
    (i32.store (local.get $count) (i32.const 2))
    (f32.store (local.get $params) (f32.const 0))
    (f32.store offset=4 (local.get $params) (f32.const 792))
    (i32.const 1))
)
"#;

fn engine_with(config: SandboxConfig) -> SandboxEngine {
    let wasm = wasmer::wat2wasm(FAKE_PDFIUM.as_bytes()).unwrap();
    let runtime = SandboxRuntime::new(&wasm, GrowthPolicy::default()).unwrap();
    SandboxEngine::new(runtime, config).unwrap()
}

fn engine() -> SandboxEngine {
    engine_with(SandboxConfig::default())
}

fn open_documents(engine: &mut SandboxEngine) -> i32 {
    engine.runtime_mut().call_i32("open_documents", &[]).unwrap()
}

fn first_page(engine: &mut SandboxEngine) -> (DocumentHandle, PageHandle) {
    let info = engine
        .open_document(DocumentSource::Data(b"%PDF-1.7".to_vec()), None)
        .unwrap();
    let page = engine.load_page(info.handle, 0).unwrap();
    (info.handle, page.handle)
}

#[test]
fn test_open_from_memory_describes_pages() {
    let mut engine = engine();
    let info = engine
        .open_document(DocumentSource::Data(b"%PDF-1.7 tiny".to_vec()), Some("pw"))
        .unwrap();
    assert_eq!(info.page_count, 2);
    assert_eq!(info.permissions, 0xFFFF_FFFC);
    assert_eq!(info.security_handler_revision, -1);
    assert_eq!(info.pages[0].width, 612.0);
    assert_eq!(info.pages[1].height, 792.0);
    assert_eq!(info.pages[1].rotation, 1);

    engine.close_document(info.handle).unwrap();
    assert_eq!(open_documents(&mut engine), 0);
    assert!(matches!(
        engine.close_document(info.handle),
        Err(PdfError::UnknownHandle { kind: "document", .. })
    ));
}

#[test]
fn test_rejected_bytes_report_library_error() {
    let mut engine = engine();
    match engine.open_document(DocumentSource::Data(b"garbage".to_vec()), None) {
        Err(PdfError::OpenFailure { code, .. }) => assert_eq!(code, PdfErrorCode::Format),
        other => panic!("expected format error, got {other:?}"),
    }
    assert_eq!(open_documents(&mut engine), 0);
}

#[test]
fn test_failure_after_open_closes_the_document() {
    let mut engine = engine();
    let err = engine
        .open_document(DocumentSource::Data(b"%!broken".to_vec()), None)
        .unwrap_err();
    assert!(matches!(err, PdfError::Sandbox(_)), "got {err:?}");
    assert_eq!(open_documents(&mut engine), 0);

    // The engine stays usable
    let info = engine
        .open_document(DocumentSource::Data(b"%PDF-1.7".to_vec()), None)
        .unwrap();
    assert_eq!(info.page_count, 2);
}

#[test]
fn test_large_document_goes_through_virtual_file() {
    let mut engine = engine_with(SandboxConfig {
        large_document_threshold: 4,
        ..SandboxConfig::default()
    });
    let info = engine
        .open_document(DocumentSource::Data(b"%PDF-large enough".to_vec()), None)
        .unwrap();
    assert!(engine.runtime().vfs().contains("/pdfgate/doc-1.pdf"));

    engine.close_document(info.handle).unwrap();
    assert!(!engine.runtime().vfs().contains("/pdfgate/doc-1.pdf"));

    // A rejected document does not leave its name behind
    let err = engine
        .open_document(DocumentSource::Data(b"not a pdf at all".to_vec()), None)
        .unwrap_err();
    assert_eq!(err.code(), Some(PdfErrorCode::Format));
    assert!(!engine.runtime().vfs().contains("/pdfgate/doc-2.pdf"));
}

#[test]
fn test_open_from_host_path() {
    let mut engine = engine();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("doc.pdf");
    std::fs::write(&path, b"%PDF-1.4 on disk").unwrap();

    let info = engine.open_document(DocumentSource::Path(path), None).unwrap();
    assert_eq!(info.page_count, 2);

    let missing = engine
        .open_document(DocumentSource::Path(dir.path().join("missing.pdf")), None)
        .unwrap_err();
    assert_eq!(missing.code(), Some(PdfErrorCode::File));
}

#[test]
fn test_open_from_host_reader() {
    let mut engine = engine();
    let bytes = Arc::new(b"%PDF-1.5 streamed".to_vec());
    let source = Arc::clone(&bytes);
    let reader = move |request: PendingRead| {
        let source = Arc::clone(&source);
        thread::spawn(move || {
            let start = (request.position() as usize).min(source.len());
            let end = (start + request.len()).min(source.len());
            request.complete(&source[start..end]);
        });
    };
    let info = engine
        .open_document(
            DocumentSource::Reader {
                size: bytes.len() as u64,
                reader: Arc::new(reader),
            },
            None,
        )
        .unwrap();
    assert_eq!(info.pages.len(), 2);
}

#[test]
fn test_render_unpacks_padded_rows() {
    let mut engine = engine();
    let (_, page) = first_page(&mut engine);

    let bitmap = engine
        .render_page(page, &RenderOptions::full_page(3, 2))
        .unwrap();
    assert_eq!(bitmap.pixels.len(), 3 * 2 * 4);
    for y in 0..2u8 {
        for x in 0..3u8 {
            let at = (usize::from(y) * 3 + usize::from(x)) * 4;
            assert_eq!(&bitmap.pixels[at..at + 4], &[x, y, 0x11, 255]);
        }
    }

    let plain = RenderOptions {
        annotations: false,
        ..RenderOptions::full_page(1, 1)
    };
    assert_eq!(engine.render_page(page, &plain).unwrap().pixels[2], 0x10);
    assert_eq!(engine.runtime_mut().call_i32("live_bitmaps", &[]).unwrap(), 0);

    assert!(matches!(
        engine.render_page(page, &RenderOptions::full_page(0, 5)),
        Err(PdfError::RenderFailure(_))
    ));
}

#[test]
fn test_background_comes_back_as_rgba() {
    let mut engine = engine();
    let info = engine
        .open_document(DocumentSource::Data(b"%PDF-1.7".to_vec()), None)
        .unwrap();
    let blank = engine.load_page(info.handle, 1).unwrap();

    let red = RenderOptions {
        background: 0xFFFF_0000,
        ..RenderOptions::full_page(2, 2)
    };
    let bitmap = engine.render_page(blank.handle, &red).unwrap();
    for pixel in bitmap.pixels.chunks(4) {
        assert_eq!(pixel, &[255, 0, 0, 255]);
    }
}

#[test]
fn test_chars_feed_text_layout() {
    let mut engine = engine();
    let (_, page) = first_page(&mut engine);
    let chars = engine.page_chars(page).unwrap();
    assert_eq!(chars.len(), 3);
    assert_eq!(chars[1].char(), 'i');
    assert_eq!(chars[1].rect.left, 10.0);
    assert_eq!(chars[1].rect.top, 710.0);

    let text = PageText::reconstruct(&chars, &LayoutPolicy::default());
    assert_eq!(text.full_text, "Hi!");
}

#[test]
fn test_link_annotation_with_uri_action() {
    let mut engine = engine();
    let (_, page) = first_page(&mut engine);
    let sources = engine.page_link_sources(page).unwrap();
    assert!(sources.web_links.is_empty());

    let links = extract_links(&sources);
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].target, LinkTarget::Url("https://example.org".into()));
    assert_eq!(links[0].rects[0].top, 120.0);
    assert_eq!(links[0].rects[0].bottom, 100.0);
}

#[test]
fn test_outline_with_destination() {
    let mut engine = engine();
    let (document, _) = first_page(&mut engine);
    let outline = engine.load_outline(document).unwrap();
    assert_eq!(outline.len(), 1);
    assert_eq!(outline[0].title, "Intro");
    let dest = outline[0].dest.as_ref().unwrap();
    assert_eq!(dest.page_number, 2);
    assert_eq!(dest.command, DestCommand::Xyz);
    assert_eq!(dest.params, vec![0.0, 792.0]);
}

#[test]
fn test_pages_close_with_their_document() {
    let mut engine = engine();
    let (document, page) = first_page(&mut engine);
    assert!(matches!(
        engine.load_page(document, 5),
        Err(PdfError::PageLoadFailure { index: 5 })
    ));
    engine.close_document(document).unwrap();
    assert!(matches!(
        engine.close_page(page),
        Err(PdfError::UnknownHandle { kind: "page", .. })
    ));
}
