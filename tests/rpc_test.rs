use std::sync::Arc;
use std::thread;
use std::time::Duration;

use pdfgate::bridge::PendingRead;
use pdfgate::pdf::{
    DestCommand, DocumentHandle, DocumentInfo, LayoutPolicy, LinkTarget, LoadedPage, OutlineNode,
    PageText, PdfError, PdfErrorCode, PdfLink, RenderOptions,
};
use pdfgate::rpc::{Attachment, Command, Dispatcher, Outcome, ProtocolError, RenderedImage};
use pdfgate::testing::FakeEngine;

const WAIT: Duration = Duration::from_secs(10);

fn dispatcher() -> Dispatcher {
    Dispatcher::spawn(|| Ok(FakeEngine::default()), LayoutPolicy::default()).unwrap()
}

fn open_bytes(dispatcher: &Dispatcher, bytes: &[u8], password: Option<&str>) -> Result<DocumentInfo, ProtocolError> {
    dispatcher
        .call::<DocumentInfo>(
            Command::LoadDocumentFromData {
                password: password.map(str::to_string),
            },
            vec![Attachment::Bytes(bytes.to_vec())],
        )
        .map(|reply| reply.value)
}

fn load_page(dispatcher: &Dispatcher, document: DocumentHandle, index: usize) -> LoadedPage {
    dispatcher
        .call::<LoadedPage>(Command::LoadPage { document, index }, vec![])
        .unwrap()
        .value
}

#[test]
fn test_requests_before_ready_are_replayed_in_order() {
    let dispatcher = Dispatcher::spawn(
        || {
            thread::sleep(Duration::from_millis(100));
            Ok(FakeEngine::default())
        },
        LayoutPolicy::default(),
    )
    .unwrap();

    // The worker assigns handle 1 to the first document; the page load only
    // succeeds if the open ran first.
    let open = dispatcher.submit(
        Command::LoadDocumentFromData { password: None },
        vec![Attachment::Bytes(b"%PDF-1.7".to_vec())],
    );
    let page = dispatcher.submit(
        Command::LoadPage {
            document: DocumentHandle(1),
            index: 1,
        },
        vec![],
    );
    let outline = dispatcher.submit(
        Command::LoadOutline {
            document: DocumentHandle(1),
        },
        vec![],
    );
    assert!(!dispatcher.is_ready());

    let info = open.wait_timeout(WAIT).unwrap().decode::<DocumentInfo>().unwrap().value;
    assert_eq!(info.handle, DocumentHandle(1));
    let page = page.wait_timeout(WAIT).unwrap().decode::<LoadedPage>().unwrap().value;
    assert_eq!(page.info.index, 1);
    let outline = outline
        .wait_timeout(WAIT)
        .unwrap()
        .decode::<Vec<OutlineNode>>()
        .unwrap()
        .value;
    assert_eq!(outline[0].title, "Chapter 1");
    assert!(dispatcher.is_ready());
    dispatcher.shutdown();
}

#[test]
fn test_init_failure_answers_every_request() {
    let dispatcher = Dispatcher::spawn(
        || -> Result<FakeEngine, PdfError> {
            thread::sleep(Duration::from_millis(20));
            Err(PdfError::Protocol("module missing".into()))
        },
        LayoutPolicy::default(),
    )
    .unwrap();

    let early = dispatcher.submit(Command::LoadOutline { document: DocumentHandle(1) }, vec![]);
    match early.wait_timeout(WAIT).unwrap().outcome {
        Outcome::Error { error } => {
            assert_eq!(error.kind, "initFailed");
            assert!(error.message.contains("module missing"));
        }
        Outcome::Success { .. } => panic!("expected failure"),
    }
    let late = open_bytes(&dispatcher, b"%PDF", None).unwrap_err();
    assert!(matches!(late, ProtocolError::Remote(ref p) if p.kind == "initFailed"));
}

#[test]
fn test_password_error_code_reaches_caller() {
    let dispatcher = dispatcher();
    let err = open_bytes(&dispatcher, b"locked pdf", None).unwrap_err();
    assert_eq!(err.code(), Some(PdfErrorCode::Password));

    let err = open_bytes(&dispatcher, b"", None).unwrap_err();
    assert_eq!(err.code(), Some(PdfErrorCode::Format));

    let info = open_bytes(&dispatcher, b"locked pdf", Some("secret")).unwrap();
    assert_eq!(info.page_count, 2);
}

#[test]
fn test_document_from_host_reader() {
    let dispatcher = dispatcher();
    let bytes = Arc::new(b"locked bytes of a document".to_vec());
    let source = Arc::clone(&bytes);
    let reader = move |request: PendingRead| {
        let source = Arc::clone(&source);
        thread::spawn(move || {
            let start = (request.position() as usize).min(source.len());
            let end = (start + request.len()).min(source.len());
            request.complete(&source[start..end]);
        });
    };

    let info = dispatcher
        .call::<DocumentInfo>(
            Command::LoadDocumentFromReader {
                size: bytes.len() as u64,
                password: Some("secret".into()),
            },
            vec![Attachment::Reader(Arc::new(reader))],
        )
        .unwrap()
        .value;
    assert_eq!(info.pages.len(), 2);
}

#[test]
fn test_concurrent_callers_get_their_own_replies() {
    let dispatcher = Arc::new(dispatcher());
    let info = open_bytes(&dispatcher, b"%PDF", None).unwrap();

    let handles: Vec<_> = (0..6)
        .map(|t| {
            let dispatcher = Arc::clone(&dispatcher);
            thread::spawn(move || {
                for i in 0..10 {
                    let width = 1 + t * 10 + i;
                    let page = load_page(&dispatcher, info.handle, (t + i) as usize % 2);
                    let reply = dispatcher
                        .call::<RenderedImage>(
                            Command::RenderPage {
                                page: page.handle,
                                options: RenderOptions::full_page(width, 2),
                            },
                            vec![],
                        )
                        .unwrap();
                    assert_eq!(reply.value.width, width);
                    assert_eq!(reply.transfer[0].len(), (width * 2 * 4) as usize);
                    dispatcher
                        .call::<()>(Command::ClosePage { page: page.handle }, vec![])
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_text_and_links_through_worker() {
    let dispatcher = dispatcher();
    let info = open_bytes(&dispatcher, b"%PDF", None).unwrap();
    let page = load_page(&dispatcher, info.handle, 0);

    let text = dispatcher
        .call::<PageText>(Command::LoadText { page: page.handle }, vec![])
        .unwrap()
        .value;
    assert_eq!(text.full_text, "Hi yo");
    assert_eq!(text.fragments, vec![2, 1, 2]);
    assert_eq!(text.char_rects.len(), 5);

    let links = dispatcher
        .call::<Vec<PdfLink>>(Command::LoadLinks { page: page.handle }, vec![])
        .unwrap()
        .value;
    assert_eq!(links.len(), 2);
    assert_eq!(links[0].target, LinkTarget::Url("https://example.com".into()));
    match &links[1].target {
        LinkTarget::Dest(dest) => {
            assert_eq!(dest.page_number, 2);
            assert_eq!(dest.command, DestCommand::Xyz);
        }
        LinkTarget::Url(url) => panic!("expected a destination, got {url}"),
    }
    // Annotation rectangles are normalized so top is above bottom
    assert!(links[1].rects[0].top > links[1].rects[0].bottom);
}

#[test]
fn test_dropped_reply_does_not_stall_others() {
    let dispatcher = dispatcher();
    let info = open_bytes(&dispatcher, b"%PDF", None).unwrap();
    drop(dispatcher.submit(Command::LoadOutline { document: info.handle }, vec![]));
    let page = load_page(&dispatcher, info.handle, 1);
    assert_eq!(page.info.index, 1);
}
