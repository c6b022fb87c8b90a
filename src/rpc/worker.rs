//! Executes requests against an engine, one at a time

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;

use flume::{Receiver, Sender};
use log::{debug, error, info, warn};
use serde::Serialize;

use super::message::{
    Attachment, Command, ErrorPayload, RenderedImage, Request, Response,
};
use crate::pdf::links::extract_links;
use crate::pdf::{DocumentSource, LayoutPolicy, PageText, PdfEngine, PdfError, PdfErrorCode};

/// What the worker reports to the router
#[derive(Debug)]
pub enum WorkerEvent {
    Ready,
    InitFailed(String),
    Response(Response),
}

type Output = (serde_json::Value, Vec<Vec<u8>>);

pub struct Worker<E: PdfEngine> {
    engine: E,
    layout: LayoutPolicy,
}

fn encode<T: Serialize>(value: &T) -> Result<serde_json::Value, PdfError> {
    serde_json::to_value(value).map_err(|e| PdfError::Protocol(e.to_string()))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Host path named by a plain path or a `file://` URL
fn url_to_path(url: &str) -> Result<PathBuf, PdfError> {
    if let Some(path) = url.strip_prefix("file://") {
        return Ok(PathBuf::from(path));
    }
    if let Some((scheme, _)) = url.split_once("://") {
        return Err(PdfError::open(
            PdfErrorCode::File,
            format!("unsupported URL scheme {scheme}"),
        ));
    }
    Ok(PathBuf::from(url))
}

impl<E: PdfEngine> Worker<E> {
    pub fn new(engine: E, layout: LayoutPolicy) -> Self {
        Self { engine, layout }
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    /// Run one request to completion; failures and panics become error responses.
    pub fn execute(&mut self, request: Request) -> Response {
        let Request {
            id,
            command,
            attachments,
        } = request;
        let name = command.name();
        debug!("{id} {name}");

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run(command, attachments)));
        match outcome {
            Ok(Ok((result, transfer))) => Response::success(id, result, transfer),
            Ok(Err(e)) => {
                warn!("{id} {name} failed: {e}");
                Response::failure(id, ErrorPayload::from(&e))
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!("{id} {name} panicked: {message}");
                Response::failure(id, ErrorPayload::new("panic", message))
            }
        }
    }

    fn run(&mut self, command: Command, attachments: Vec<Attachment>) -> Result<Output, PdfError> {
        let mut attachments = attachments.into_iter();
        match command {
            Command::LoadDocumentFromData { password } => {
                let data = attachments
                    .find_map(|a| match a {
                        Attachment::Bytes(bytes) => Some(bytes),
                        Attachment::Reader(_) => None,
                    })
                    .ok_or_else(|| PdfError::Protocol("missing document data".into()))?;
                let info = self
                    .engine
                    .open_document(DocumentSource::Data(data), password.as_deref())?;
                Ok((encode(&info)?, Vec::new()))
            }
            Command::LoadDocumentFromUrl { url, password } => {
                let path = url_to_path(&url)?;
                let info = self
                    .engine
                    .open_document(DocumentSource::Path(path), password.as_deref())?;
                Ok((encode(&info)?, Vec::new()))
            }
            Command::LoadDocumentFromReader { size, password } => {
                let reader = attachments
                    .find_map(|a| match a {
                        Attachment::Reader(reader) => Some(reader),
                        Attachment::Bytes(_) => None,
                    })
                    .ok_or_else(|| PdfError::Protocol("missing read function".into()))?;
                let info = self
                    .engine
                    .open_document(DocumentSource::Reader { size, reader }, password.as_deref())?;
                Ok((encode(&info)?, Vec::new()))
            }
            Command::CloseDocument { document } => {
                self.engine.close_document(document)?;
                Ok((serde_json::Value::Null, Vec::new()))
            }
            Command::LoadOutline { document } => {
                let outline = self.engine.load_outline(document)?;
                Ok((encode(&outline)?, Vec::new()))
            }
            Command::LoadPage { document, index } => {
                let page = self.engine.load_page(document, index)?;
                Ok((encode(&page)?, Vec::new()))
            }
            Command::ClosePage { page } => {
                self.engine.close_page(page)?;
                Ok((serde_json::Value::Null, Vec::new()))
            }
            Command::RenderPage { page, options } => {
                let bitmap = self.engine.render_page(page, &options)?;
                let image = RenderedImage {
                    width: bitmap.width,
                    height: bitmap.height,
                };
                Ok((encode(&image)?, vec![bitmap.pixels]))
            }
            Command::LoadText { page } => {
                let chars = self.engine.page_chars(page)?;
                let text = PageText::reconstruct(&chars, &self.layout);
                Ok((encode(&text)?, Vec::new()))
            }
            Command::LoadLinks { page } => {
                let sources = self.engine.page_link_sources(page)?;
                Ok((encode(&extract_links(&sources))?, Vec::new()))
            }
        }
    }
}

/// Worker thread body: build the engine, report readiness, then serve requests
/// until every sender is gone.
pub fn run_worker<E, F>(init: F, layout: LayoutPolicy, requests: Receiver<Request>, events: Sender<WorkerEvent>)
where
    E: PdfEngine,
    F: FnOnce() -> Result<E, PdfError>,
{
    let engine = match panic::catch_unwind(AssertUnwindSafe(init)) {
        Ok(Ok(engine)) => engine,
        Ok(Err(e)) => {
            error!("engine initialization failed: {e}");
            let _ = events.send(WorkerEvent::InitFailed(e.to_string()));
            return;
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!("engine initialization panicked: {message}");
            let _ = events.send(WorkerEvent::InitFailed(message));
            return;
        }
    };
    if events.send(WorkerEvent::Ready).is_err() {
        return;
    }
    info!("engine worker ready");

    let mut worker = Worker::new(engine, layout);
    for request in requests {
        let response = worker.execute(request);
        if events.send(WorkerEvent::Response(response)).is_err() {
            break;
        }
    }
    debug!("engine worker stopping");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdf::{DocumentHandle, DocumentInfo, RenderOptions};
    use crate::rpc::message::{Outcome, RequestId};
    use crate::testing::FakeEngine;

    fn request(id: u64, command: Command) -> Request {
        Request::new(RequestId(id), command)
    }

    #[test]
    fn url_forms() {
        assert_eq!(url_to_path("file:///tmp/a.pdf").unwrap(), PathBuf::from("/tmp/a.pdf"));
        assert_eq!(url_to_path("/tmp/b.pdf").unwrap(), PathBuf::from("/tmp/b.pdf"));
        assert!(url_to_path("https://example.com/c.pdf").is_err());
    }

    #[test]
    fn open_render_and_close() {
        let mut worker = Worker::new(FakeEngine::default(), LayoutPolicy::default());
        let opened = worker.execute(
            request(1, Command::LoadDocumentFromData { password: None })
                .with_attachment(Attachment::Bytes(b"%PDF-fake".to_vec())),
        );
        let info = opened.decode::<DocumentInfo>().unwrap().value;
        assert_eq!(info.page_count, 2);

        let page = worker
            .execute(request(2, Command::LoadPage {
                document: info.handle,
                index: 1,
            }))
            .decode::<crate::pdf::LoadedPage>()
            .unwrap()
            .value;

        let rendered = worker.execute(request(3, Command::RenderPage {
            page: page.handle,
            options: RenderOptions::full_page(4, 3),
        }));
        let reply = rendered.decode::<RenderedImage>().unwrap();
        assert_eq!(reply.value, RenderedImage { width: 4, height: 3 });
        assert_eq!(reply.transfer[0].len(), 4 * 3 * 4);

        let closed = worker.execute(request(4, Command::CloseDocument {
            document: info.handle,
        }));
        assert!(closed.is_success());
    }

    #[test]
    fn missing_attachment_is_an_error_response() {
        let mut worker = Worker::new(FakeEngine::default(), LayoutPolicy::default());
        let response = worker.execute(request(9, Command::LoadDocumentFromData { password: None }));
        assert_eq!(response.id, RequestId(9));
        match response.outcome {
            Outcome::Error { error } => assert_eq!(error.kind, "protocolError"),
            Outcome::Success { .. } => panic!("expected error"),
        }
    }

    #[test]
    fn engine_panic_is_contained() {
        let mut worker = Worker::new(FakeEngine::default(), LayoutPolicy::default());
        worker.engine_mut().panic_on_outline = true;
        let response = worker.execute(request(5, Command::LoadOutline {
            document: DocumentHandle(1),
        }));
        match response.outcome {
            Outcome::Error { error } => assert_eq!(error.kind, "panic"),
            Outcome::Success { .. } => panic!("expected error"),
        }
        // Worker keeps serving after the panic
        let again = worker.execute(request(6, Command::LoadDocumentFromUrl {
            url: "ftp://host/x.pdf".into(),
            password: None,
        }));
        assert!(!again.is_success());
    }

    #[test]
    fn load_text_reconstructs_layout() {
        let mut worker = Worker::new(FakeEngine::default(), LayoutPolicy::default());
        let info = worker
            .execute(
                request(1, Command::LoadDocumentFromData { password: None })
                    .with_attachment(Attachment::Bytes(vec![0])),
            )
            .decode::<DocumentInfo>()
            .unwrap()
            .value;
        let page = worker
            .execute(request(2, Command::LoadPage {
                document: info.handle,
                index: 0,
            }))
            .decode::<crate::pdf::LoadedPage>()
            .unwrap()
            .value;
        let text = worker
            .execute(request(3, Command::LoadText { page: page.handle }))
            .decode::<PageText>()
            .unwrap()
            .value;
        assert_eq!(text.full_text, "Hi yo");
        assert_eq!(text.fragments.iter().sum::<usize>(), 5);
    }
}
