//! Request/response envelope exchanged with the engine worker

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bridge::ReadBlock;
use crate::pdf::{DocumentHandle, PageHandle, PdfError, PdfErrorCode, RenderOptions};

/// Correlates a response with its request; unique among in-flight requests
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "command",
    content = "parameters",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum Command {
    /// Document bytes travel as the first [`Attachment::Bytes`]
    LoadDocumentFromData { password: Option<String> },
    /// Host path or `file://` URL
    LoadDocumentFromUrl { url: String, password: Option<String> },
    /// Reads go through the first [`Attachment::Reader`]
    LoadDocumentFromReader { size: u64, password: Option<String> },
    CloseDocument { document: DocumentHandle },
    LoadOutline { document: DocumentHandle },
    LoadPage { document: DocumentHandle, index: usize },
    ClosePage { page: PageHandle },
    RenderPage { page: PageHandle, options: RenderOptions },
    LoadText { page: PageHandle },
    LoadLinks { page: PageHandle },
}

impl Command {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::LoadDocumentFromData { .. } => "loadDocumentFromData",
            Self::LoadDocumentFromUrl { .. } => "loadDocumentFromUrl",
            Self::LoadDocumentFromReader { .. } => "loadDocumentFromReader",
            Self::CloseDocument { .. } => "closeDocument",
            Self::LoadOutline { .. } => "loadOutline",
            Self::LoadPage { .. } => "loadPage",
            Self::ClosePage { .. } => "closePage",
            Self::RenderPage { .. } => "renderPage",
            Self::LoadText { .. } => "loadText",
            Self::LoadLinks { .. } => "loadLinks",
        }
    }
}

/// Non-serializable payload moved alongside a request
pub enum Attachment {
    Bytes(Vec<u8>),
    Reader(Arc<dyn ReadBlock>),
}

impl std::fmt::Debug for Attachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Self::Reader(_) => f.write_str("Reader"),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Request {
    pub id: RequestId,
    #[serde(flatten)]
    pub command: Command,
    #[serde(skip)]
    pub attachments: Vec<Attachment>,
}

impl Request {
    #[must_use]
    pub fn new(id: RequestId, command: Command) -> Self {
        Self {
            id,
            command,
            attachments: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }
}

/// Error description carried by an error-status response
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub code: Option<PdfErrorCode>,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            code: None,
            message: message.into(),
        }
    }
}

impl From<&PdfError> for ErrorPayload {
    fn from(e: &PdfError) -> Self {
        Self {
            kind: e.kind().to_string(),
            code: e.code(),
            message: e.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum Outcome {
    Success { result: serde_json::Value },
    Error { error: ErrorPayload },
}

#[derive(Debug, Serialize)]
pub struct Response {
    pub id: RequestId,
    #[serde(flatten)]
    pub outcome: Outcome,
    /// Binary buffers handed over by ownership (rendered pixels)
    #[serde(skip)]
    pub transfer: Vec<Vec<u8>>,
}

impl Response {
    #[must_use]
    pub fn success(id: RequestId, result: serde_json::Value, transfer: Vec<Vec<u8>>) -> Self {
        Self {
            id,
            outcome: Outcome::Success { result },
            transfer,
        }
    }

    #[must_use]
    pub fn failure(id: RequestId, error: ErrorPayload) -> Self {
        Self {
            id,
            outcome: Outcome::Error { error },
            transfer: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success { .. })
    }

    /// Decode the result payload, or surface the remote error.
    pub fn decode<T: DeserializeOwned>(self) -> Result<Reply<T>, ProtocolError> {
        match self.outcome {
            Outcome::Success { result } => Ok(Reply {
                value: serde_json::from_value(result)?,
                transfer: self.transfer,
            }),
            Outcome::Error { error } => Err(ProtocolError::Remote(error)),
        }
    }
}

/// Decoded successful response
#[derive(Debug)]
pub struct Reply<T> {
    pub value: T,
    pub transfer: Vec<Vec<u8>>,
}

/// Result payload of `renderPage`; pixels are `transfer[0]`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedImage {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("{} ({})", .0.message, .0.kind)]
    Remote(ErrorPayload),
    #[error("worker is gone")]
    WorkerGone,
    #[error("timed out waiting for reply")]
    Timeout,
    #[error("malformed payload: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ProtocolError {
    /// Library error code when the remote side reported one
    #[must_use]
    pub fn code(&self) -> Option<PdfErrorCode> {
        match self {
            Self::Remote(payload) => payload.code,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_envelope_shape() {
        let request = Request::new(
            RequestId(7),
            Command::LoadPage {
                document: DocumentHandle(3),
                index: 2,
            },
        )
        .with_attachment(Attachment::Bytes(vec![1, 2, 3]));
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({"id": 7, "command": "loadPage", "parameters": {"document": 3, "index": 2}})
        );
        assert_eq!(request.command.name(), "loadPage");
    }

    #[test]
    fn error_response_carries_code() {
        let e = PdfError::open(PdfErrorCode::Password, "wrong password");
        let response = Response::failure(RequestId(1), ErrorPayload::from(&e));
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["error"]["code"], "password");
        assert_eq!(value["error"]["kind"], "openFailure");

        let err = response.decode::<serde_json::Value>().unwrap_err();
        assert_eq!(err.code(), Some(PdfErrorCode::Password));
    }

    #[test]
    fn success_decodes_with_transfer() {
        let response = Response::success(
            RequestId(2),
            json!({"width": 2, "height": 1}),
            vec![vec![0; 8]],
        );
        assert!(response.is_success());
        let reply = response.decode::<RenderedImage>().unwrap();
        assert_eq!(reply.value, RenderedImage { width: 2, height: 1 });
        assert_eq!(reply.transfer[0].len(), 8);
    }
}
