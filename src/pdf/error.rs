//! Engine error taxonomy

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sandbox::SandboxError;

/// `FPDF_GetLastError` codes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PdfErrorCode {
    Success,
    Unknown,
    File,
    Format,
    Password,
    Security,
    Page,
}

impl PdfErrorCode {
    #[must_use]
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Success,
            2 => Self::File,
            3 => Self::Format,
            4 => Self::Password,
            5 => Self::Security,
            6 => Self::Page,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Unknown => "unknown error",
            Self::File => "file not found or could not be opened",
            Self::Format => "not a PDF or corrupted",
            Self::Password => "password required or incorrect",
            Self::Security => "unsupported security scheme",
            Self::Page => "page not found or content error",
        }
    }
}

impl std::fmt::Display for PdfErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum PdfError {
    #[error("cannot open document: {code} ({reason})")]
    OpenFailure { code: PdfErrorCode, reason: String },

    #[error("cannot load page {index}")]
    PageLoadFailure { index: usize },

    #[error("render failed: {0}")]
    RenderFailure(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("engine called unsupported function {0}")]
    SyscallUnsupported(String),

    #[error("unknown {kind} handle {handle}")]
    UnknownHandle { kind: &'static str, handle: u64 },

    #[error("sandbox: {0}")]
    Sandbox(SandboxError),
}

impl PdfError {
    pub fn open(code: PdfErrorCode, reason: impl Into<String>) -> Self {
        Self::OpenFailure {
            code,
            reason: reason.into(),
        }
    }

    /// Stable machine-readable name for error payloads
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::OpenFailure { .. } => "openFailure",
            Self::PageLoadFailure { .. } => "pageLoadFailure",
            Self::RenderFailure(_) => "renderFailure",
            Self::Protocol(_) => "protocolError",
            Self::SyscallUnsupported(_) => "syscallUnsupported",
            Self::UnknownHandle { .. } => "unknownHandle",
            Self::Sandbox(_) => "sandbox",
        }
    }

    #[must_use]
    pub fn code(&self) -> Option<PdfErrorCode> {
        match self {
            Self::OpenFailure { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<SandboxError> for PdfError {
    fn from(e: SandboxError) -> Self {
        match e {
            SandboxError::SyscallUnsupported(name) => Self::SyscallUnsupported(name),
            other => Self::Sandbox(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_error_codes() {
        assert_eq!(PdfErrorCode::from_code(4), PdfErrorCode::Password);
        assert_eq!(PdfErrorCode::from_code(3), PdfErrorCode::Format);
        assert_eq!(PdfErrorCode::from_code(42), PdfErrorCode::Unknown);
    }

    #[test]
    fn unsupported_syscall_is_lifted() {
        let e = PdfError::from(SandboxError::SyscallUnsupported("env.fork".into()));
        assert_eq!(e.kind(), "syscallUnsupported");
        assert!(e.to_string().contains("env.fork"));
    }
}
