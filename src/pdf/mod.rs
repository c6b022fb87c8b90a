//! PDF engine abstraction and the text/link passes built on it

mod engine;
mod error;
pub mod links;
pub mod outline;
pub mod text_layout;
mod types;

pub use engine::{DocumentSource, PdfEngine};
pub use error::{PdfError, PdfErrorCode};
pub use links::{DestCommand, LinkTarget, PdfDest, PdfLink};
pub use outline::OutlineNode;
pub use text_layout::{LayoutPolicy, PageText};
pub use types::*;
