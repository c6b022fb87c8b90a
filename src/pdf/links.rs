//! Merges auto-detected web links and link annotations of a page

use serde::{Deserialize, Serialize};

use super::types::PdfRect;

/// View mode of an explicit destination (PDFium `PDFDEST_VIEW_*` codes 0..=8)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DestCommand {
    Unknown,
    Xyz,
    Fit,
    FitH,
    FitV,
    FitR,
    FitB,
    FitBH,
    FitBV,
}

impl DestCommand {
    #[must_use]
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Self::Xyz,
            2 => Self::Fit,
            3 => Self::FitH,
            4 => Self::FitV,
            5 => Self::FitR,
            6 => Self::FitB,
            7 => Self::FitBH,
            8 => Self::FitBV,
            _ => Self::Unknown,
        }
    }
}

/// Resolved in-document destination
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PdfDest {
    /// Target page (1-indexed)
    pub page_number: usize,
    pub command: DestCommand,
    pub params: Vec<f32>,
}

/// Destination as reported by the engine before resolution
#[derive(Clone, Debug, PartialEq)]
pub struct RawDest {
    /// 0-indexed; negative when the engine could not resolve the page
    pub page_index: i32,
    pub view: i32,
    pub params: Vec<f32>,
}

/// Action attached to an annotation or bookmark (PDFium `PDFACTION_*`)
#[derive(Clone, Debug, PartialEq)]
pub enum RawAction {
    GoTo(Option<RawDest>),
    RemoteGoTo,
    Uri(String),
    Launch,
    EmbeddedGoTo,
    Unsupported,
}

/// Link found by scanning the page text for URLs
#[derive(Clone, Debug, PartialEq)]
pub struct WebLink {
    pub url: String,
    pub rects: Vec<PdfRect>,
}

/// `/Link` annotation
#[derive(Clone, Debug, PartialEq)]
pub struct LinkAnnotation {
    pub rect: PdfRect,
    pub dest: Option<RawDest>,
    pub action: Option<RawAction>,
}

/// Everything the engine reports about links on one page
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LinkSources {
    pub web_links: Vec<WebLink>,
    pub annotations: Vec<LinkAnnotation>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LinkTarget {
    Dest(PdfDest),
    Url(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PdfLink {
    pub rects: Vec<PdfRect>,
    pub target: LinkTarget,
}

/// Decode a raw destination; `None` when its page is unresolved.
#[must_use]
pub fn decode_dest(raw: &RawDest) -> Option<PdfDest> {
    let index = usize::try_from(raw.page_index).ok()?;
    Some(PdfDest {
        page_number: index + 1,
        command: DestCommand::from_code(raw.view),
        params: raw.params.clone(),
    })
}

/// Internal destination of a link: the direct one, else a go-to action's.
#[must_use]
pub fn resolve_dest(dest: Option<&RawDest>, action: Option<&RawAction>) -> Option<PdfDest> {
    dest.and_then(decode_dest).or_else(|| match action {
        Some(RawAction::GoTo(Some(raw))) => decode_dest(raw),
        _ => None,
    })
}

fn resolve_annotation(annotation: &LinkAnnotation) -> Option<LinkTarget> {
    if let Some(dest) = resolve_dest(annotation.dest.as_ref(), annotation.action.as_ref()) {
        return Some(LinkTarget::Dest(dest));
    }
    match &annotation.action {
        Some(RawAction::Uri(uri)) if !uri.is_empty() => Some(LinkTarget::Url(uri.clone())),
        _ => None,
    }
}

/// Web links first, then annotation links; annotations with no usable target are dropped.
#[must_use]
pub fn extract_links(sources: &LinkSources) -> Vec<PdfLink> {
    let web = sources
        .web_links
        .iter()
        .filter(|link| !link.url.is_empty())
        .map(|link| PdfLink {
            rects: link.rects.iter().map(|r| r.normalized()).collect(),
            target: LinkTarget::Url(link.url.clone()),
        });

    let annotated = sources.annotations.iter().filter_map(|annotation| {
        resolve_annotation(annotation).map(|target| PdfLink {
            rects: vec![annotation.rect.normalized()],
            target,
        })
    });

    web.chain(annotated).collect()
}
