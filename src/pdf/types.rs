//! Core types shared by the engine, the worker protocol and the text/link passes

use serde::{Deserialize, Serialize};

/// Rectangle in PDF page coordinates (origin bottom-left, so `top >= bottom`)
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PdfRect {
    pub left: f64,
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
}

impl PdfRect {
    #[must_use]
    pub const fn new(left: f64, top: f64, right: f64, bottom: f64) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// Same area with `left <= right` and `top >= bottom`, whatever order it was authored in
    #[must_use]
    pub fn normalized(self) -> Self {
        Self {
            left: self.left.min(self.right),
            top: self.top.max(self.bottom),
            right: self.left.max(self.right),
            bottom: self.top.min(self.bottom),
        }
    }

    #[must_use]
    pub fn width(&self) -> f64 {
        self.right - self.left
    }

    #[must_use]
    pub fn height(&self) -> f64 {
        self.top - self.bottom
    }

    /// Smallest rectangle covering both (both assumed normalized)
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        Self {
            left: self.left.min(other.left),
            top: self.top.max(other.top),
            right: self.right.max(other.right),
            bottom: self.bottom.min(other.bottom),
        }
    }
}

/// Opaque id of an open document, unique per engine
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentHandle(pub u64);

/// Opaque id of a loaded page, unique per engine
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageHandle(pub u64);

/// Page geometry, in PDF units
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    /// Page index (0-indexed)
    pub index: usize,
    pub width: f64,
    pub height: f64,
    /// Clockwise quarter turns (0..=3)
    pub rotation: i32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentInfo {
    pub handle: DocumentHandle,
    pub page_count: usize,
    pub permissions: u32,
    pub security_handler_revision: i32,
    pub pages: Vec<PageInfo>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadedPage {
    pub handle: PageHandle,
    #[serde(flatten)]
    pub info: PageInfo,
}

/// One enumerated character and its box, in the engine's enumeration order
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CharGeometry {
    pub codepoint: u32,
    pub rect: PdfRect,
}

impl CharGeometry {
    #[must_use]
    pub fn new(ch: char, rect: PdfRect) -> Self {
        Self {
            codepoint: ch as u32,
            rect,
        }
    }

    /// Decoded character; invalid code points become U+FFFD
    #[must_use]
    pub fn char(&self) -> char {
        char::from_u32(self.codepoint).unwrap_or(char::REPLACEMENT_CHARACTER)
    }
}

/// Portion of a page to rasterize.
///
/// The page is scaled to `full_width` x `full_height` pixels and the
/// `width` x `height` window at (`x`, `y`) of that image is returned.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderOptions {
    #[serde(default)]
    pub x: i32,
    #[serde(default)]
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub full_width: f64,
    pub full_height: f64,
    /// ARGB fill applied before drawing
    #[serde(default = "default_background")]
    pub background: u32,
    #[serde(default = "default_true")]
    pub annotations: bool,
}

fn default_background() -> u32 {
    0xFFFF_FFFF
}

fn default_true() -> bool {
    true
}

impl RenderOptions {
    /// Whole page at `width` x `height` pixels
    #[must_use]
    pub fn full_page(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
            full_width: f64::from(width),
            full_height: f64::from(height),
            background: default_background(),
            annotations: true,
        }
    }

    /// Whole page at `scale` pixels per PDF unit.
    ///
    /// The engine already reports width and height after the page's
    /// `/Rotate`, so they are used as they are.
    #[must_use]
    pub fn scaled(page: &PageInfo, scale: f64) -> Self {
        let width = (page.width * scale).round().max(1.0) as u32;
        let height = (page.height * scale).round().max(1.0) as u32;
        Self::full_page(width, height)
    }
}

/// Rasterized page region, RGBA8, rows tightly packed
#[derive(Clone, PartialEq)]
pub struct RenderedBitmap {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl std::fmt::Debug for RenderedBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderedBitmap")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("pixels.len", &self.pixels.len())
            .finish()
    }
}
