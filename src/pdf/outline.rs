//! Document outline (bookmarks) structures

use serde::{Deserialize, Serialize};

use super::links::{PdfDest, RawAction, RawDest, resolve_dest};

/// Bookmark as walked from the engine
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawBookmark {
    pub title: String,
    pub dest: Option<RawDest>,
    pub action: Option<RawAction>,
    pub children: Vec<RawBookmark>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutlineNode {
    pub title: String,
    pub dest: Option<PdfDest>,
    pub children: Vec<OutlineNode>,
}

impl OutlineNode {
    #[must_use]
    pub fn from_raw(raw: &RawBookmark) -> Self {
        Self {
            title: raw.title.trim().to_string(),
            dest: resolve_dest(raw.dest.as_ref(), raw.action.as_ref()),
            children: raw.children.iter().map(Self::from_raw).collect(),
        }
    }
}

/// Flattened outline entry
#[derive(Clone, Debug, PartialEq)]
pub struct OutlineEntry<'a> {
    /// Nesting level (0 = top level)
    pub level: usize,
    pub node: &'a OutlineNode,
}

/// Depth-first listing of the outline with nesting levels.
#[must_use]
pub fn flatten_outline(nodes: &[OutlineNode]) -> Vec<OutlineEntry<'_>> {
    let mut entries = Vec::new();
    flatten_into(nodes, 0, &mut entries);
    entries
}

fn flatten_into<'a>(nodes: &'a [OutlineNode], level: usize, entries: &mut Vec<OutlineEntry<'a>>) {
    for node in nodes {
        entries.push(OutlineEntry { level, node });
        if !node.children.is_empty() {
            flatten_into(&node.children, level + 1, entries);
        }
    }
}
