//! Rebuilds lines and words from the per-character stream of a page.
//!
//! The engine enumerates characters with their boxes but carries no line,
//! paragraph or column structure. Lines are recovered from explicit breaks
//! and from geometry: a character that starts left of its predecessor, or
//! drops by more than [`LayoutPolicy::column_gap`], starts a new line. Each
//! finished line is flattened so every member shares the line's vertical
//! extent and spaces tile the gap between their neighbours.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use super::types::{CharGeometry, PdfRect};

/// Thresholds for implicit line/column breaks
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutPolicy {
    /// Vertical distance between consecutive baselines that starts a new line (PDF units)
    pub column_gap: f64,
    /// Start a new line when a character begins left of its predecessor
    pub break_on_horizontal_regression: bool,
}

impl Default for LayoutPolicy {
    fn default() -> Self {
        Self {
            column_gap: 72.0,
            break_on_horizontal_regression: true,
        }
    }
}

/// Text of one page with a rectangle per character
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageText {
    pub full_text: String,
    /// One rectangle per `char` of `full_text`
    pub char_rects: Vec<PdfRect>,
    /// Lengths (in chars) of consecutive word/space/break runs; they sum to the text length
    pub fragments: Vec<usize>,
}

impl PageText {
    /// Rebuild text and geometry from the engine's character stream.
    #[must_use]
    pub fn reconstruct(chars: &[CharGeometry], policy: &LayoutPolicy) -> Self {
        let mut builder = Builder::new(policy);
        for (i, record) in chars.iter().enumerate() {
            let ch = record.char();
            if ch == '\r' && chars.get(i + 1).is_some_and(|next| next.char() == '\n') {
                continue;
            }
            builder.push(ch, record.rect.normalized());
        }
        builder.finish()
    }

    #[must_use]
    pub fn char_count(&self) -> usize {
        self.char_rects.len()
    }

    /// Substring by char range
    #[must_use]
    pub fn slice(&self, range: Range<usize>) -> String {
        self.full_text
            .chars()
            .skip(range.start)
            .take(range.end.saturating_sub(range.start))
            .collect()
    }

    /// One rectangle per line covering the characters of `range`, for highlighting.
    #[must_use]
    pub fn highlight_rects(&self, range: Range<usize>) -> Vec<PdfRect> {
        let end = range.end.min(self.char_rects.len());
        let mut out: Vec<PdfRect> = Vec::new();
        for (ch, rect) in self
            .full_text
            .chars()
            .zip(&self.char_rects)
            .take(end)
            .skip(range.start)
        {
            if ch == '\r' || ch == '\n' {
                continue;
            }
            match out.last_mut() {
                Some(last) if same_line(last, rect) => *last = last.union(rect),
                _ => out.push(*rect),
            }
        }
        out
    }

    /// Char ranges of every non-overlapping occurrence of `needle`.
    #[must_use]
    pub fn find(&self, needle: &str) -> Vec<Range<usize>> {
        self.find_by(needle, |a, b| a == b)
    }

    /// Like [`find`](Self::find), ignoring case.
    #[must_use]
    pub fn find_ignore_case(&self, needle: &str) -> Vec<Range<usize>> {
        self.find_by(needle, |a, b| {
            a == b || a.to_lowercase().eq(b.to_lowercase())
        })
    }

    fn find_by(&self, needle: &str, eq: impl Fn(char, char) -> bool) -> Vec<Range<usize>> {
        let needle: Vec<char> = needle.chars().collect();
        let hay: Vec<char> = self.full_text.chars().collect();
        let mut matches = Vec::new();
        if needle.is_empty() || needle.len() > hay.len() {
            return matches;
        }
        let mut start = 0;
        while start + needle.len() <= hay.len() {
            let hit = hay[start..start + needle.len()]
                .iter()
                .zip(&needle)
                .all(|(&a, &b)| eq(a, b));
            if hit {
                matches.push(start..start + needle.len());
                start += needle.len();
            } else {
                start += 1;
            }
        }
        matches
    }
}

fn same_line(a: &PdfRect, b: &PdfRect) -> bool {
    a.top == b.top && a.bottom == b.bottom
}

struct Builder<'p> {
    policy: &'p LayoutPolicy,
    text: Vec<char>,
    rects: Vec<PdfRect>,
    fragments: Vec<usize>,
    line_start: usize,
    word_start: usize,
    last: Option<char>,
}

impl<'p> Builder<'p> {
    fn new(policy: &'p LayoutPolicy) -> Self {
        Self {
            policy,
            text: Vec::new(),
            rects: Vec::new(),
            fragments: Vec::new(),
            line_start: 0,
            word_start: 0,
            last: None,
        }
    }

    fn push(&mut self, ch: char, rect: PdfRect) {
        match ch {
            '\r' | '\n' => self.explicit_break(),
            ' ' => {
                if self.last == Some(' ') {
                    return;
                }
                self.close_fragment();
                self.append(' ', rect);
                self.fragments.push(1);
                self.word_start = self.text.len();
            }
            _ => {
                if self.text.len() > self.line_start && self.breaks_line(&rect) {
                    self.flatten_line();
                    self.close_fragment();
                    self.start_line();
                }
                self.append(ch, rect);
            }
        }
        self.last = Some(ch);
    }

    fn breaks_line(&self, rect: &PdfRect) -> bool {
        let Some(prev) = self.rects.last() else {
            return false;
        };
        (self.policy.break_on_horizontal_regression && prev.left > rect.left)
            || (prev.bottom - rect.bottom).abs() > self.policy.column_gap
    }

    fn explicit_break(&mut self) {
        if self.text.len() == self.line_start {
            return;
        }
        let bounds = self.flatten_line();
        self.close_fragment();
        if let Some(bounds) = bounds {
            let marker = PdfRect::new(bounds.right, bounds.top, bounds.right, bounds.bottom);
            self.append('\r', marker);
            self.append('\n', marker);
            self.fragments.push(2);
        }
        self.start_line();
    }

    fn append(&mut self, ch: char, rect: PdfRect) {
        self.text.push(ch);
        self.rects.push(rect);
    }

    fn close_fragment(&mut self) {
        let len = self.text.len();
        if len > self.word_start {
            self.fragments.push(len - self.word_start);
        }
        self.word_start = len;
    }

    fn start_line(&mut self) {
        self.line_start = self.text.len();
        self.word_start = self.line_start;
    }

    /// Give the current line a common top/bottom and tile spaces between neighbours.
    fn flatten_line(&mut self) -> Option<PdfRect> {
        let (start, end) = (self.line_start, self.text.len());
        if start >= end {
            return None;
        }
        let bounds = self.rects[start + 1..end]
            .iter()
            .fold(self.rects[start], |acc, r| acc.union(r));

        for i in start..end {
            let own = self.rects[i];
            let (mut left, mut right) = (own.left, own.right);
            if self.text[i] == ' ' {
                if i > start {
                    left = self.rects[i - 1].right;
                }
                if i + 1 < end {
                    right = self.rects[i + 1].left;
                }
                if left > right {
                    (left, right) = (own.left, own.right);
                }
            }
            self.rects[i] = PdfRect::new(left.min(right), bounds.top, left.max(right), bounds.bottom);
        }
        Some(bounds)
    }

    fn finish(mut self) -> PageText {
        self.flatten_line();
        self.close_fragment();
        PageText {
            full_text: self.text.into_iter().collect(),
            char_rects: self.rects,
            fragments: self.fragments,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn glyph(ch: char, left: f64, bottom: f64) -> CharGeometry {
        CharGeometry::new(ch, PdfRect::new(left, bottom + 10.0, left + 6.0, bottom))
    }

    fn line(text: &str, x: f64, bottom: f64) -> Vec<CharGeometry> {
        text.chars()
            .enumerate()
            .map(|(i, c)| glyph(c, x + i as f64 * 7.0, bottom))
            .collect()
    }

    #[test]
    fn crlf_example() {
        let mut chars = line("AB", 0.0, 700.0);
        chars.push(glyph('\r', 14.0, 700.0));
        chars.push(glyph('\n', 14.0, 700.0));
        chars.extend(line("C", 0.0, 686.0));

        let text = PageText::reconstruct(&chars, &LayoutPolicy::default());
        assert_eq!(text.full_text, "AB\r\nC");
        assert_eq!(text.fragments, vec![2, 2, 1]);
        assert_eq!(text.char_rects.len(), 5);
        // Placeholders sit at the right edge of the line with zero width.
        assert_eq!(text.char_rects[2].width(), 0.0);
        assert_eq!(text.char_rects[2].left, 13.0);
    }

    #[test]
    fn double_space_is_dropped() {
        let chars = line("a  b", 0.0, 500.0);
        let text = PageText::reconstruct(&chars, &LayoutPolicy::default());
        assert_eq!(text.full_text, "a b");
        assert_eq!(text.fragments, vec![1, 1, 1]);
    }

    #[test]
    fn spaces_tile_between_neighbours() {
        let chars = vec![
            glyph('a', 0.0, 500.0),
            CharGeometry::new(' ', PdfRect::new(8.0, 505.0, 9.0, 500.0)),
            glyph('b', 12.0, 500.0),
        ];
        let text = PageText::reconstruct(&chars, &LayoutPolicy::default());
        assert_eq!(text.char_rects[1].left, 6.0);
        assert_eq!(text.char_rects[1].right, 12.0);
        // Whole line shares the tallest extent.
        assert!(text.char_rects.iter().all(|r| r.top == 510.0 && r.bottom == 500.0));
    }

    #[test]
    fn horizontal_regression_starts_new_line() {
        let mut chars = line("ab", 100.0, 500.0);
        chars.extend(line("cd", 0.0, 488.0));
        let text = PageText::reconstruct(&chars, &LayoutPolicy::default());
        assert_eq!(text.full_text, "abcd");
        assert_eq!(text.fragments, vec![2, 2]);
        assert_ne!(text.char_rects[1].bottom, text.char_rects[2].bottom);
    }

    #[test]
    fn regression_rule_can_be_disabled() {
        let mut chars = line("ab", 100.0, 500.0);
        chars.extend(line("cd", 0.0, 500.0));
        let policy = LayoutPolicy {
            break_on_horizontal_regression: false,
            ..LayoutPolicy::default()
        };
        let text = PageText::reconstruct(&chars, &policy);
        assert_eq!(text.fragments, vec![4]);
    }

    #[test]
    fn large_vertical_gap_starts_new_line() {
        let mut chars = line("ab", 0.0, 700.0);
        chars.extend(line("cd", 20.0, 600.0));
        let text = PageText::reconstruct(&chars, &LayoutPolicy::default());
        assert_eq!(text.fragments, vec![2, 2]);

        let tight = LayoutPolicy {
            column_gap: 200.0,
            ..LayoutPolicy::default()
        };
        let text = PageText::reconstruct(&chars, &tight);
        assert_eq!(text.fragments, vec![4]);
    }

    #[test]
    fn break_on_empty_line_is_ignored() {
        let mut chars = vec![glyph('\n', 0.0, 0.0), glyph('\n', 0.0, 0.0)];
        chars.extend(line("x", 0.0, 100.0));
        let text = PageText::reconstruct(&chars, &LayoutPolicy::default());
        assert_eq!(text.full_text, "x");
        assert_eq!(text.fragments, vec![1]);
    }

    #[test]
    fn highlight_merges_per_line() {
        let mut chars = line("hello", 0.0, 700.0);
        chars.push(glyph('\n', 35.0, 700.0));
        chars.extend(line("world", 0.0, 680.0));
        let text = PageText::reconstruct(&chars, &LayoutPolicy::default());

        let hits = text.find("lo\r\nwo");
        assert_eq!(hits, vec![3..9]);
        let rects = text.highlight_rects(hits[0].clone());
        assert_eq!(rects.len(), 2);
        assert_eq!(rects[0].left, 21.0);
        assert_eq!(rects[1].right, 13.0);
    }

    #[test]
    fn find_ignoring_case() {
        let chars = line("Rust rust", 0.0, 100.0);
        let text = PageText::reconstruct(&chars, &LayoutPolicy::default());
        assert_eq!(text.find("rust"), vec![5..9]);
        assert_eq!(text.find_ignore_case("RUST"), vec![0..4, 5..9]);
        assert_eq!(text.slice(5..9), "rust");
    }
}
