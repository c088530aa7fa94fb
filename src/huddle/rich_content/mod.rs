//! Rich text message content.
//!
//! Messages carry formatted text as an ordered list of blocks, each with inline
//! style spans. The stored form is the editor's "raw" JSON document (see
//! [`codec`]); it is opaque to storage and only decoded for display and search.

pub mod codec;

use serde::{Deserialize, Serialize};

pub use codec::{DecodeError, Decoded, decode, encode, try_decode};

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RichContent {
    pub blocks: Vec<TextBlock>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextBlock {
    pub text: String,
    pub kind: BlockKind,
    pub depth: u32,
    pub spans: Vec<InlineSpan>,
}

/// An inline style applied to part of a block.
///
/// `offset` and `length` count UTF-16 code units, like the stored format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineSpan {
    pub offset: usize,
    pub length: usize,
    pub style: InlineStyle,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum InlineStyle {
    Bold,
    Italic,
    Underline,
    Strikethrough,
    Code,
    Other(String),
}

impl InlineStyle {
    pub fn as_str(&self) -> &str {
        match self {
            InlineStyle::Bold => "BOLD",
            InlineStyle::Italic => "ITALIC",
            InlineStyle::Underline => "UNDERLINE",
            InlineStyle::Strikethrough => "STRIKETHROUGH",
            InlineStyle::Code => "CODE",
            InlineStyle::Other(name) => name,
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "BOLD" => InlineStyle::Bold,
            "ITALIC" => InlineStyle::Italic,
            "UNDERLINE" => InlineStyle::Underline,
            "STRIKETHROUGH" => InlineStyle::Strikethrough,
            "CODE" => InlineStyle::Code,
            other => InlineStyle::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockKind {
    #[default]
    Unstyled,
    HeaderOne,
    HeaderTwo,
    HeaderThree,
    Blockquote,
    CodeBlock,
    UnorderedListItem,
    OrderedListItem,
    Other(String),
}

impl BlockKind {
    pub fn as_str(&self) -> &str {
        match self {
            BlockKind::Unstyled => "unstyled",
            BlockKind::HeaderOne => "header-one",
            BlockKind::HeaderTwo => "header-two",
            BlockKind::HeaderThree => "header-three",
            BlockKind::Blockquote => "blockquote",
            BlockKind::CodeBlock => "code-block",
            BlockKind::UnorderedListItem => "unordered-list-item",
            BlockKind::OrderedListItem => "ordered-list-item",
            BlockKind::Other(name) => name,
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "unstyled" => BlockKind::Unstyled,
            "header-one" => BlockKind::HeaderOne,
            "header-two" => BlockKind::HeaderTwo,
            "header-three" => BlockKind::HeaderThree,
            "blockquote" => BlockKind::Blockquote,
            "code-block" => BlockKind::CodeBlock,
            "unordered-list-item" => BlockKind::UnorderedListItem,
            "ordered-list-item" => BlockKind::OrderedListItem,
            other => BlockKind::Other(other.to_string()),
        }
    }
}

/// A run of block text sharing one set of inline styles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StyledSegment {
    pub text: String,
    pub styles: Vec<InlineStyle>,
}

impl RichContent {
    pub fn new(blocks: Vec<TextBlock>) -> Self {
        Self { blocks }
    }

    /// Unstyled content, one block per line.
    pub fn plain(text: &str) -> Self {
        Self {
            blocks: text.split('\n').map(TextBlock::plain).collect(),
        }
    }

    /// True when no block holds anything but whitespace.
    pub fn is_blank(&self) -> bool {
        self.blocks.iter().all(|b| b.text.trim().is_empty())
    }

    /// Text as displayed, blocks separated by newlines.
    pub fn visible_text(&self) -> String {
        self.blocks
            .iter()
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Single-line summary for lists: the first block's text.
    pub fn preview(&self) -> &str {
        self.blocks.first().map(|b| b.text.as_str()).unwrap_or("")
    }
}

impl TextBlock {
    pub fn plain(text: &str) -> Self {
        Self {
            text: text.to_string(),
            kind: BlockKind::Unstyled,
            depth: 0,
            spans: Vec::new(),
        }
    }

    pub fn with_kind(mut self, kind: BlockKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_span(mut self, style: InlineStyle, offset: usize, length: usize) -> Self {
        self.spans.push(InlineSpan {
            offset,
            length,
            style,
        });
        self
    }

    /// Splits the text into runs with uniform styling. Spans reaching past the end
    /// of the text are clipped; empty runs are skipped.
    pub fn segments(&self) -> Vec<StyledSegment> {
        let total: usize = self.text.encode_utf16().count();
        let mut bounds = vec![0, total];
        for span in &self.spans {
            bounds.push(span.offset.min(total));
            bounds.push(span.offset.saturating_add(span.length).min(total));
        }
        bounds.sort_unstable();
        bounds.dedup();

        let mut segments = Vec::new();
        for window in bounds.windows(2) {
            let (start, end) = (window[0], window[1]);
            let text = &self.text[byte_index(&self.text, start)..byte_index(&self.text, end)];
            if text.is_empty() {
                continue;
            }
            let mut styles: Vec<InlineStyle> = self
                .spans
                .iter()
                .filter(|s| s.offset <= start && s.offset.saturating_add(s.length) >= end)
                .map(|s| s.style.clone())
                .collect();
            styles.sort();
            styles.dedup();
            segments.push(StyledSegment {
                text: text.to_string(),
                styles,
            });
        }
        segments
    }
}

/// Byte index of the char containing UTF-16 unit `offset`, rounded up to a char
/// boundary when the offset falls inside a surrogate pair.
fn byte_index(text: &str, offset: usize) -> usize {
    let mut units = 0;
    for (idx, ch) in text.char_indices() {
        if units >= offset {
            return idx;
        }
        units += ch.len_utf16();
    }
    text.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_splits_lines_into_blocks() {
        let content = RichContent::plain("first\nsecond");
        assert_eq!(content.blocks.len(), 2);
        assert_eq!(content.visible_text(), "first\nsecond");
        assert_eq!(content.preview(), "first");
    }

    #[test]
    fn blank_content_detection() {
        assert!(RichContent::plain("  \n\t").is_blank());
        assert!(RichContent::default().is_blank());
        // Text in a later block still counts as content.
        assert!(!RichContent::plain("\nhello").is_blank());
    }

    #[test]
    fn segments_split_on_span_boundaries() {
        let block = TextBlock::plain("Hello bold world")
            .with_span(InlineStyle::Bold, 6, 4)
            .with_span(InlineStyle::Italic, 6, 10);
        let segments = block.segments();
        assert_eq!(
            segments,
            vec![
                StyledSegment {
                    text: "Hello ".to_string(),
                    styles: vec![]
                },
                StyledSegment {
                    text: "bold".to_string(),
                    styles: vec![InlineStyle::Bold, InlineStyle::Italic]
                },
                StyledSegment {
                    text: " world".to_string(),
                    styles: vec![InlineStyle::Italic]
                },
            ]
        );
    }

    #[test]
    fn segments_use_utf16_offsets() {
        // "👋" is two UTF-16 units.
        let block = TextBlock::plain("👋 hi").with_span(InlineStyle::Bold, 3, 2);
        let segments = block.segments();
        assert_eq!(segments.last().unwrap().text, "hi");
        assert_eq!(segments.last().unwrap().styles, vec![InlineStyle::Bold]);
        let joined: String = segments.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(joined, "👋 hi");
    }

    #[test]
    fn out_of_range_spans_are_clipped() {
        let block = TextBlock::plain("abc").with_span(InlineStyle::Code, 1, 100);
        let segments = block.segments();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[1].text, "bc");

        let block = TextBlock::plain("abc").with_span(InlineStyle::Code, 50, 2);
        assert_eq!(block.segments().len(), 1);
    }

    #[test]
    fn style_and_kind_names_round_trip() {
        for style in [
            InlineStyle::Bold,
            InlineStyle::Italic,
            InlineStyle::Underline,
            InlineStyle::Strikethrough,
            InlineStyle::Code,
            InlineStyle::Other("HIGHLIGHT".to_string()),
        ] {
            assert_eq!(InlineStyle::from_name(style.as_str()), style);
        }
        for kind in [
            BlockKind::Unstyled,
            BlockKind::HeaderOne,
            BlockKind::Blockquote,
            BlockKind::CodeBlock,
            BlockKind::UnorderedListItem,
            BlockKind::OrderedListItem,
            BlockKind::Other("atomic".to_string()),
        ] {
            assert_eq!(BlockKind::from_name(kind.as_str()), kind);
        }
    }
}
