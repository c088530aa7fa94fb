//! Encoding and decoding of stored rich content.
//!
//! The stored form is the rich-text editor's raw document:
//!
//! ```json
//! {"blocks":[{"key":"00000","text":"Hi","type":"unstyled","depth":0,
//!   "inlineStyleRanges":[{"offset":0,"length":2,"style":"BOLD"}],
//!   "entityRanges":[],"data":{}}],"entityMap":{}}
//! ```
//!
//! Older messages may hold bare text instead. Decoding never fails: anything that
//! is not a raw document comes back as [`Decoded::Fallback`] with the input as
//! plain text.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{BlockKind, InlineSpan, InlineStyle, RichContent, TextBlock};

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Malformed rich content payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Result of decoding a stored payload. Callers must handle both cases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Content(RichContent),
    /// The payload was not a structured document; holds the raw string.
    Fallback(String),
}

impl Decoded {
    pub fn visible_text(&self) -> String {
        match self {
            Decoded::Content(content) => content.visible_text(),
            Decoded::Fallback(raw) => raw.clone(),
        }
    }

    pub fn preview(&self) -> &str {
        match self {
            Decoded::Content(content) => content.preview(),
            Decoded::Fallback(raw) => raw,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Decoded::Fallback(_))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RawDocument {
    blocks: Vec<RawBlock>,
    #[serde(rename = "entityMap", default)]
    entity_map: serde_json::Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBlock {
    #[serde(default)]
    key: String,
    text: String,
    #[serde(rename = "type", default = "default_block_type")]
    block_type: String,
    #[serde(default)]
    depth: u32,
    #[serde(default)]
    inline_style_ranges: Vec<RawStyleRange>,
    #[serde(default)]
    entity_ranges: Vec<Value>,
    #[serde(default)]
    data: serde_json::Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawStyleRange {
    offset: usize,
    length: usize,
    style: String,
}

fn default_block_type() -> String {
    BlockKind::Unstyled.as_str().to_string()
}

/// Block keys only need to be unique within one document.
fn block_key(index: usize) -> String {
    format!("{:05x}", index)
}

pub fn encode(content: &RichContent) -> Result<String, serde_json::Error> {
    let raw = RawDocument {
        blocks: content
            .blocks
            .iter()
            .enumerate()
            .map(|(index, block)| RawBlock {
                key: block_key(index),
                text: block.text.clone(),
                block_type: block.kind.as_str().to_string(),
                depth: block.depth,
                inline_style_ranges: block
                    .spans
                    .iter()
                    .map(|span| RawStyleRange {
                        offset: span.offset,
                        length: span.length,
                        style: span.style.as_str().to_string(),
                    })
                    .collect(),
                entity_ranges: Vec::new(),
                data: serde_json::Map::new(),
            })
            .collect(),
        entity_map: serde_json::Map::new(),
    };
    serde_json::to_string(&raw)
}

/// Strict decoding. Most callers want [`decode`].
pub fn try_decode(payload: &str) -> Result<RichContent, DecodeError> {
    let raw: RawDocument = serde_json::from_str(payload)?;
    Ok(RichContent {
        blocks: raw
            .blocks
            .into_iter()
            .map(|block| TextBlock {
                text: block.text,
                kind: BlockKind::from_name(&block.block_type),
                depth: block.depth,
                spans: block
                    .inline_style_ranges
                    .into_iter()
                    .map(|range| InlineSpan {
                        offset: range.offset,
                        length: range.length,
                        style: InlineStyle::from_name(&range.style),
                    })
                    .collect(),
            })
            .collect(),
    })
}

pub fn decode(payload: &str) -> Decoded {
    match try_decode(payload) {
        Ok(content) => Decoded::Content(content),
        Err(e) => {
            tracing::debug!(
                target: "huddle::rich_content::decode",
                "Treating payload as plain text: {}",
                e
            );
            Decoded::Fallback(payload.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn formatted() -> RichContent {
        RichContent::new(vec![
            TextBlock::plain("Meeting notes")
                .with_kind(BlockKind::HeaderOne)
                .with_span(InlineStyle::Bold, 0, 7),
            TextBlock::plain("ship it 🚀")
                .with_kind(BlockKind::UnorderedListItem)
                .with_span(InlineStyle::Italic, 5, 2)
                .with_span(InlineStyle::Other("HIGHLIGHT".to_string()), 0, 4),
            TextBlock::plain(""),
        ])
    }

    #[test]
    fn decode_of_encode_preserves_text_and_formatting() {
        let content = formatted();
        let encoded = encode(&content).unwrap();
        assert_eq!(decode(&encoded), Decoded::Content(content.clone()));
        assert_eq!(decode(&encoded).visible_text(), content.visible_text());
    }

    #[test]
    fn encoded_form_matches_editor_raw_layout() {
        let encoded = encode(&RichContent::new(vec![
            TextBlock::plain("Hi").with_span(InlineStyle::Bold, 0, 2),
        ]))
        .unwrap();
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(
            value,
            json!({
                "blocks": [{
                    "key": "00000",
                    "text": "Hi",
                    "type": "unstyled",
                    "depth": 0,
                    "inlineStyleRanges": [{"offset": 0, "length": 2, "style": "BOLD"}],
                    "entityRanges": [],
                    "data": {}
                }],
                "entityMap": {}
            })
        );
    }

    #[test]
    fn decodes_editor_payload_with_entities() {
        let payload = r#"{"blocks":[{"key":"3k9f1","text":"see link","type":"unstyled","depth":0,
            "inlineStyleRanges":[],"entityRanges":[{"offset":4,"length":4,"key":0}],"data":{}}],
            "entityMap":{"0":{"type":"LINK","mutability":"MUTABLE","data":{"url":"https://x"}}}}"#;
        let decoded = decode(payload);
        assert!(!decoded.is_fallback());
        assert_eq!(decoded.visible_text(), "see link");
    }

    #[test]
    fn minimal_blocks_use_defaults() {
        let decoded = try_decode(r#"{"blocks":[{"text":"bare"}]}"#).unwrap();
        assert_eq!(decoded.blocks[0].kind, BlockKind::Unstyled);
        assert_eq!(decoded.blocks[0].depth, 0);
        assert!(decoded.blocks[0].spans.is_empty());
    }

    #[test]
    fn malformed_payloads_fall_back_to_plain_text() {
        for raw in [
            "Hello there",
            "",
            "{not json",
            "{\"blocks\": 5}",
            "[1,2,3]",
            "\"quoted\"",
            "{\"entityMap\":{}}",
        ] {
            let decoded = decode(raw);
            assert_eq!(decoded, Decoded::Fallback(raw.to_string()), "payload {raw:?}");
            assert_eq!(decoded.visible_text(), raw);
        }
    }

    #[test]
    fn try_decode_reports_malformed_payload() {
        assert!(matches!(
            try_decode("plain"),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn preview_uses_first_block() {
        let encoded = encode(&RichContent::plain("line one\nline two")).unwrap();
        assert_eq!(decode(&encoded).preview(), "line one");
        assert_eq!(decode("legacy text").preview(), "legacy text");
    }
}
