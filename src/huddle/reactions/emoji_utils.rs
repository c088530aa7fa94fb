use crate::huddle::error::{HuddleError, Result};

const MAX_REACTION_BYTES: usize = 50;
const KEYCAP: char = '\u{20E3}';

/// Validates reaction content, mapping the `+`/`-` shorthands to thumbs up/down.
pub fn validate_reaction(content: &str) -> Result<String> {
    match content {
        "+" => Ok("👍".to_string()),
        "-" => Ok("👎".to_string()),
        emoji if is_valid_emoji(emoji) => Ok(emoji.to_string()),
        _ => {
            tracing::warn!(
                target: "huddle::reactions",
                "Invalid reaction content: {}",
                content
            );
            Err(HuddleError::Validation(format!(
                "invalid reaction: {:?}",
                content
            )))
        }
    }
}

/// Checks if a string is a valid emoji or emoji sequence.
///
/// Every character must be a pictograph or part of an emoji sequence (variation
/// selectors, skin tones, joiners, tags, keycaps). Text with an emoji in it is
/// rejected.
pub fn is_valid_emoji(s: &str) -> bool {
    if s.is_empty() || s.len() > MAX_REACTION_BYTES {
        return false;
    }

    let keycap = s.contains(KEYCAP);
    let mut has_base = false;
    for ch in s.chars() {
        if is_emoji_char(ch) || (keycap && is_keycap_base(ch)) {
            has_base = true;
        } else if !is_sequence_char(ch) {
            return false;
        }
    }
    has_base
}

/// Checks if a character is in emoji unicode ranges
fn is_emoji_char(ch: char) -> bool {
    let code = ch as u32;

    matches!(code,
        0x1F000..=0x1FAFF | // Mahjong through Symbols and Pictographs Extended-A
        0x2600..=0x26FF |   // Misc symbols
        0x2700..=0x27BF |   // Dingbats
        0x2300..=0x23FF |   // Misc technical (⌛, ⏰)
        0x2B00..=0x2BFF |   // Misc symbols and arrows (⭐, ⬆)
        0x2190..=0x21FF |   // Arrows
        0x25A0..=0x25FF |   // Geometric shapes
        0x2934 | 0x2935 |
        0x203C | 0x2049 |   // ‼ ⁉
        0x2122 | 0x2139 |
        0x24C2 |
        0x3030 | 0x303D | 0x3297 | 0x3299 |
        0x00A9 | 0x00AE
    )
}

/// Characters that only modify or join the pictographs around them.
fn is_sequence_char(ch: char) -> bool {
    matches!(ch as u32,
        0xFE00..=0xFE0F |   // Variation selectors
        0x200D |            // Zero width joiner
        0x20E3 |            // Combining enclosing keycap
        0xE0020..=0xE007F   // Tags (subdivision flags)
    )
}

fn is_keycap_base(ch: char) -> bool {
    ch.is_ascii_digit() || ch == '#' || ch == '*'
}
