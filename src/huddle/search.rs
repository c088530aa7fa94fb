use crate::huddle::messages::Message;

/// Filters `messages` down to those whose decoded text contains `query`,
/// ignoring case. Messages without text never match.
///
/// An empty or whitespace-only query is not a search: every message is returned.
pub fn search<'a>(query: &str, messages: &'a [Message]) -> Vec<&'a Message> {
    if query.trim().is_empty() {
        return messages.iter().collect();
    }

    let needle = query.to_lowercase();
    messages
        .iter()
        .filter(|message| {
            message
                .content()
                .is_some_and(|content| content.visible_text().to_lowercase().contains(&needle))
        })
        .collect()
}
