// Token value normalization

/// Number of leading characters kept by [`redact`]
const REDACT_VISIBLE_CHARS: usize = 8;

/// Normalize a token value as it comes out of a file, env var or clipboard.
///
/// Strips surrounding whitespace (including a UTF-8 BOM), line breaks anywhere
/// in the value, and matching surrounding quotes. Bearer tokens never contain
/// whitespace or line breaks, so a well-formed token passes through unchanged.
/// The function is idempotent.
pub fn sanitize(raw: &str) -> String {
    let joined: String = raw.chars().filter(|c| *c != '\n' && *c != '\r').collect();

    let mut current = joined.as_str();
    loop {
        let trimmed = current.trim_matches(|c: char| c.is_whitespace() || c == '\u{feff}');
        let unquoted = strip_quotes(trimmed).unwrap_or(trimmed);
        if unquoted.len() == current.len() {
            break;
        }
        current = unquoted;
    }

    current.to_string()
}

/// Shorten a token for log output
pub fn redact(token: &str) -> String {
    let visible: String = token.chars().take(REDACT_VISIBLE_CHARS).collect();
    if visible.len() == token.len() {
        // Short values are not worth partially hiding
        "***".to_string()
    } else {
        format!("{}...", visible)
    }
}

fn strip_quotes(s: &str) -> Option<&str> {
    ['"', '\''].iter().find_map(|q| {
        s.strip_prefix(*q)
            .and_then(|rest| rest.strip_suffix(*q))
    })
}
