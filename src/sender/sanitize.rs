// ============================================================================
// Input Sanitization & Secret Redaction
// ============================================================================
//
// Everything here runs before a single byte leaves the process:
// - instance keys and phones are validated against strict charsets
// - message content is length-capped and stripped of script injection
// - error text is scrubbed of bearer tokens, api keys and passwords
//   before it can reach a log line or a database row
//
// ============================================================================

use crate::config::{MAX_MESSAGE_LENGTH, MAX_PHONE_DIGITS, MIN_PHONE_DIGITS};
use crate::error::{DispatchError, DispatchResult};

/// Instance keys may only contain ASCII alphanumerics, `_` and `-`.
pub fn validate_instance_key(key: &str) -> DispatchResult<()> {
    if key.is_empty() {
        return Err(DispatchError::validation("instance key is empty"));
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(DispatchError::validation(
            "instance key contains invalid characters",
        ));
    }
    Ok(())
}

/// Phones reaching the adapter must already be digits-only, 10-15 long.
pub fn validate_phone(phone: &str) -> DispatchResult<()> {
    if phone.is_empty() || !phone.chars().all(|c| c.is_ascii_digit()) {
        return Err(DispatchError::validation("phone must be digits only"));
    }
    if phone.len() < MIN_PHONE_DIGITS || phone.len() > MAX_PHONE_DIGITS {
        return Err(DispatchError::validation(format!(
            "phone must be {}-{} digits, got {}",
            MIN_PHONE_DIGITS,
            MAX_PHONE_DIGITS,
            phone.len()
        )));
    }
    Ok(())
}

/// Length-check and strip script/iframe blocks and `javascript:` schemes
/// from outgoing content.
pub fn sanitize_content(content: &str) -> DispatchResult<String> {
    if content.is_empty() {
        return Err(DispatchError::validation("message content is empty"));
    }
    if content.chars().count() > MAX_MESSAGE_LENGTH {
        return Err(DispatchError::validation(format!(
            "message content exceeds {} characters",
            MAX_MESSAGE_LENGTH
        )));
    }

    let mut cleaned = strip_tag_block(content, "script");
    cleaned = strip_tag_block(&cleaned, "iframe");
    cleaned = remove_pattern(&cleaned, "javascript:");
    Ok(cleaned)
}

/// Case-insensitive search for an ASCII pattern. Byte positions are safe
/// to slice at: a window matching an ASCII needle starts and ends on
/// character boundaries.
fn find_ascii_ci(haystack: &str, needle: &str) -> Option<usize> {
    let haystack = haystack.as_bytes();
    let needle = needle.as_bytes();
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle))
}

/// Remove `<tag ...>...</tag>` blocks (and any dangling open tag).
fn strip_tag_block(input: &str, tag: &str) -> String {
    let open = format!("<{}", tag);
    let close = format!("</{}>", tag);
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    loop {
        match find_ascii_ci(rest, &open) {
            None => {
                out.push_str(rest);
                return out;
            }
            Some(start) => {
                out.push_str(&rest[..start]);
                match find_ascii_ci(&rest[start..], &close) {
                    Some(rel_end) => {
                        rest = &rest[start + rel_end + close.len()..];
                    }
                    None => {
                        // Open tag without a close: drop the remainder.
                        return out;
                    }
                }
            }
        }
    }
}

fn remove_pattern(input: &str, pattern: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(idx) = find_ascii_ci(rest, pattern) {
        out.push_str(&rest[..idx]);
        rest = &rest[idx + pattern.len()..];
    }
    out.push_str(rest);
    out
}

const REDACTED: &str = "[REDACTED]";

/// Key/value-style secrets redacted from error text before it is logged
/// or persisted. Matching is case-insensitive on the key.
const SECRET_KEYS: &[&str] = &["apikey", "api_key", "api-key", "token", "password", "secret"];

/// Scrub bearer tokens and key/value credentials from arbitrary error text.
pub fn redact_secrets(text: &str) -> String {
    let mut out = redact_bearer(text);
    for key in SECRET_KEYS {
        out = redact_key_value(&out, key);
    }
    out
}

/// Replace the token following "Bearer " with a placeholder.
fn redact_bearer(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(idx) = find_ascii_ci(rest, "bearer ") {
        let token_start = idx + "bearer ".len();
        out.push_str(&rest[..token_start]);
        out.push_str(REDACTED);
        let token_end = rest[token_start..]
            .find(|c: char| !is_token_char(c))
            .map(|rel| token_start + rel)
            .unwrap_or(rest.len());
        rest = &rest[token_end..];
    }
    out.push_str(rest);
    out
}

/// Replace the value in `key=value`, `key: value` and `"key":"value"`
/// shapes with a placeholder.
fn redact_key_value(text: &str, key: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    loop {
        let Some(idx) = find_ascii_ci(rest, key) else {
            out.push_str(rest);
            return out;
        };

        let after_key = idx + key.len();
        // Find the separator (= or :), skipping quotes and whitespace.
        let tail = &rest[after_key..];
        let sep_rel = tail
            .chars()
            .take_while(|c| matches!(c, ' ' | '"' | '\''))
            .count();
        let sep = tail[sep_rel..].chars().next();

        if !matches!(sep, Some('=') | Some(':')) {
            out.push_str(&rest[..after_key]);
            rest = tail;
            continue;
        }

        let value_offset = after_key + sep_rel + 1;
        let value_start = value_offset
            + rest[value_offset..]
                .chars()
                .take_while(|c| matches!(c, ' ' | '"' | '\''))
                .map(|c| c.len_utf8())
                .sum::<usize>();

        out.push_str(&rest[..value_start]);
        out.push_str(REDACTED);

        let value_end = rest[value_start..]
            .find(|c: char| !is_token_char(c))
            .map(|rel| value_start + rel)
            .unwrap_or(rest.len());
        rest = &rest[value_end..];
    }
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '+' | '/')
}
