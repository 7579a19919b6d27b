//! Best-effort recovery of structured data from model text.
//!
//! Every step here is idempotent, so `repair(repair(x)) == repair(x)` holds for
//! any input. Repair never validates: callers feed the result back through the
//! agent's own parser.

const FENCE: &str = "```";

/// Repair a response that should contain a single JSON value.
///
/// 1. strip a fenced code block wrapping the value;
/// 2. drop prose before the first opener and after its matching closer;
/// 3. drop trailing commas before closers and at the end of truncated text;
/// 4. close an unterminated string;
/// 5. append closers for every opener still open.
///
/// Text without any `{` or `[` is returned with only the fence removed.
pub fn repair(text: &str) -> String {
    let body = strip_code_fence(text.trim());
    match body.find(['{', '[']) {
        Some(start) => close_structure(&body[start..]),
        None => body.to_string(),
    }
}

/// First top-level `{..}` or `[..]` span whose brackets balance, if any.
///
/// Brackets inside string literals are ignored.
pub fn extract_balanced_span(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth -= 1;
                if depth == 0 {
                    let end = start + offset + ch.len_utf8();
                    return Some(&text[start..end]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Contents of the fenced block wrapping the value, or the input when there is
/// no such fence.
///
/// Only a fence that comes before the first `{`/`[` wraps the value; fences
/// after it belong to string contents. The closing fence is the first one
/// outside a JSON string, and an unclosed fence runs to the end of the text.
fn strip_code_fence(text: &str) -> &str {
    let Some(open) = text.find(FENCE) else {
        return text;
    };
    if text.find(['{', '[']).is_some_and(|start| start < open) {
        return text;
    }
    let after = &text[open + FENCE.len()..];
    let tag_len = after
        .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '+' | '-' | '.')))
        .unwrap_or(after.len());
    let rest = after[tag_len..].trim_start_matches([' ', '\t']);
    let rest = rest
        .strip_prefix("\r\n")
        .or_else(|| rest.strip_prefix('\n'))
        .unwrap_or(rest);
    let end = closing_fence(rest).unwrap_or(rest.len());
    rest[..end].trim()
}

/// Offset of the first fence that is not inside a JSON string.
///
/// Strings are tracked only once an opener has been seen. A raw newline ends a
/// string, since valid JSON strings cannot contain one.
fn closing_fence(text: &str) -> Option<usize> {
    let mut seen_opener = false;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text.char_indices() {
        if in_string {
            if ch == '\n' {
                in_string = false;
            } else if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '{' | '[' => seen_opener = true,
            '"' if seen_opener => {
                in_string = true;
                escaped = false;
            }
            '`' if text[offset..].starts_with(FENCE) => return Some(offset),
            _ => {}
        }
    }
    None
}

/// Scan from an opener, cutting at the matching top-level closer or closing
/// everything still open at the end of the text.
fn close_structure(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for ch in text.chars() {
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => {
                in_string = true;
                out.push(ch);
            }
            '{' => {
                stack.push('}');
                out.push(ch);
            }
            '[' => {
                stack.push(']');
                out.push(ch);
            }
            '}' | ']' => {
                drop_trailing_comma(&mut out);
                stack.pop();
                out.push(ch);
                if stack.is_empty() {
                    return out;
                }
            }
            _ => out.push(ch),
        }
    }

    if in_string {
        // A dangling escape would swallow the closing quote.
        if escaped {
            out.pop();
        }
        out.push('"');
    }
    drop_trailing_comma(&mut out);
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    out
}

fn drop_trailing_comma(out: &mut String) {
    loop {
        let trimmed = out.trim_end();
        if !trimmed.ends_with(',') {
            return;
        }
        let len = trimmed.len() - 1;
        out.truncate(len);
    }
}
