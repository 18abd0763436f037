// M3U8 rewriting - relative playlist and segment references are routed through the session's segment proxy.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use url::Url;

use super::scope;

/// Everything except RFC 3986 unreserved characters gets escaped, so a
/// reference (slashes and query included) travels as one path segment.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

pub fn percent_encode_component(input: &str) -> String {
    utf8_percent_encode(input, COMPONENT).to_string()
}

pub fn is_absolute_http(line: &str) -> bool {
    let lower = line.get(..8).unwrap_or(line).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Rewrite a top-level manifest.
///
/// Blank lines and `#` lines pass through unchanged, as do absolute `http(s)`
/// URLs. Every other line becomes `{segment_prefix}{percent-encoded line}`.
/// Line endings are preserved.
pub fn rewrite_manifest(body: &str, segment_prefix: &str) -> String {
    rewrite_lines(body, |reference| {
        Some(format!(
            "{segment_prefix}{}",
            percent_encode_component(reference)
        ))
    })
}

/// Rewrite a playlist fetched through the segment proxy (a variant playlist).
///
/// Its relative references are relative to `playlist_url`, while the segment
/// proxy resolves against the session's base URL, so each reference is
/// re-expressed relative to the base directory. References that cannot be
/// expressed inside the base scope are left as they are.
pub fn rewrite_nested_playlist(
    body: &str,
    playlist_url: &Url,
    base_url: &Url,
    segment_prefix: &str,
) -> String {
    rewrite_lines(body, |reference| {
        let target = playlist_url.join(reference).ok()?;
        let relative = scope::relative_to_base(base_url, &target)?;
        Some(format!(
            "{segment_prefix}{}",
            percent_encode_component(&relative)
        ))
    })
}

fn rewrite_lines<F>(body: &str, mut rewrite: F) -> String
where
    F: FnMut(&str) -> Option<String>,
{
    let mut output = String::with_capacity(body.len() + body.len() / 2);
    for raw in body.split_inclusive('\n') {
        let (content, ending) = split_line_ending(raw);
        let trimmed = content.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || is_absolute_http(trimmed) {
            output.push_str(content);
        } else {
            match rewrite(trimmed) {
                Some(line) => output.push_str(&line),
                None => output.push_str(content),
            }
        }
        output.push_str(ending);
    }
    output
}

fn split_line_ending(raw: &str) -> (&str, &str) {
    if let Some(content) = raw.strip_suffix("\r\n") {
        (content, "\r\n")
    } else if let Some(content) = raw.strip_suffix('\n') {
        (content, "\n")
    } else {
        (raw, "")
    }
}
