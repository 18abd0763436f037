// Keeps segment targets inside the origin and directory of a session's base URL.

use url::Url;

use crate::error::{RelayError, RelayResult};

/// Path of the directory containing the base resource, trailing slash included.
fn base_directory(base: &Url) -> &str {
    let path = base.path();
    match path.rfind('/') {
        Some(idx) => &path[..=idx],
        None => "/",
    }
}

fn same_origin(base: &Url, target: &Url) -> bool {
    base.scheme() == target.scheme()
        && base.host_str() == target.host_str()
        && base.port_or_known_default() == target.port_or_known_default()
}

/// Reject `target` unless it shares the base's origin and lies under its directory.
pub fn ensure_within(base: &Url, target: &Url) -> RelayResult<()> {
    if !same_origin(base, target) {
        return Err(RelayError::validation(format!(
            "segment target {target} leaves the session origin"
        )));
    }
    if !target.path().starts_with(base_directory(base)) {
        return Err(RelayError::validation(format!(
            "segment target {} escapes {}",
            target.path(),
            base_directory(base)
        )));
    }
    Ok(())
}

/// Resolve a client-supplied segment path against the base URL, enforcing scope.
///
/// Dot segments (including percent-encoded ones) are normalized by the URL
/// parser before the scope check, so traversal cannot slip past it.
pub fn resolve_within(base: &Url, relative: &str) -> RelayResult<Url> {
    let relative = relative.trim();
    if relative.is_empty() {
        return Err(RelayError::validation("empty segment path"));
    }
    let target = base
        .join(relative)
        .map_err(|e| RelayError::validation(format!("invalid segment path {relative:?}: {e}")))?;
    ensure_within(base, &target)?;
    Ok(target)
}

/// Express `target` relative to the base directory (path plus query), if it is in scope.
pub fn relative_to_base(base: &Url, target: &Url) -> Option<String> {
    ensure_within(base, target).ok()?;
    let mut relative = target.path()[base_directory(base).len()..].to_string();
    if let Some(query) = target.query() {
        relative.push('?');
        relative.push_str(query);
    }
    Some(relative)
}
