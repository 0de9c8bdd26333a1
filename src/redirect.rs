//! Redirect planning and chain bookkeeping.
//!
//! After every completed exchange the engine asks this module whether
//! the response sends the fetch somewhere else. Classic `3xx` statuses
//! are the common case, but a `206` carrying a `Location` header and an
//! HTML `<meta http-equiv="refresh">` page also count, matching what
//! large sites actually serve.

use http::{HeaderMap, Method, StatusCode};
use url::Url;

use crate::ErrorKind;
use crate::resource::Resource;

/// How to follow a redirecting response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RedirectPlan {
    /// Absolute target of the next hop
    pub target: Url,
    /// Whether the next hop is demoted to a bodyless `GET`
    pub rewrite_to_get: bool,
}

/// Decide whether `code`/`headers`/`body` redirect the resource.
///
/// Returns `Ok(None)` for terminal responses. Enforces the redirect
/// ceiling *before* the hop is followed, so a chain of N allowed
/// redirects fails on the N+1th redirecting response.
pub(crate) fn plan(
    resource: &Resource,
    code: StatusCode,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Option<RedirectPlan>, ErrorKind> {
    let target = if code.is_redirection() {
        match location(resource, headers)? {
            Some(target) => target,
            None => return Err(ErrorKind::MissingRedirectLocation(code)),
        }
    } else if code == StatusCode::PARTIAL_CONTENT {
        // Some servers answer range-less requests with a 206 plus a
        // Location pointing at the real document.
        match location(resource, headers)? {
            Some(target) => target,
            None => return Ok(None),
        }
    } else if code.is_success() {
        match meta_refresh_target(resource, headers, body) {
            Some(target) => target,
            None => return Ok(None),
        }
    } else {
        return Ok(None);
    };

    let max = resource.config.max_redirects;
    if resource.redirects.len() as u32 >= max {
        return Err(ErrorKind::TooManyRedirects(max));
    }

    // 307/308 replay the request as-is; every other redirecting status
    // is followed with a bodyless GET, the way browsers do.
    let rewrite_to_get = !matches!(
        code,
        StatusCode::TEMPORARY_REDIRECT | StatusCode::PERMANENT_REDIRECT
    ) && resource.method != Method::HEAD;

    Ok(Some(RedirectPlan {
        target,
        rewrite_to_get,
    }))
}

/// Rewrite `resource` in place to fetch the planned target next.
pub(crate) fn apply(resource: &mut Resource, plan: RedirectPlan) {
    let cross_host = resource.url.host_str() != plan.target.host_str();
    if cross_host {
        strip_sensitive_headers(resource);
    }
    if plan.rewrite_to_get {
        resource.method = Method::GET;
        resource.body = None;
    }
    resource.redirects.push(plan.target.clone());
    resource.url = plan.target;
    resource.sink = None;
    // A pooled tunnel belongs to the previous origin; the dispatch path
    // re-establishes proxy state for the new hop.
    if let Some(proxy) = &mut resource.proxy {
        proxy.phase = None;
    }
}

fn location(resource: &Resource, headers: &HeaderMap) -> Result<Option<Url>, ErrorKind> {
    let Some(value) = headers.get(http::header::LOCATION) else {
        return Ok(None);
    };
    let text = value.to_str().map_err(|_| {
        ErrorKind::InvalidResponse("unreadable Location header".to_string())
    })?;
    let target = resource
        .url
        .join(text)
        .map_err(|e| ErrorKind::InvalidUrl(text.to_string(), e))?;
    Ok(Some(target))
}

fn strip_sensitive_headers(resource: &mut Resource) {
    for name in [
        http::header::AUTHORIZATION,
        http::header::COOKIE,
        http::header::PROXY_AUTHORIZATION,
        http::header::WWW_AUTHENTICATE,
    ] {
        resource.headers.remove(&name);
    }
}

/// Extract the target of `<meta http-equiv="refresh" content="N;
/// url=...">` from an HTML body.
///
/// This is a byte scan, not an HTML parse: it tolerates attribute
/// reordering and quoting styles but never looks past the first
/// matching tag. Pages abusing meta refresh for actual delays
/// (`content="30"`) are not redirects and are left alone.
fn meta_refresh_target(resource: &Resource, headers: &HeaderMap, body: &[u8]) -> Option<Url> {
    let content_type = headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())?;
    if !content_type
        .to_ascii_lowercase()
        .starts_with("text/html")
    {
        return None;
    }
    // Meta tags live in <head>; scanning the whole body of a big page
    // for a tag that is not there would be wasted work.
    let window = &body[..body.len().min(16 * 1024)];
    let lower = window.to_ascii_lowercase();

    let mut search_from = 0;
    while let Some(offset) = find(&lower[search_from..], b"<meta") {
        let tag_start = search_from + offset;
        let tag_end = find(&lower[tag_start..], b">").map(|p| tag_start + p)?;
        let tag = &lower[tag_start..tag_end];
        if contains(tag, b"http-equiv") && contains(tag, b"refresh") {
            if let Some(url_pos) = find(tag, b"url=") {
                // Extract from the original window so URL case survives.
                let raw = trim_meta_url(&window[tag_start + url_pos + 4..tag_end]);
                if !raw.is_empty() {
                    let text = String::from_utf8_lossy(raw);
                    return resource.url.join(text.as_ref()).ok();
                }
            }
            return None;
        }
        search_from = tag_end;
    }
    None
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    find(haystack, needle).is_some()
}

/// Cut a raw `url=` attribute remnant down to the URL itself.
fn trim_meta_url(raw: &[u8]) -> &[u8] {
    match raw.first() {
        Some(b'"') => raw[1..].split(|&b| b == b'"').next().unwrap_or(&[]),
        Some(b'\'') => raw[1..].split(|&b| b == b'\'').next().unwrap_or(&[]),
        _ => raw
            .split(|&b| matches!(b, b'"' | b'\'' | b' ' | b'\t' | b'\r' | b'\n' | b';' | b'>'))
            .next()
            .unwrap_or(&[]),
    }
}
