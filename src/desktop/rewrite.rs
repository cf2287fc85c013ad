//! Text rewriting for proxied desktop assets.
//!
//! The desktop client is written to be served from `/`. Mounted under a
//! prefix it would request `/app/ui.js` and open `wss://host/websockify`, both
//! of which miss the proxy. Two rules fix that for HTML, JavaScript and CSS:
//!
//! - root-relative references (`="/x`, `='/x`, `url(/x`, `url("/x`,
//!   `url('/x`) gain the mount prefix; protocol-relative `//host` and paths
//!   already under the mount are left alone
//! - `new WebSocket("wss://" + …)` call sites gain
//!   `window.location.host + "<mount>/"` after the scheme literal

const ROOT_RELATIVE_MARKERS: [&str; 5] = ["=\"/", "='/", "url(/", "url(\"/", "url('/"];

const WEBSOCKET_CALL: &str = "new WebSocket(";
const HOST_EXPR: &str = "window.location.host";

/// Whether a response with this `Content-Type` gets rewritten.
pub fn is_rewritable(content_type: &str) -> bool {
    let ct = content_type.to_ascii_lowercase();
    ct.contains("text/html") || ct.contains("javascript") || ct.contains("text/css")
}

/// Apply both rules. `mount` has a leading slash and no trailing slash.
pub fn rewrite_body(body: &str, mount: &str) -> String {
    let mut out = body.to_string();
    for marker in ROOT_RELATIVE_MARKERS {
        out = prefix_root_relative(&out, marker, mount);
    }
    rewrite_websocket_urls(&out, mount)
}

fn prefix_root_relative(body: &str, marker: &str, mount: &str) -> String {
    let bare_mount = mount.trim_start_matches('/');
    let mut out = String::with_capacity(body.len());
    let mut rest = body;
    while let Some(idx) = rest.find(marker) {
        let end = idx + marker.len();
        out.push_str(&rest[..end]);
        rest = &rest[end..];
        if !rest.starts_with('/') && !is_mounted(rest, bare_mount) {
            out.push_str(bare_mount);
            out.push('/');
        }
    }
    out.push_str(rest);
    out
}

/// `path` (without its leading slash) already points into the mount.
fn is_mounted(path: &str, bare_mount: &str) -> bool {
    path.strip_prefix(bare_mount).is_some_and(|after| {
        after.is_empty() || after.starts_with(['/', '"', '\'', ')', '?', '#'])
    })
}

fn rewrite_websocket_urls(body: &str, mount: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut rest = body;
    while let Some(idx) = rest.find(WEBSOCKET_CALL) {
        let end = idx + WEBSOCKET_CALL.len();
        out.push_str(&rest[..end]);
        rest = &rest[end..];
        if let Some(site) = scheme_literal(rest) {
            out.push_str(&rest[..site.literal_end]);
            out.push_str(" + ");
            out.push_str(HOST_EXPR);
            out.push_str(" + ");
            out.push(site.quote);
            out.push_str(mount);
            out.push('/');
            out.push(site.quote);
            out.push_str(" +");
            rest = &rest[site.plus_end..];
        }
    }
    out.push_str(rest);
    out
}

struct SchemeLiteral {
    quote: char,
    /// Byte offset just past the closing quote.
    literal_end: usize,
    /// Byte offset just past the `+` that follows the literal.
    plus_end: usize,
}

/// Match `"wss://" +` (either quote style, `ws` or `wss`) at the start of
/// `s`, allowing whitespace around it. Call sites that already reference
/// the current host are skipped.
fn scheme_literal(s: &str) -> Option<SchemeLiteral> {
    let lead = s.len() - s.trim_start().len();
    let quoted = &s[lead..];
    let quote = quoted.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let inner = &quoted[1..];
    let scheme = ["wss://", "ws://"]
        .into_iter()
        .find(|scheme| inner.starts_with(scheme))?;
    if !inner[scheme.len()..].starts_with(quote) {
        return None;
    }
    let literal_end = lead + 1 + scheme.len() + 1;

    let after = &s[literal_end..];
    let gap = after.len() - after.trim_start().len();
    if !after[gap..].starts_with('+') {
        return None;
    }
    let plus_end = literal_end + gap + 1;
    if s[plus_end..].trim_start().starts_with(HOST_EXPR) {
        return None;
    }
    Some(SchemeLiteral {
        quote,
        literal_end,
        plus_end,
    })
}
