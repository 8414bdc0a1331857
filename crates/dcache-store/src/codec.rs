//! Key → filename derivation.
//!
//! Every cache filename is `<display name>,<digest>`. The display name keeps
//! entries recognizable when browsing the cache directory; the digest keeps two
//! keys apart once sanitizing and truncation have made their names collide.

use once_cell::sync::Lazy;
use regex::Regex;

/// Bytes of BLAKE3 output kept for the key digest.
pub const DIGEST_BYTES: usize = 16;

/// Length of the hex digest, and the upper bound for shard ranges.
pub const DIGEST_HEX_LEN: usize = DIGEST_BYTES * 2;

/// Upper bound on the display part of a filename, in bytes.
pub const MAX_NAME_LEN: usize = 200;

static SCHEME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\w+://").expect("static regex"));
static SEPARATOR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[?/:|]+").expect("static regex"));

/// Lowercase hex digest of the raw key bytes.
///
/// BLAKE3 extended output truncated to [`DIGEST_BYTES`], so the full filename
/// stays under the 255-byte limit of common filesystems.
pub fn digest(key: &str) -> String {
    let mut out = [0u8; DIGEST_BYTES];
    blake3::Hasher::new()
        .update(key.as_bytes())
        .finalize_xof()
        .fill(&mut out);
    hex::encode(out)
}

/// Path-safe, length-bounded rendering of the key.
///
/// URI keys lose their scheme and get an IDNA-encoded host. Runs of
/// `/ ? : |` collapse into a single comma.
pub fn display_name(key: &str) -> String {
    let mut name = match SCHEME_RE.find(key) {
        Some(scheme) => encode_host(&key[scheme.end()..]),
        None => key.to_string(),
    };
    name = SEPARATOR_RE.replace_all(&name, ",").into_owned();
    truncate_on_boundary(&mut name, MAX_NAME_LEN);
    name
}

/// Filename for a key: display name and digest joined by a comma.
pub fn safe_name(key: &str) -> String {
    format!("{},{}", display_name(key), digest(key))
}

/// IDNA-encode the host of a scheme-less URI, keeping everything else.
/// Falls back to the input when the host is not a valid domain or address.
fn encode_host(rest: &str) -> String {
    let authority_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let (authority, tail) = rest.split_at(authority_end);
    let (userinfo, host_port) = match authority.rfind('@') {
        Some(at) => authority.split_at(at + 1),
        None => ("", authority),
    };
    let (host, port) = split_port(host_port);

    match url::Host::parse(host) {
        Ok(host) => format!("{userinfo}{host}{port}{tail}"),
        Err(_) => rest.to_string(),
    }
}

/// Split `host:port` into `("host", ":port")`. Bracketed IPv6 literals keep
/// their inner colons.
fn split_port(host_port: &str) -> (&str, &str) {
    match host_port.rfind(':') {
        Some(colon)
            if host_port[colon + 1..].bytes().all(|b| b.is_ascii_digit())
                && (!host_port.starts_with('[') || host_port[..colon].ends_with(']')) =>
        {
            host_port.split_at(colon)
        }
        _ => (host_port, ""),
    }
}

fn truncate_on_boundary(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
}
