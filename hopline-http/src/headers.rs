//! Ordered header lists and the utilities that inspect them.
//!
//! A header block is a `Vec` of `(name, value)` byte pairs, preserving
//! duplicates, arrival order, and original casing. Inspection helpers
//! lower-case names; emission writes them back verbatim.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;

/// One header field, as it appeared on the wire or as supplied by the user.
pub type Header = (Bytes, Bytes);

/// An ordered header list.
pub type Headers = Vec<Header>;

/// Methods whose requests may be transparently retried (RFC 7231 §4.2.2).
pub const IDEMPOTENT_METHODS: &[&str] = &["GET", "HEAD", "OPTIONS", "PUT", "DELETE", "TRACE"];

/// Methods defined as safe (RFC 7231 §4.2.1).
pub const SAFE_METHODS: &[&str] = &["GET", "HEAD", "OPTIONS", "TRACE"];

/// Hop-by-hop fields (RFC 7230 §6.1), stripped by intermediaries before
/// forwarding. `proxy-connection` is a de-facto member.
pub(crate) const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "proxy-connection",
];

pub fn is_idempotent(method: &str) -> bool {
    IDEMPOTENT_METHODS.iter().any(|m| *m == method)
}

fn lower(name: &[u8]) -> Vec<u8> {
    name.to_ascii_lowercase()
}

pub(crate) fn name_is(name: &[u8], expected: &str) -> bool {
    name.eq_ignore_ascii_case(expected.as_bytes())
}

fn trim(value: &[u8]) -> &[u8] {
    let start = value
        .iter()
        .position(|b| !b" \t".contains(b))
        .unwrap_or(value.len());
    let end = value
        .iter()
        .rposition(|b| !b" \t".contains(b))
        .map(|i| i + 1)
        .unwrap_or(start);
    &value[start..end]
}

/// The set of header names present, lower-cased.
pub fn header_names(headers: &[Header]) -> HashSet<Vec<u8>> {
    headers.iter().map(|(name, _)| lower(name)).collect()
}

/// Headers keyed by lower-cased name, with comma-separated values split
/// apart and trimmed. Names listed in `omit` (lower-cased) are skipped.
///
/// Comma-splitting is not safe for fields whose values may carry commas
/// inside quoted strings (Set-Cookie and friends); use the raw list for
/// those.
pub fn header_dict(headers: &[Header], omit: &[&str]) -> HashMap<Vec<u8>, Vec<Bytes>> {
    let mut out: HashMap<Vec<u8>, Vec<Bytes>> = HashMap::new();
    for (name, value) in headers {
        let key = lower(name);
        if omit.iter().any(|o| o.as_bytes() == key.as_slice()) {
            continue;
        }
        let entry = out.entry(key).or_default();
        for part in split_commas(value) {
            entry.push(part);
        }
    }
    out
}

/// All values for `name` (case-insensitive), comma-split and trimmed.
/// The same quoted-string caveat as [`header_dict`] applies.
pub fn get_header(headers: &[Header], name: &str) -> Vec<Bytes> {
    let mut out = Vec::new();
    for (field, value) in headers {
        if name_is(field, name) {
            out.extend(split_commas(value));
        }
    }
    out
}

fn split_commas(value: &Bytes) -> Vec<Bytes> {
    let mut out = Vec::new();
    let mut start = 0;
    for (i, b) in value.iter().enumerate() {
        if *b == b',' {
            push_trimmed(&mut out, value, start, i);
            start = i + 1;
        }
    }
    push_trimmed(&mut out, value, start, value.len());
    out
}

fn push_trimmed(out: &mut Vec<Bytes>, value: &Bytes, start: usize, end: usize) {
    let piece = &value[start..end];
    let trimmed = trim(piece);
    if !trimmed.is_empty() {
        let offset = start + (trimmed.as_ptr() as usize - piece.as_ptr() as usize);
        out.push(value.slice(offset..offset + trimmed.len()));
    }
}

/// Comma-split values of every `Connection` header, lower-cased.
pub(crate) fn connection_tokens(headers: &[Header]) -> Vec<Vec<u8>> {
    get_header(headers, "connection")
        .iter()
        .map(|v| v.to_ascii_lowercase())
        .collect()
}

/// Remove hop-by-hop fields, plus any field named by a `Connection` header,
/// from a user-supplied list. Returns a new list preserving the order of
/// the survivors.
pub(crate) fn strip_hop_by_hop(headers: &[Header]) -> Headers {
    let named: Vec<Vec<u8>> = connection_tokens(headers);
    headers
        .iter()
        .filter(|(name, _)| {
            let key = lower(name);
            !HOP_BY_HOP.iter().any(|h| h.as_bytes() == key.as_slice())
                && !named.iter().any(|n| *n == key)
        })
        .cloned()
        .collect()
}

/// Convenience for building a header pair from static strings.
pub fn header(name: &str, value: &str) -> Header {
    (
        Bytes::copy_from_slice(name.as_bytes()),
        Bytes::copy_from_slice(value.as_bytes()),
    )
}
