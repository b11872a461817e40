//! RFC 2069-style Digest authentication for upstream camera sessions.
//!
//! Deliberately not the full RFC 2617 `qop`-aware handshake, and deliberately
//! not the `digest_auth` crate: cameras in the wild expect the exact header
//! shape below, comma after `username="..."` but a bare space after
//! `realm="..."` before `nonce=`. A conformant digest client would normalize
//! that away and the camera would reject it.

/// `HA1 = MD5(login:realm:password)`, `HA2 = MD5(method:uri)`,
/// `response = MD5(HA1:nonce:HA2)`.
pub fn compute_response(login: &str, realm: &str, password: &str, method: &str, uri: &str, nonce: &str) -> String {
    let ha1 = format!("{:x}", md5::compute(format!("{login}:{realm}:{password}")));
    let ha2 = format!("{:x}", md5::compute(format!("{method}:{uri}")));
    format!("{:x}", md5::compute(format!("{ha1}:{nonce}:{ha2}")))
}

/// Build the literal `Authorization` header line sent on every request after
/// a 401 challenge. The formatting quirk (comma, then space-not-comma) is
/// intentional — see module docs.
pub fn authorization_header(login: &str, realm: &str, nonce: &str, uri: &str, response: &str) -> String {
    format!(
        "Authorization: Digest username=\"{login}\", realm=\"{realm}\" nonce=\"{nonce}\", uri=\"{uri}\", response=\"{response}\""
    )
}

/// Parse `realm` and `nonce` out of a `WWW-Authenticate` header value.
/// Other parameters (`qop`, `opaque`, `algorithm`) are ignored — the upstream
/// protocol this proxy speaks doesn't negotiate them.
pub fn parse_www_authenticate(value: &str) -> Option<(String, String)> {
    let realm = extract_quoted(value, "realm=")?;
    let nonce_key_pos = value.find("nonce=")?;
    let nonce = extract_quoted(&value[nonce_key_pos..], "nonce=")?;
    Some((realm, nonce))
}

fn extract_quoted(haystack: &str, key: &str) -> Option<String> {
    let start = haystack.find(key)? + key.len();
    let rest = &haystack[start..];
    let rest = rest.strip_prefix('"')?;
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}
