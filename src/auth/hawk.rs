//! Keyed-hash request signing for device exchanges.
//!
//! Both directions are signed with the device's shared secret: the device
//! signs its requests and the server signs its responses, so each side can
//! verify the other. The canonical string layout and the payload-hash
//! construction are a wire contract with deployed device clients — do not
//! reorder the lines.

use anyhow::{anyhow, bail, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::{distributions::Alphanumeric, Rng};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

const HEADER_VERSION: &str = "hawk.1.header";
const PAYLOAD_VERSION: &str = "hawk.1.payload";

/// The signature fields carried in an `Authorization: Hawk ...` header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HawkAuth {
    pub id: String,
    pub ts: i64,
    pub nonce: String,
    pub ext: String,
    pub hash: String,
    pub mac: String,
}

/// Request coordinates covered by the signature.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: String,
    pub path: String,
    pub host: String,
    pub port: String,
}

impl RequestContext {
    pub fn new(method: &str, path: &str, host: &str, port: &str) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            host: host.to_string(),
            port: port.to_string(),
        }
    }

    /// Derive host and port from a `Host` header value. Port defaults to 80.
    pub fn from_host_header(method: &str, path: &str, host_header: &str) -> Self {
        let (host, port) = match host_header.rsplit_once(':') {
            Some((h, p)) if p.chars().all(|c| c.is_ascii_digit()) && !p.is_empty() => (h, p),
            _ => (host_header, "80"),
        };
        Self::new(method, path, host, port)
    }
}

/// Parse a structured `Hawk key="value", ...` authorization header.
/// Anything malformed fails closed.
pub fn parse_header(header: &str) -> Result<HawkAuth> {
    let rest = header
        .strip_prefix("Hawk ")
        .ok_or_else(|| anyhow!("not a Hawk authorization header"))?;

    let mut auth = HawkAuth::default();
    for field in rest.split(',') {
        let field = field.trim();
        if field.is_empty() {
            continue;
        }
        let Some((key, raw)) = field.split_once('=') else {
            bail!("malformed Hawk field: {field}");
        };
        let value = raw
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .ok_or_else(|| anyhow!("unquoted Hawk value for {key}"))?;
        match key.trim() {
            "id" => auth.id = value.to_string(),
            "ts" => auth.ts = value.parse()?,
            "nonce" => auth.nonce = value.to_string(),
            "ext" => auth.ext = value.to_string(),
            "hash" => auth.hash = value.to_string(),
            "mac" => auth.mac = value.to_string(),
            other => bail!("unknown Hawk field: {other}"),
        }
    }
    if auth.id.is_empty() || auth.nonce.is_empty() || auth.mac.is_empty() || auth.ts == 0 {
        bail!("incomplete Hawk header");
    }
    Ok(auth)
}

/// Hash of the request/response payload, bound to its content type.
pub fn payload_hash(content_type: &str, body: &[u8]) -> String {
    // Parameters (e.g. "; charset=utf-8") are not part of the contract.
    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_lowercase();

    let mut hasher = Sha256::new();
    hasher.update(PAYLOAD_VERSION.as_bytes());
    hasher.update(b"\n");
    hasher.update(media_type.as_bytes());
    hasher.update(b"\n");
    hasher.update(body);
    hasher.update(b"\n");
    BASE64.encode(hasher.finalize())
}

/// MAC over the canonical request string. Line order is the contract.
pub fn signature(
    ctx: &RequestContext,
    ts: i64,
    nonce: &str,
    hash: &str,
    ext: &str,
    secret: &str,
) -> Result<String> {
    let canonical = format!(
        "{HEADER_VERSION}\n{ts}\n{nonce}\n{method}\n{path}\n{host}\n{port}\n{hash}\n{ext}\n",
        method = ctx.method.to_uppercase(),
        path = ctx.path,
        host = ctx.host,
        port = ctx.port,
    );
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| anyhow!("invalid hmac key length"))?;
    mac.update(canonical.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// Check a remote signature against what we compute from the actual request.
/// The remote `hash` field is never trusted; the payload hash is recomputed
/// from the body we received.
pub fn verify(
    ctx: &RequestContext,
    content_type: &str,
    body: &[u8],
    remote: &HawkAuth,
    secret: &str,
) -> Result<bool> {
    let local_hash = if body.is_empty() {
        String::new()
    } else {
        payload_hash(content_type, body)
    };
    let local_mac = signature(ctx, remote.ts, &remote.nonce, &local_hash, &remote.ext, secret)?;
    Ok(constant_time_eq(&local_mac, &remote.mac))
}

/// Build the server's `Authorization` header over a response body, so the
/// device can verify us in turn.
pub fn response_header(
    id: &str,
    ctx: &RequestContext,
    content_type: &str,
    body: &[u8],
    ext: &str,
    secret: &str,
) -> Result<String> {
    let ts = chrono::Utc::now().timestamp();
    let nonce = gen_nonce(8);
    let hash = if body.is_empty() {
        String::new()
    } else {
        payload_hash(content_type, body)
    };
    let mac = signature(ctx, ts, &nonce, &hash, ext, secret)?;
    Ok(format!(
        "Hawk id=\"{id}\", ts=\"{ts}\", nonce=\"{nonce}\", ext=\"{ext}\", hash=\"{hash}\", mac=\"{mac}\""
    ))
}

pub fn gen_nonce(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}
