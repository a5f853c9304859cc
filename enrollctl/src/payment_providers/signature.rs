//! HMAC-SHA256 verification of MercadoPago webhook signatures.
//!
//! The `x-signature` header looks like `ts=1704908010,v1=<hex>` and the
//! digest is computed over the manifest `id:{data.id};request-id:{x-request-id};ts:{ts};`.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Parsed `x-signature` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeader {
    pub ts: String,
    pub v1: String,
}

impl SignatureHeader {
    pub fn parse(header: &str) -> Option<Self> {
        let mut ts = None;
        let mut v1 = None;
        for part in header.split(',') {
            let (key, value) = part.split_once('=')?;
            match key.trim() {
                "ts" => ts = Some(value.trim().to_string()),
                "v1" => v1 = Some(value.trim().to_string()),
                _ => {}
            }
        }
        Some(Self { ts: ts?, v1: v1? })
    }
}

fn manifest(data_id: &str, request_id: &str, ts: &str) -> String {
    // Alphanumeric ids are signed lowercased
    let data_id = if data_id.chars().all(|c| c.is_ascii_alphanumeric()) {
        data_id.to_ascii_lowercase()
    } else {
        data_id.to_string()
    };
    format!("id:{data_id};request-id:{request_id};ts:{ts};")
}

/// Compute the hex-encoded signature for a notification.
pub fn sign(data_id: &str, request_id: &str, ts: &str, secret: &str) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(manifest(data_id, request_id, ts).as_bytes());
    let digest = mac.finalize().into_bytes();
    Some(digest.iter().map(|b| format!("{b:02x}")).collect())
}

/// Verify a notification against its `x-signature` and `x-request-id` headers.
pub fn verify(signature_header: &str, request_id: &str, data_id: &str, secret: &str) -> bool {
    let Some(header) = SignatureHeader::parse(signature_header) else {
        return false;
    };
    let Some(expected) = sign(data_id, request_id, &header.ts, secret) else {
        return false;
    };
    constant_time_eq(header.v1.to_ascii_lowercase().as_bytes(), expected.as_bytes())
}

/// Constant-time byte comparison to prevent timing attacks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}
