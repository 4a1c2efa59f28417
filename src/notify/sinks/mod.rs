//! One adapter per delivery transport
//!
//! Adapters share [`HttpTransport`](super::transport::HttpTransport) for
//! retry and status classification. The helpers here cover what several
//! vendors have in common: mandatory field checks, timestamped HMAC
//! signatures and `{errcode, errmsg}` style response bodies.

pub mod dingtalk;
pub mod discord;
pub mod email;
pub mod feishu;
pub mod slack;
pub mod telegram;
pub mod webhook;
pub mod wechat;

use base64::Engine;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Fail construction when a mandatory setting is blank
pub(crate) fn require(op: &'static str, field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::invalid_config(op, format!("{field} is required")));
    }
    Ok(())
}

pub(crate) fn hmac_sha256(key: &[u8], message: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| Error::internal("sink.sign", "invalid HMAC key").with_source(e))?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// `base64(HMAC-SHA256(secret, "{ts}\n{secret}"))`, the signature chat
/// robots expect next to a millisecond or second timestamp
pub(crate) fn timestamp_signature(secret: &str, timestamp: i64) -> Result<String> {
    let string_to_sign = format!("{timestamp}\n{secret}");
    let digest = hmac_sha256(secret.as_bytes(), string_to_sign.as_bytes())?;
    Ok(base64::engine::general_purpose::STANDARD.encode(digest))
}

/// Turn a vendor error body into an error when its code field is non-zero.
///
/// `code_field` is `errcode` for the Chinese robots and `code` for Feishu.
pub(crate) fn check_vendor_code(op: &'static str, body: &Value, code_field: &str) -> Result<()> {
    let code = body.get(code_field).and_then(Value::as_i64).unwrap_or(0);
    if code == 0 {
        return Ok(());
    }
    let message = body
        .get("errmsg")
        .or_else(|| body.get("msg"))
        .and_then(Value::as_str)
        .unwrap_or("unknown error");
    Err(Error::unavailable(op, format!("vendor error {code}: {message}")))
}
