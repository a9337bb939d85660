//! Cryptographic primitives shared by every engine.
//!
//! SHA-256 hashing, canonical JSON for deterministic signing payloads, and
//! [`SigningKey`], an HMAC-SHA256 key held per signing domain (audit
//! entries, opaque cursors, webhook payloads). Signatures travel as
//! lowercase hex and are verified by recomputing the expected digest and
//! comparing it in constant time, so a malformed signature costs the same
//! as a wrong one and separate domains never cross-verify.

use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde_json::Value;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// SHA-256 of the input, lowercase hex (64 characters).
pub fn sha256_hex(data: impl AsRef<[u8]>) -> String {
    hex::encode(Sha256::digest(data.as_ref()))
}

/// Hash a bearer token for storage. The raw token is never persisted, so a
/// compromised store does not yield usable credentials.
pub fn token_hash(token: &str) -> String {
    sha256_hex(token.as_bytes())
}

/// Hash a request body for idempotency comparison.
pub fn request_hash(body: &[u8]) -> String {
    sha256_hex(body)
}

/// An HMAC-SHA256 key scoped to one signing domain.
///
/// Each concern holds its own key (audit secret, cursor secret, webhook
/// secret), so a signature minted for one domain is meaningless in any
/// other.
pub struct SigningKey {
    key: Vec<u8>,
}

impl SigningKey {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self { key: secret.into() }
    }

    /// Hex HMAC-SHA256 over a raw message.
    pub fn sign(&self, message: &[u8]) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(message);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Hex HMAC-SHA256 over the canonical JSON of a value. The signature
    /// is stable under key reordering in `value`.
    pub fn sign_value(&self, value: &Value) -> String {
        self.sign(canonical_json(value).as_bytes())
    }

    /// Verify a hex signature over a raw message.
    ///
    /// The expected digest is always recomputed and compared as hex text,
    /// constant-time and case-insensitive; undecodable input takes the
    /// same path as a mismatched signature.
    pub fn verify(&self, message: &[u8], signature: &str) -> bool {
        let expected = self.sign(message);
        constant_time_eq(
            expected.as_bytes(),
            signature.to_ascii_lowercase().as_bytes(),
        )
    }

    /// Verify a hex signature over the canonical JSON of a value.
    pub fn verify_value(&self, value: &Value, signature: &str) -> bool {
        self.verify(canonical_json(value).as_bytes(), signature)
    }
}

/// Constant-time byte comparison that does not leak input lengths or content.
///
/// Both inputs are hashed to fixed-length digests before the comparison, so
/// timing reveals neither content nor length of either input.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let ha = Sha256::digest(a);
    let hb = Sha256::digest(b);
    ha.ct_eq(&hb).into()
}

/// Canonical JSON: object keys sorted ascending, no insignificant whitespace.
///
/// Timestamps are expected to already be integers (unix seconds) in the
/// value; canonicalization does not rewrite scalars.
pub fn canonical_json(value: &Value) -> String {
    fn canonicalize(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut sorted: Vec<(&String, &Value)> = map.iter().collect();
                sorted.sort_by(|a, b| a.0.cmp(b.0));
                let mut out = serde_json::Map::new();
                for (k, v) in sorted {
                    out.insert(k.clone(), canonicalize(v));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
            other => other.clone(),
        }
    }
    canonicalize(value).to_string()
}

/// Sign an opaque cursor: `base64url(JSON{data, sig})` where `sig` is the
/// HMAC of the canonical JSON of `data`. Used for pagination cursors and any
/// other client-held state that must not be forged.
pub fn sign_cursor(data: &Value, secret: &[u8]) -> String {
    let sig = SigningKey::new(secret).sign_value(data);
    let combined = serde_json::json!({ "data": data, "sig": sig });
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(combined.to_string())
}

/// Verify and decode a signed cursor. Returns `None` on any malformation:
/// bad base64, bad JSON, missing fields, or MAC mismatch.
pub fn verify_cursor(cursor: &str, secret: &[u8]) -> Option<Value> {
    let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(cursor)
        .ok()?;
    let combined: Value = serde_json::from_slice(&decoded).ok()?;

    let data = combined.get("data")?;
    let sig = combined.get("sig")?.as_str()?;

    if !SigningKey::new(secret).verify_value(data, sig) {
        return None;
    }
    Some(data.clone())
}

/// Generate an idempotency key: 32 bytes from the OS CSPRNG, base64url.
pub fn generate_idempotency_key() -> String {
    let mut buf = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf)
}

/// Generate a bearer token: 32 bytes from the OS CSPRNG, base64url.
pub fn generate_token() -> String {
    let mut buf = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf)
}

/// Generate a request id with a timestamp prefix for log correlation:
/// `req_<YYYYMMDDHHMMSS>_<16 hex>`.
pub fn generate_request_id() -> String {
    let mut buf = [0u8; 8];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    format!(
        "req_{}_{}",
        Utc::now().format("%Y%m%d%H%M%S"),
        hex::encode(buf)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_value_stable_under_key_order() {
        let key = SigningKey::new(b"audit-secret".to_vec());
        let a = serde_json::json!({"actor_id": "u-1", "event_type": "payment.initiated"});
        let b = serde_json::json!({"event_type": "payment.initiated", "actor_id": "u-1"});

        let sig = key.sign_value(&a);
        assert!(key.verify_value(&b, &sig));
    }

    #[test]
    fn test_verify_accepts_uppercase_hex() {
        let key = SigningKey::new(b"secret".to_vec());
        let sig = key.sign(b"payload").to_ascii_uppercase();
        assert!(key.verify(b"payload", &sig));
    }

    #[test]
    fn test_changed_field_breaks_signature() {
        let key = SigningKey::new(b"audit-secret".to_vec());
        let entry = serde_json::json!({"action": "Payment created", "amount_cents": 2500});
        let sig = key.sign_value(&entry);

        let edited = serde_json::json!({"action": "Payment created", "amount_cents": 9999});
        assert!(!key.verify_value(&edited, &sig));
    }

    #[test]
    fn test_domains_do_not_cross_verify() {
        let audit_key = SigningKey::new(b"audit-secret".to_vec());
        let cursor_key = SigningKey::new(b"cursor-secret".to_vec());

        let sig = audit_key.sign(b"entry");
        assert!(audit_key.verify(b"entry", &sig));
        assert!(!cursor_key.verify(b"entry", &sig));
    }

    #[test]
    fn test_garbage_signatures_rejected() {
        let key = SigningKey::new(b"secret".to_vec());
        for junk in ["", "zz", "not hex at all", "deadbeef"] {
            assert!(!key.verify(b"payload", junk));
        }
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"hello", b"hello"));
        assert!(!constant_time_eq(b"hello", b"world"));
        assert!(!constant_time_eq(b"short", b"much longer string"));
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        let value = serde_json::json!({"zeta": 1, "alpha": {"nested_z": 2, "nested_a": 3}});
        let canonical = canonical_json(&value);
        assert_eq!(
            canonical,
            r#"{"alpha":{"nested_a":3,"nested_z":2},"zeta":1}"#
        );
    }

    #[test]
    fn test_cursor_roundtrip() {
        let secret = b"cursor-secret";
        let data = serde_json::json!({"offset": 40, "team": "t-1"});
        let cursor = sign_cursor(&data, secret);
        assert_eq!(verify_cursor(&cursor, secret), Some(data));
    }

    #[test]
    fn test_cursor_tamper_rejected() {
        let secret = b"cursor-secret";
        let cursor = sign_cursor(&serde_json::json!({"offset": 40}), secret);

        // Flip one byte of the encoded cursor
        let mut bytes = cursor.into_bytes();
        bytes[4] = if bytes[4] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(bytes).unwrap();

        assert!(verify_cursor(&tampered, secret).is_none());
    }

    #[test]
    fn test_cursor_malformed_rejected() {
        assert!(verify_cursor("not base64 !!!", b"secret").is_none());
        let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode("{\"data\":1}");
        assert!(verify_cursor(&raw, b"secret").is_none());
    }

    #[test]
    fn test_generated_keys_unique() {
        assert_ne!(generate_idempotency_key(), generate_idempotency_key());
        assert_ne!(generate_token(), generate_token());
    }

    #[test]
    fn test_request_id_shape() {
        let id = generate_request_id();
        assert!(id.starts_with("req_"));
        let parts: Vec<&str> = id.splitn(3, '_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1].len(), 14);
        assert_eq!(parts[2].len(), 16);
    }
}
