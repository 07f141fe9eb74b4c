//! Request fingerprinting and canonical JSON.
//!
//! A request fingerprint is a SHA-256 digest over a type-tagged canonical
//! encoding of the request's logical content. Object keys are sorted, every
//! scalar carries its type, and containers carry their length, so the digest
//! depends only on content and never on map insertion order.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Compute the hex SHA-256 digest of raw bytes.
pub fn checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Whether `s` looks like a digest produced by [`checksum`].
pub fn is_checksum(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Compute the identity hash of a logical request.
///
/// Cache mode and TTL are deliberately absent from the signature: they are
/// policy, not identity.
pub fn fingerprint(
    kind: &str, method: &str, params: &Map<String, Value>, body: Option<&Value>, as_of_bucket: Option<&str>,
    cache_tag: Option<&str>,
) -> String {
    let mut enc = Encoder::default();
    enc.field("kind", |e| e.string(kind));
    enc.field("method", |e| e.string(method));
    enc.field("params", |e| e.object(params));
    enc.field("body", |e| match body {
        Some(v) => e.value(v),
        None => e.null(),
    });
    enc.field("as_of_bucket", |e| e.optional(as_of_bucket));
    enc.field("cache_tag", |e| e.optional(cache_tag));
    hex::encode(enc.hasher.finalize())
}

#[derive(Default)]
struct Encoder {
    hasher: Sha256,
}

impl Encoder {
    fn raw(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    fn len_prefixed(&mut self, tag: u8, bytes: &[u8]) {
        self.raw(&[tag]);
        self.raw(bytes.len().to_string().as_bytes());
        self.raw(b":");
        self.raw(bytes);
    }

    fn field(&mut self, name: &str, f: impl FnOnce(&mut Self)) {
        self.len_prefixed(b'k', name.as_bytes());
        f(self);
        self.raw(b"\n");
    }

    fn null(&mut self) {
        self.raw(b"n");
    }

    fn string(&mut self, s: &str) {
        self.len_prefixed(b's', s.as_bytes());
    }

    fn optional(&mut self, s: Option<&str>) {
        match s {
            Some(s) => self.string(s),
            None => self.null(),
        }
    }

    fn object(&mut self, map: &Map<String, Value>) {
        let mut keys: Vec<&String> = map.keys().collect();
        keys.sort();
        self.raw(b"m");
        self.raw(keys.len().to_string().as_bytes());
        self.raw(b"{");
        for key in keys {
            self.string(key);
            self.value(&map[key]);
        }
        self.raw(b"}");
    }

    fn value(&mut self, v: &Value) {
        match v {
            Value::Null => self.null(),
            Value::Bool(true) => self.raw(b"t"),
            Value::Bool(false) => self.raw(b"f"),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    self.len_prefixed(b'i', i.to_string().as_bytes());
                } else if let Some(u) = n.as_u64() {
                    self.len_prefixed(b'i', u.to_string().as_bytes());
                } else {
                    self.len_prefixed(b'd', n.to_string().as_bytes());
                }
            }
            Value::String(s) => self.string(s),
            Value::Array(items) => {
                self.raw(b"l");
                self.raw(items.len().to_string().as_bytes());
                self.raw(b"[");
                for item in items {
                    self.value(item);
                }
                self.raw(b"]");
            }
            Value::Object(map) => self.object(map),
        }
    }
}

/// Rebuild `value` with every object's keys in sorted order.
pub fn canonical_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                out.insert(key.clone(), canonical_json(&map[key]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical_json).collect()),
        other => other.clone(),
    }
}

/// Serialize `value` as sorted-key, minified UTF-8 JSON.
pub fn canonical_json_bytes(value: &Value) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&canonical_json(value))
}
