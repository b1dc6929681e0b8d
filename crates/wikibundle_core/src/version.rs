use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Bump whenever the serialized bundle format changes, so that cached
/// version hashes and client store keys roll over together.
pub const CACHE_VERSION: u32 = 1;

/// Short deterministic fingerprint: sha256 truncated to 16 hex characters.
pub fn make_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut output = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

/// Base record every definition summary must carry. Sources append their own
/// deterministic fields to this map.
pub fn base_summary(class: &str) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("_class".to_string(), Value::String(class.to_string()));
    map.insert("_cacheVersion".to_string(), Value::from(CACHE_VERSION));
    map
}

/// Whether a summary still carries the required base record.
pub fn has_base_fields(summary: &Value) -> bool {
    summary
        .as_object()
        .is_some_and(|map| map.contains_key("_class") && map.contains_key("_cacheVersion"))
}
