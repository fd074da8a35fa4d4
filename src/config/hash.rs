//! Deterministic hashing for change detection.
//!
//! Resolved inputs are hashed in a canonical form (object keys sorted at
//! every depth) so that two runs over the same literals always agree,
//! whatever order a map happened to be built in.

use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

use crate::resource::{ResolvedInputs, ResourceDeclaration, StackOutput};

/// Hasher for inputs, declarations and plans.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Hashes resolved inputs. Used by convergence to detect changes.
    #[must_use]
    pub fn hash_inputs(inputs: &ResolvedInputs) -> String {
        let mut hasher = Sha256::new();
        for (name, value) in inputs {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
            update_canonical(&mut hasher, value);
            hasher.update([0xffu8]);
        }
        hex::encode(hasher.finalize())
    }

    /// Hashes the declaration set and stack outputs.
    ///
    /// Declaration order does not matter.
    #[must_use]
    pub fn hash_declarations(declarations: &[ResourceDeclaration], outputs: &[StackOutput]) -> String {
        let mut sorted: Vec<&ResourceDeclaration> = declarations.iter().collect();
        sorted.sort_by(|a, b| a.id.cmp(&b.id));

        let mut hasher = Sha256::new();
        for decl in sorted {
            hasher.update(decl.id.as_bytes());
            hasher.update([0u8]);
            hasher.update(decl.kind.as_str().as_bytes());
            for (name, value) in &decl.inputs {
                hasher.update(name.as_bytes());
                hasher.update([0u8]);
                update_canonical(&mut hasher, &JsonValue::from(value.clone()));
            }
            hasher.update([0xffu8]);
        }

        let mut outputs: Vec<&StackOutput> = outputs.iter().collect();
        outputs.sort_by(|a, b| a.name.cmp(&b.name));
        for output in outputs {
            hasher.update(output.name.as_bytes());
            hasher.update([0u8]);
            hasher.update(output.value.to_string().as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Hashes execution batches.
    #[must_use]
    pub fn hash_plan(batches: &[Vec<String>]) -> String {
        let mut hasher = Sha256::new();
        for batch in batches {
            for id in batch {
                hasher.update(id.as_bytes());
                hasher.update([0u8]);
            }
            hasher.update([0xffu8]);
        }
        hex::encode(hasher.finalize())
    }

    /// Hashes an arbitrary string, for identifiers derived from a seed.
    #[must_use]
    pub fn hash_str(value: &str) -> String {
        hex::encode(Sha256::digest(value.as_bytes()))
    }

    /// Returns the first 8 characters of a hash for display.
    #[must_use]
    pub fn short_hash(hash: &str) -> String {
        hash.chars().take(8).collect()
    }
}

/// Feeds a JSON value into the hasher with object keys sorted.
fn update_canonical(hasher: &mut Sha256, value: &JsonValue) {
    match value {
        JsonValue::Null => hasher.update(b"n"),
        JsonValue::Bool(b) => hasher.update(if *b { b"t" } else { b"f" }),
        JsonValue::Number(n) => {
            hasher.update(b"#");
            hasher.update(n.to_string().as_bytes());
        }
        JsonValue::String(s) => {
            hasher.update(b"s");
            hasher.update((s.len() as u64).to_be_bytes());
            hasher.update(s.as_bytes());
        }
        JsonValue::Array(items) => {
            hasher.update(b"[");
            for item in items {
                update_canonical(hasher, item);
            }
            hasher.update(b"]");
        }
        JsonValue::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            hasher.update(b"{");
            for key in keys {
                hasher.update((key.len() as u64).to_be_bytes());
                hasher.update(key.as_bytes());
                if let Some(item) = map.get(key) {
                    update_canonical(hasher, item);
                }
            }
            hasher.update(b"}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{Reference, ResourceKind, Value};
    use serde_json::json;

    #[test]
    fn test_input_hash_is_deterministic() {
        let mut a = ResolvedInputs::new();
        a.insert("cors".into(), json!({"b": 1, "a": [true, null]}));
        a.insert("authType".into(), json!("NONE"));

        let mut b = ResolvedInputs::new();
        b.insert("authType".into(), json!("NONE"));
        b.insert("cors".into(), json!({"a": [true, null], "b": 1}));

        assert_eq!(ConfigHasher::hash_inputs(&a), ConfigHasher::hash_inputs(&b));
    }

    #[test]
    fn test_input_hash_detects_changes() {
        let mut a = ResolvedInputs::new();
        a.insert("bucketName".into(), json!("thot-site.com"));
        let mut b = a.clone();
        b.insert("bucketName".into(), json!("thot-site.org"));

        assert_ne!(ConfigHasher::hash_inputs(&a), ConfigHasher::hash_inputs(&b));
    }

    #[test]
    fn test_declaration_hash_ignores_order() {
        let b1 = ResourceDeclaration::new("b1", ResourceKind::Bucket).with_input("bucketName", "x");
        let i1 = ResourceDeclaration::new("i1", ResourceKind::OriginAccessIdentity);
        let outputs = vec![StackOutput::new("Name", Reference::new("b1", "bucketName"))];

        let forward = ConfigHasher::hash_declarations(&[b1.clone(), i1.clone()], &outputs);
        let backward = ConfigHasher::hash_declarations(&[i1, b1.clone()], &outputs);
        assert_eq!(forward, backward);

        let changed = b1.with_input("websiteIndexDocument", Value::literal("index.html"));
        assert_ne!(forward, ConfigHasher::hash_declarations(&[changed], &outputs));
    }

    #[test]
    fn test_short_hash() {
        assert_eq!(ConfigHasher::short_hash("abcdef1234567890"), "abcdef12");
    }
}
