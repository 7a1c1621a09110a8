use kiln_types::primitives::Hash;

/// Compute the BLAKE3 hash of the given data.
pub fn blake3_hash(data: &[u8]) -> Hash {
    *blake3::hash(data).as_bytes()
}

/// Compute a BLAKE3 hash with domain separation.
/// The context string ensures different uses of hashing produce different outputs.
pub fn blake3_hash_domain(context: &str, data: &[u8]) -> Hash {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// Hash multiple pieces of data together under a domain context.
pub fn blake3_hash_domain_multi(context: &str, parts: &[&[u8]]) -> Hash {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    for part in parts {
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blake3_hash_deterministic() {
        let data = b"hello kiln";
        let h1 = blake3_hash(data);
        let h2 = blake3_hash(data);
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_blake3_hash_different_inputs() {
        let h1 = blake3_hash(b"hello");
        let h2 = blake3_hash(b"world");
        assert_ne!(h1, h2);
    }

    #[test]
    fn test_blake3_domain_separation() {
        let data = b"same data";
        let h1 = blake3_hash_domain("context-a", data);
        let h2 = blake3_hash_domain("context-b", data);
        assert_ne!(h1, h2);
    }

    #[test]
    fn test_blake3_domain_multi_matches_concatenation_hasher() {
        let h = blake3_hash_domain_multi("kiln.test", &[b"hello", b" ", b"world"]);
        let mut hasher = blake3::Hasher::new_derive_key("kiln.test");
        hasher.update(b"hello");
        hasher.update(b" ");
        hasher.update(b"world");
        assert_eq!(h, *hasher.finalize().as_bytes());
    }
}
