use sha2::{Digest, Sha256};

const FINGERPRINT_LEN: usize = 16;

pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Short, stable digest used as clip identity and relationship target.
pub fn fingerprint(content: &str) -> String {
    let mut digest = sha256_hex(content);
    digest.truncate(FINGERPRINT_LEN);
    digest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        let a = sha256_hex("hello");
        let b = sha256_hex("hello");
        let c = sha256_hex("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn fingerprint_is_short_prefix_of_digest() {
        let print = fingerprint("hello");
        assert_eq!(print.len(), FINGERPRINT_LEN);
        assert!(sha256_hex("hello").starts_with(&print));
        assert_ne!(print, fingerprint("hello!"));
    }
}
