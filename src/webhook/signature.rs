use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Verifies `X-Hub-Signature-256: sha256=<hex>` in constant time, via
/// `Mac::verify_slice`'s constant-time comparison rather than a hand-rolled
/// one.
pub fn verify_signature(secret: &str, payload: &[u8], raw_signature: &str) -> bool {
    let Some(hex_signature) = raw_signature.strip_prefix("sha256=") else {
        return false;
    };

    let Ok(signature) = crate::utils::hex::from_hex(hex_signature) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, payload: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(payload);
        let bytes = mac.finalize().into_bytes();
        format!("sha256={}", bytes.iter().map(|b| format!("{b:02x}")).collect::<String>())
    }

    #[test]
    fn accepts_a_correctly_signed_payload() {
        let signature = sign("secret", b"hello");
        assert!(verify_signature("secret", b"hello", &signature));
    }

    #[test]
    fn rejects_a_wrong_secret() {
        let signature = sign("secret", b"hello");
        assert!(!verify_signature("wrong", b"hello", &signature));
    }

    #[test]
    fn rejects_a_tampered_payload() {
        let signature = sign("secret", b"hello");
        assert!(!verify_signature("secret", b"goodbye", &signature));
    }

    #[test]
    fn rejects_a_missing_algorithm_prefix() {
        assert!(!verify_signature("secret", b"hello", "deadbeef"));
    }
}
