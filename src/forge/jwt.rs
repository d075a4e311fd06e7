use crate::prelude::*;
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::Serialize;

const CLOCK_SKEW_SECONDS: i64 = 60;
const LIFETIME_SECONDS: i64 = 9 * 60;

#[derive(Serialize)]
struct Claims {
    iat: i64,
    exp: i64,
    iss: String,
}

/// Signs the short-lived App JWT used to authenticate the installation
/// token exchange. See DESIGN.md for why `jsonwebtoken` was added for this.
pub(super) fn mint_app_jwt(app_id: &str, private_key_pem: &[u8]) -> Fallible<String> {
    let now = Utc::now().timestamp();
    let claims = Claims {
        iat: now - CLOCK_SKEW_SECONDS,
        exp: now + LIFETIME_SECONDS,
        iss: app_id.to_string(),
    };

    let key = EncodingKey::from_rsa_pem(private_key_pem).context("parsing the forge private key")?;
    encode(&Header::new(Algorithm::RS256), &claims, &key).context("signing the app jwt")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_a_malformed_key() {
        let err = mint_app_jwt("123", b"not a pem key").unwrap_err();
        assert!(err.to_string().contains("parsing"));
    }
}
