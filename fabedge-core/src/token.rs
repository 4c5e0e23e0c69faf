use std::time::Duration;

use aws_lc_rs::rand::SystemRandom;
use aws_lc_rs::signature::{
    EcdsaKeyPair, KeyPair, UnparsedPublicKey, ECDSA_P256_SHA256_FIXED,
    ECDSA_P256_SHA256_FIXED_SIGNING,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("The key is not a usable P-256 key!")]
    BadKey,
    #[error("The token is malformed!")]
    Malformed,
    #[error("The token signature is invalid!")]
    BadSignature,
    #[error("The token is expired!")]
    Expired,
    #[error("Signing failed!")]
    Signing,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct TokenClaims {
    pub cluster: String,
    pub exp: i64,
}

/// Issues and verifies bootstrap tokens: a compact signed envelope
/// `base64url(claims).base64url(signature)` carrying the member cluster name
/// and an expiry, signed with the operator's private key (the CA key).
pub struct TokenManager {
    key: EcdsaKeyPair,
    rng: SystemRandom,
}

impl TokenManager {
    pub fn from_pkcs8(pkcs8_der: &[u8]) -> Result<Self, TokenError> {
        let key = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8_der)
            .map_err(|_| TokenError::BadKey)?;

        Ok(Self {
            key,
            rng: SystemRandom::new(),
        })
    }

    pub fn generate(&self, cluster: &str, valid_for: Duration) -> Result<String, TokenError> {
        let claims = TokenClaims {
            cluster: cluster.to_owned(),
            exp: chrono::Utc::now().timestamp() + valid_for.as_secs() as i64,
        };
        let payload = serde_json::to_vec(&claims).map_err(|_| TokenError::Signing)?;

        let signature = self
            .key
            .sign(&self.rng, &payload)
            .map_err(|_| TokenError::Signing)?;

        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(signature.as_ref())
        ))
    }

    /// Checks the signature and expiry, returning the embedded claims.
    pub fn verify(&self, token: &str) -> Result<TokenClaims, TokenError> {
        let (payload, signature) = token.split_once('.').ok_or(TokenError::Malformed)?;

        let payload = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| TokenError::Malformed)?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| TokenError::Malformed)?;

        UnparsedPublicKey::new(&ECDSA_P256_SHA256_FIXED, self.key.public_key().as_ref())
            .verify(&payload, &signature)
            .map_err(|_| TokenError::BadSignature)?;

        let claims: TokenClaims =
            serde_json::from_slice(&payload).map_err(|_| TokenError::Malformed)?;

        if claims.exp <= chrono::Utc::now().timestamp() {
            return Err(TokenError::Expired);
        }

        Ok(claims)
    }
}

/// Reads a token's expiry without verifying it. Used when deciding whether a
/// stored enrollment token should be refreshed.
pub fn token_expiry(token: &str) -> Option<i64> {
    let (payload, _) = token.split_once('.')?;
    let payload = URL_SAFE_NO_PAD.decode(payload).ok()?;
    let claims: TokenClaims = serde_json::from_slice(&payload).ok()?;

    Some(claims.exp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::LocalCertManager;

    fn manager() -> TokenManager {
        let (cert_pem, key_pem) = LocalCertManager::generate_ca("fabedge.io", 3650).unwrap();
        let ca = LocalCertManager::new(cert_pem, key_pem, 365).unwrap();

        TokenManager::from_pkcs8(&ca.ca_key_pkcs8().unwrap()).unwrap()
    }

    #[test]
    fn token_roundtrip_yields_claims() {
        let manager = manager();

        let token = manager
            .generate("sh", Duration::from_secs(12 * 3600))
            .unwrap();
        let claims = manager.verify(&token).unwrap();

        assert_eq!(claims.cluster, "sh");
        assert!(claims.exp > chrono::Utc::now().timestamp());
        assert_eq!(token_expiry(&token), Some(claims.exp));
    }

    #[test]
    fn tampered_token_is_rejected() {
        let manager = manager();
        let token = manager
            .generate("sh", Duration::from_secs(12 * 3600))
            .unwrap();

        // flip one byte of the payload
        let mut bytes = token.into_bytes();
        bytes[3] = if bytes[3] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(bytes).unwrap();

        assert!(matches!(
            manager.verify(&tampered),
            Err(TokenError::BadSignature) | Err(TokenError::Malformed)
        ));
    }

    #[test]
    fn expired_token_is_rejected() {
        let manager = manager();
        let token = manager.generate("sh", Duration::from_secs(0)).unwrap();

        assert!(matches!(manager.verify(&token), Err(TokenError::Expired)));
    }

    #[test]
    fn tokens_from_another_operator_are_rejected() {
        let issuing = manager();
        let verifying = manager();

        let token = issuing
            .generate("sh", Duration::from_secs(3600))
            .unwrap();

        assert!(matches!(
            verifying.verify(&token),
            Err(TokenError::BadSignature)
        ));
    }
}
