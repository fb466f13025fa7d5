//! Bearer token and password verification.
//!
//! Tokens are HMAC-signed JWTs carrying a `username` claim and an `exp`
//! expiry. Anything signed outside the HMAC family is rejected before its
//! signature is even looked at. Passwords are stored as bcrypt hashes.

use crate::error::AuthError;
use crate::utils::get_unix_time;
use jsonwebtoken::errors::ErrorKind as JwtErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use log::warn;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    username: String,
    exp: u64,
}

pub struct AuthGateway {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    token_ttl: Duration,
    bcrypt_cost: u32,
}

impl AuthGateway {
    pub fn new(secret: &[u8], token_ttl: Duration, bcrypt_cost: u32) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.algorithms = vec![Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];

        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            token_ttl,
            bcrypt_cost,
        }
    }

    /// Issues an HS256 token for `username` that expires after the configured TTL.
    pub fn issue_token(&self, username: &str) -> Result<String, AuthError> {
        self.sign(username, get_unix_time() + self.token_ttl.as_secs())
    }

    fn sign(&self, username: &str, exp: u64) -> Result<String, AuthError> {
        let claims = Claims {
            username: username.to_string(),
            exp,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Invalid(e.to_string()))
    }

    /// Checks signature, algorithm family and expiry, then returns the
    /// identity embedded in the token.
    pub fn verify_token(&self, token: &str) -> Result<String, AuthError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(|e| {
            match e.kind() {
                JwtErrorKind::ExpiredSignature => AuthError::Expired,
                kind => {
                    warn!("Rejected token: {:?}", kind);
                    AuthError::Invalid(e.to_string())
                }
            }
        })?;

        if data.claims.username.is_empty() {
            return Err(AuthError::Invalid("token carries an empty username".to_string()));
        }

        Ok(data.claims.username)
    }

    /// Salted bcrypt hash. Deliberately slow; call from a blocking context.
    pub fn hash_password(&self, password: &str) -> Result<String, bcrypt::BcryptError> {
        bcrypt::hash(password, self.bcrypt_cost)
    }

    /// Returns false for a wrong password and for a malformed stored hash.
    pub fn verify_password(&self, password: &str, hash: &str) -> bool {
        match bcrypt::verify(password, hash) {
            Ok(matches) => matches,
            Err(e) => {
                warn!("Password check failed: {}", e);
                false
            }
        }
    }
}
