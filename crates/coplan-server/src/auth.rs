//! JWT credential verification.
//!
//! Tokens are HS256-signed by the login service with a shared secret and
//! carry the user's id, email, name and role.

use anyhow::Result;
use async_trait::async_trait;
use coplan_core::{AuthError, Authenticator, Identity};
use jsonwebtoken::{decode, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Deserializer, Serialize};

/// Token claims.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// User id. Issued as a number or a string.
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub role: String,
    /// Expiration time (Unix seconds).
    pub exp: i64,
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(i64),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Text(s) => s,
        Id::Number(n) => n.to_string(),
    })
}

impl From<Claims> for Identity {
    fn from(claims: Claims) -> Self {
        Identity {
            id: claims.id,
            email: claims.email,
            name: claims.name,
            role: claims.role,
        }
    }
}

/// Verifies HS256 tokens with a shared secret.
pub struct JwtAuthenticator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    /// Create an authenticator.
    ///
    /// # Errors
    ///
    /// Returns an error if the secret is empty.
    pub fn new(secret: &str) -> Result<Self> {
        if secret.trim().is_empty() {
            anyhow::bail!("auth.jwt_secret is not set (COPLAN_AUTH__JWT_SECRET)");
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp"]);

        Ok(Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    /// Verify a token and return its claims.
    ///
    /// # Errors
    ///
    /// Returns an error if the signature, algorithm or expiry is invalid.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::InvalidCredential(e.to_string()),
            })
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn authenticate(&self, credential: &str) -> Result<Identity, AuthError> {
        self.verify(credential).map(Identity::from)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::{json, Value};
    use std::time::{SystemTime, UNIX_EPOCH};

    pub(crate) const SECRET: &str = "test-secret";

    fn now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
    }

    pub(crate) fn token_for(claims: &Value, secret: &str) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    pub(crate) fn valid_token(id: &str, name: &str, role: &str) -> String {
        token_for(
            &json!({ "id": id, "email": format!("{id}@school.edu"), "name": name, "role": role, "exp": now() + 3600 }),
            SECRET,
        )
    }

    #[tokio::test]
    async fn test_valid_token() {
        let auth = JwtAuthenticator::new(SECRET).unwrap();
        let identity = auth
            .authenticate(&valid_token("u1", "Ada", "student"))
            .await
            .unwrap();

        assert_eq!(identity.id, "u1");
        assert_eq!(identity.name, "Ada");
        assert_eq!(identity.role, "student");
        assert_eq!(identity.email, "u1@school.edu");
    }

    #[tokio::test]
    async fn test_numeric_id() {
        let auth = JwtAuthenticator::new(SECRET).unwrap();
        let token = token_for(&json!({ "id": 42, "role": "counselor", "exp": now() + 60 }), SECRET);

        let identity = auth.authenticate(&token).await.unwrap();
        assert_eq!(identity.id, "42");
        assert_eq!(identity.role, "counselor");
    }

    #[tokio::test]
    async fn test_rejects_bad_tokens() {
        let auth = JwtAuthenticator::new(SECRET).unwrap();

        let wrong_secret = token_for(&json!({ "id": "u1", "exp": now() + 60 }), "other");
        assert!(matches!(
            auth.authenticate(&wrong_secret).await,
            Err(AuthError::InvalidCredential(_))
        ));

        let expired = token_for(&json!({ "id": "u1", "exp": now() - 3600 }), SECRET);
        assert!(matches!(auth.authenticate(&expired).await, Err(AuthError::Expired)));

        assert!(matches!(
            auth.authenticate("not-a-jwt").await,
            Err(AuthError::InvalidCredential(_))
        ));
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(JwtAuthenticator::new("").is_err());
        assert!(JwtAuthenticator::new("  ").is_err());
    }
}
