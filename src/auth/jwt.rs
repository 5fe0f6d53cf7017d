//! JWT validation for streaming clients.
//!
//! Credentials arrive as a bearer header, a `token` query parameter, or a
//! cookie; all validate against the same shared secret. Upstream issuers are
//! not consistent about the id claim, so three field names are accepted.

use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::DetectionError;

/// The synthetic identity served when demo mode is enabled and no credential
/// is presented.
pub const DEMO_USER_ID: &str = "demo-user";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub uid: Option<String>,
    #[serde(default)]
    pub tenant: Option<String>,
    pub exp: usize,
}

impl Claims {
    /// The user identifier under any of the three accepted claim names.
    pub fn resolve_user_id(&self) -> Option<&str> {
        self.user_id
            .as_deref()
            .or(self.sub.as_deref())
            .or(self.uid.as_deref())
    }
}

/// An authenticated (or demo) streaming client.
#[derive(Debug, Clone)]
pub struct AuthedUser {
    pub user_id: String,
    pub tenant: Option<String>,
    pub demo: bool,
}

pub struct JwtGate {
    secret: String,
    demo_mode: bool,
}

impl JwtGate {
    pub fn new(secret: String, demo_mode: bool) -> Self {
        Self { secret, demo_mode }
    }

    pub fn demo_mode(&self) -> bool {
        self.demo_mode
    }

    /// Validate a raw token and resolve the user identity.
    pub fn validate(&self, token: &str) -> Result<AuthedUser, DetectionError> {
        let decoded = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|e| DetectionError::Auth(format!("invalid or expired token: {e}")))?;

        let user_id = decoded
            .claims
            .resolve_user_id()
            .ok_or_else(|| {
                DetectionError::Auth("token carries no user identifier".to_string())
            })?
            .to_string();

        debug!(user = %user_id, "streaming credential validated");

        Ok(AuthedUser {
            user_id,
            tenant: decoded.claims.tenant,
            demo: false,
        })
    }

    /// Resolve an optional credential: a valid token wins, a missing one falls
    /// back to demo mode when enabled, anything else is an auth error.
    pub fn authenticate(&self, token: Option<&str>) -> Result<AuthedUser, DetectionError> {
        match token {
            Some(token) => self.validate(token),
            None if self.demo_mode => Ok(AuthedUser {
                user_id: DEMO_USER_ID.to_string(),
                tenant: None,
                demo: true,
            }),
            None => Err(DetectionError::Auth(
                "missing authorization credential".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    const SECRET: &str = "test-secret-key-12345";

    fn token_for(claims: serde_json::Value) -> String {
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn future_exp() -> usize {
        (chrono::Utc::now().timestamp() + 3600) as usize
    }

    #[test]
    fn test_accepts_all_three_id_claims() {
        let gate = JwtGate::new(SECRET.to_string(), false);

        for field in ["sub", "user_id", "uid"] {
            let token = token_for(json!({field: "u-42", "exp": future_exp()}));
            let user = gate.validate(&token).unwrap();
            assert_eq!(user.user_id, "u-42");
            assert!(!user.demo);
        }
    }

    #[test]
    fn test_user_id_claim_takes_precedence() {
        let gate = JwtGate::new(SECRET.to_string(), false);
        let token = token_for(json!({
            "sub": "from-sub",
            "user_id": "from-user-id",
            "exp": future_exp()
        }));
        assert_eq!(gate.validate(&token).unwrap().user_id, "from-user-id");
    }

    #[test]
    fn test_rejects_wrong_secret_and_garbage() {
        let gate = JwtGate::new("other-secret".to_string(), false);
        let token = token_for(json!({"sub": "u-42", "exp": future_exp()}));
        assert!(gate.validate(&token).is_err());
        assert!(gate.validate("not.a.token").is_err());
    }

    #[test]
    fn test_token_without_identity_rejected() {
        let gate = JwtGate::new(SECRET.to_string(), false);
        let token = token_for(json!({"exp": future_exp()}));
        let err = gate.validate(&token).unwrap_err();
        assert_eq!(err.code(), "auth_error");
    }

    #[test]
    fn test_demo_mode_fallback() {
        let strict = JwtGate::new(SECRET.to_string(), false);
        assert!(strict.authenticate(None).is_err());

        let demo = JwtGate::new(SECRET.to_string(), true);
        let user = demo.authenticate(None).unwrap();
        assert_eq!(user.user_id, DEMO_USER_ID);
        assert!(user.demo);

        // A presented credential is still validated in demo mode.
        assert!(demo.authenticate(Some("garbage")).is_err());
    }

    #[test]
    fn test_tenant_claim_carried_through() {
        let gate = JwtGate::new(SECRET.to_string(), false);
        let token = token_for(json!({"sub": "u-1", "tenant": "acme", "exp": future_exp()}));
        assert_eq!(gate.validate(&token).unwrap().tenant.as_deref(), Some("acme"));
    }
}
