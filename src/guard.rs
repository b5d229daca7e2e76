use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::config::SecurityConfig;
use crate::token::{ContextToken, TokenError};

/// Credential-layer failures; all surface as authentication denied
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardError {
    #[error("Missing credential")]
    MissingCredential,

    #[error("Malformed credential: {0}")]
    MalformedCredential(String),

    #[error("Credential has no tenant claim")]
    MissingTenantClaim,

    #[error("Invalid tenant format: {0}")]
    InvalidTenantFormat(String),

    #[error("Credential expired")]
    ExpiredCredential,

    #[error("Credential secret is not configured")]
    InvalidSecret,

    #[error("Credential signing failed: {0}")]
    Signing(String),
}

impl From<TokenError> for GuardError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::InvalidTenantFormat(msg) => GuardError::InvalidTenantFormat(msg),
        }
    }
}

/// Closed set of roles a credential may carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Member,
    Viewer,
    Service,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Member => "member",
            Role::Viewer => "viewer",
            Role::Service => "service",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire form of a signed credential
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(rename = "tenantId", default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub roles: Vec<Role>,
    pub iat: i64,
    pub exp: i64,
}

impl Claims {
    pub fn new(subject: impl Into<String>, tenant_id: Option<String>, roles: Vec<Role>, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            sub: subject.into(),
            tenant_id,
            roles,
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        }
    }
}

/// Authenticated subject identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SubjectId(String);

impl SubjectId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-request context produced once by [`TenantGuard`] and passed explicitly downstream
#[derive(Debug, Clone, Serialize)]
pub struct TenantContext {
    pub token: ContextToken,
    pub subject: SubjectId,
    pub roles: Vec<Role>,
    pub expires_at: DateTime<Utc>,
}

impl TenantContext {
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }
}

/// Verifies inbound credentials and extracts the tenant they are scoped to
#[derive(Clone)]
pub struct TenantGuard {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TenantGuard {
    pub fn new(secret: &str, leeway_secs: u64) -> Result<Self, GuardError> {
        if secret.is_empty() {
            return Err(GuardError::InvalidSecret);
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = leeway_secs;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    pub fn from_config(security: &SecurityConfig) -> Result<Self, GuardError> {
        Self::new(&security.jwt_secret, security.jwt_leeway_secs)
    }

    /// Validate a raw credential and produce the request's tenant context
    pub fn authenticate(&self, credential: Option<&str>) -> Result<TenantContext, GuardError> {
        let credential = credential
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or(GuardError::MissingCredential)?;

        let data = decode::<Claims>(credential, &self.decoding_key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => GuardError::ExpiredCredential,
                _ => GuardError::MalformedCredential(e.to_string()),
            }
        })?;
        let claims = data.claims;

        let tenant = claims.tenant_id.as_deref().ok_or(GuardError::MissingTenantClaim)?;
        let token = ContextToken::parse(tenant)?;

        let expires_at = Utc
            .timestamp_opt(claims.exp, 0)
            .single()
            .ok_or_else(|| GuardError::MalformedCredential("exp out of range".to_string()))?;

        tracing::debug!("Authenticated subject '{}' for tenant {}", claims.sub, token);

        Ok(TenantContext {
            token,
            subject: SubjectId(claims.sub),
            roles: claims.roles,
            expires_at,
        })
    }

    /// Validate an `Authorization` header value of the form `Bearer <jwt>`
    pub fn authenticate_header(&self, header: Option<&str>) -> Result<TenantContext, GuardError> {
        let header = header.map(str::trim).filter(|h| !h.is_empty());
        let Some(header) = header else {
            return Err(GuardError::MissingCredential);
        };
        match header.strip_prefix("Bearer ") {
            Some(token) => self.authenticate(Some(token)),
            None => Err(GuardError::MalformedCredential(
                "Authorization header must use Bearer token format".to_string(),
            )),
        }
    }
}

/// Signs credentials; used by the CLI and tests
pub struct CredentialIssuer {
    encoding_key: EncodingKey,
    ttl: Duration,
}

impl CredentialIssuer {
    pub fn new(secret: &str, ttl: Duration) -> Result<Self, GuardError> {
        if secret.is_empty() {
            return Err(GuardError::InvalidSecret);
        }
        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            ttl,
        })
    }

    pub fn from_config(security: &SecurityConfig) -> Result<Self, GuardError> {
        Self::new(
            &security.jwt_secret,
            Duration::hours(security.jwt_expiry_hours as i64),
        )
    }

    pub fn issue(&self, subject: &str, tenant_id: Option<&str>, roles: Vec<Role>) -> Result<String, GuardError> {
        let claims = Claims::new(subject, tenant_id.map(str::to_string), roles, self.ttl);
        self.sign(&claims)
    }

    pub fn sign(&self, claims: &Claims) -> Result<String, GuardError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(|e| GuardError::Signing(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret";
    const TENANT: &str = "123e4567-e89b-12d3-a456-426614174000";

    fn guard() -> TenantGuard {
        TenantGuard::new(SECRET, 0).unwrap()
    }

    fn issuer() -> CredentialIssuer {
        CredentialIssuer::new(SECRET, Duration::hours(1)).unwrap()
    }

    #[test]
    fn authenticates_valid_credential() {
        let jwt = issuer().issue("user-1", Some(TENANT), vec![Role::Admin]).unwrap();
        let ctx = guard().authenticate(Some(&jwt)).unwrap();

        assert_eq!(ctx.token.canonical(), TENANT);
        assert_eq!(ctx.subject.as_str(), "user-1");
        assert!(ctx.has_role(Role::Admin));
        assert!(!ctx.has_role(Role::Viewer));
    }

    #[test]
    fn missing_tenant_claim_is_rejected() {
        let jwt = issuer().issue("user-1", None, vec![]).unwrap();
        assert_eq!(guard().authenticate(Some(&jwt)).unwrap_err(), GuardError::MissingTenantClaim);
    }

    #[test]
    fn invalid_tenant_claim_is_rejected() {
        let jwt = issuer().issue("user-1", Some("acme"), vec![]).unwrap();
        assert!(matches!(
            guard().authenticate(Some(&jwt)),
            Err(GuardError::InvalidTenantFormat(_))
        ));
    }

    #[test]
    fn expired_credential_is_rejected() {
        let mut claims = Claims::new("user-1", Some(TENANT.to_string()), vec![], Duration::hours(1));
        claims.exp = (Utc::now() - Duration::hours(2)).timestamp();
        let jwt = issuer().sign(&claims).unwrap();

        assert_eq!(guard().authenticate(Some(&jwt)).unwrap_err(), GuardError::ExpiredCredential);
    }

    #[test]
    fn wrong_signature_is_malformed() {
        let other = CredentialIssuer::new("other-secret", Duration::hours(1)).unwrap();
        let jwt = other.issue("user-1", Some(TENANT), vec![]).unwrap();
        assert!(matches!(
            guard().authenticate(Some(&jwt)),
            Err(GuardError::MalformedCredential(_))
        ));
    }

    #[test]
    fn unknown_role_is_malformed() {
        let claims = serde_json::json!({
            "sub": "user-1",
            "tenantId": TENANT,
            "roles": ["superuser"],
            "iat": Utc::now().timestamp(),
            "exp": (Utc::now() + Duration::hours(1)).timestamp(),
        });
        let jwt = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();

        assert!(matches!(
            guard().authenticate(Some(&jwt)),
            Err(GuardError::MalformedCredential(_))
        ));
    }

    #[test]
    fn missing_and_garbage_credentials() {
        assert_eq!(guard().authenticate(None).unwrap_err(), GuardError::MissingCredential);
        assert_eq!(guard().authenticate(Some("  ")).unwrap_err(), GuardError::MissingCredential);
        assert!(matches!(
            guard().authenticate(Some("not.a.jwt")),
            Err(GuardError::MalformedCredential(_))
        ));
    }

    #[test]
    fn header_requires_bearer_scheme() {
        let jwt = issuer().issue("user-1", Some(TENANT), vec![]).unwrap();
        assert!(guard().authenticate_header(Some(&format!("Bearer {}", jwt))).is_ok());
        assert!(matches!(
            guard().authenticate_header(Some(&format!("Basic {}", jwt))),
            Err(GuardError::MalformedCredential(_))
        ));
        assert_eq!(guard().authenticate_header(None).unwrap_err(), GuardError::MissingCredential);
    }

    #[test]
    fn empty_secret_is_refused() {
        assert!(matches!(TenantGuard::new("", 0), Err(GuardError::InvalidSecret)));
        assert!(matches!(
            CredentialIssuer::new("", Duration::hours(1)),
            Err(GuardError::InvalidSecret)
        ));
    }
}
