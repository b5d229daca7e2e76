mod common;

use anyhow::Result;
use monk_scope::{ContextToken, GuardError, TenantGuard, TokenError};

#[test]
fn context_token_boundaries() {
    assert!(matches!(ContextToken::parse(""), Err(TokenError::InvalidTenantFormat(_))));
    assert!(matches!(ContextToken::parse("not-a-uuid"), Err(TokenError::InvalidTenantFormat(_))));
    assert!(matches!(ContextToken::from_claim(None), Err(TokenError::InvalidTenantFormat(_))));
    assert!(ContextToken::parse("123e4567-e89b-12d3-a456-426614174000").is_ok());
}

#[test]
fn credential_without_tenant_is_rejected() -> Result<()> {
    let guard = TenantGuard::new(common::SECRET, 0)?;
    let jwt = common::credential(None, vec![]);

    assert_eq!(guard.authenticate(Some(&jwt)).unwrap_err(), GuardError::MissingTenantClaim);
    Ok(())
}

#[test]
fn credential_yields_context_token() -> Result<()> {
    let guard = TenantGuard::new(common::SECRET, 0)?;
    let jwt = common::credential(Some(&common::TENANT_A.to_uppercase()), vec![]);

    let context = guard.authenticate(Some(&jwt))?;
    assert_eq!(context.token, common::token(common::TENANT_A));
    assert_eq!(context.subject.as_str(), "user-1");
    Ok(())
}
