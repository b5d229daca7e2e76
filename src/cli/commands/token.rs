use clap::Subcommand;
use serde_json::json;

use crate::cli::utils::output_success;
use crate::cli::OutputFormat;
use crate::config;
use crate::guard::{CredentialIssuer, Role, TenantGuard};

#[derive(Subcommand)]
pub enum TokenCommands {
    #[command(about = "Sign a credential for a subject and tenant")]
    Issue {
        #[arg(long, help = "Subject identifier")]
        subject: String,
        #[arg(long, help = "Tenant UUID")]
        tenant: String,
        #[arg(long = "role", value_parser = parse_role, help = "Role to grant (repeatable)")]
        roles: Vec<Role>,
    },

    #[command(about = "Verify a credential and show its tenant context")]
    Inspect {
        #[arg(help = "Signed credential")]
        credential: String,
    },
}

fn parse_role(raw: &str) -> Result<Role, String> {
    serde_json::from_value(json!(raw.to_lowercase()))
        .map_err(|_| format!("unknown role '{}' (expected admin, member, viewer or service)", raw))
}

pub fn handle(cmd: TokenCommands, output_format: OutputFormat) -> anyhow::Result<()> {
    let security = &config::config().security;

    match cmd {
        TokenCommands::Issue { subject, tenant, roles } => {
            // refuse to sign something the guard would reject
            crate::token::ContextToken::parse(&tenant)?;
            let issuer = CredentialIssuer::from_config(security)?;
            let credential = issuer.issue(&subject, Some(&tenant), roles)?;
            output_success(
                &output_format,
                "Credential issued",
                Some(json!({ "credential": credential })),
            )
        }
        TokenCommands::Inspect { credential } => {
            let guard = TenantGuard::from_config(security)?;
            let context = guard.authenticate(Some(&credential))?;
            output_success(
                &output_format,
                "Credential is valid",
                Some(json!({
                    "subject": context.subject,
                    "tenant": context.token,
                    "roles": context.roles,
                    "expires_at": context.expires_at,
                })),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_roles() {
        assert_eq!(parse_role("admin").unwrap(), Role::Admin);
        assert_eq!(parse_role("Service").unwrap(), Role::Service);
        assert!(parse_role("root").is_err());
    }
}
