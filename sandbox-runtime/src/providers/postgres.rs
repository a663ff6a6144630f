//! Dedicated-database provider: one database owned by one freshly created
//! role per sandbox.

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{error, info};

use crate::error::{Error, Result};
use crate::model::ServiceCredentials;
use crate::providers::ServiceProvider;
use crate::util::{generate_password, sql_safe};

pub struct PostgresProvider {
    admin: PgPool,
    /// Endpoint handed to sandbox containers (not necessarily the admin DSN
    /// host).
    host: String,
    port: u16,
}

impl PostgresProvider {
    pub fn new(admin: PgPool, host: String, port: u16) -> Self {
        Self { admin, host, port }
    }

    fn database_name(sandbox_id: &str) -> String {
        format!("sandbox_{}", sql_safe(sandbox_id))
    }

    fn role_name(sandbox_id: &str) -> String {
        format!("sandbox_user_{}", sql_safe(sandbox_id))
    }
}

/// Sandbox ids flow into SQL identifiers, which cannot be bound as
/// parameters. Reject anything outside the id alphabet before formatting.
fn validate_identifier(sandbox_id: &str) -> Result<()> {
    if sandbox_id.is_empty()
        || !sandbox_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::Validation(format!(
            "invalid sandbox id '{sandbox_id}'"
        )));
    }
    Ok(())
}

#[async_trait]
impl ServiceProvider for PostgresProvider {
    fn service_type(&self) -> &str {
        "postgres"
    }

    async fn provision(&self, sandbox_id: &str, name: &str) -> Result<ServiceCredentials> {
        validate_identifier(sandbox_id)?;
        let database = Self::database_name(sandbox_id);
        let role = Self::role_name(sandbox_id);
        let password = generate_password();

        sqlx::query(&format!(
            "CREATE ROLE \"{role}\" WITH LOGIN PASSWORD '{password}'"
        ))
        .execute(&self.admin)
        .await
        .map_err(|err| Error::Provider(format!("create role for {name}: {err}")))?;

        // CREATE DATABASE cannot run inside a transaction; compensate the
        // role by hand if it fails.
        if let Err(err) = sqlx::query(&format!("CREATE DATABASE \"{database}\" OWNER \"{role}\""))
            .execute(&self.admin)
            .await
        {
            if let Err(drop_err) = sqlx::query(&format!("DROP ROLE IF EXISTS \"{role}\""))
                .execute(&self.admin)
                .await
            {
                error!(%role, "failed to drop role after database creation failure: {drop_err}");
            }
            return Err(Error::Provider(format!(
                "create database for {name}: {err}"
            )));
        }

        sqlx::query(&format!(
            "GRANT ALL PRIVILEGES ON DATABASE \"{database}\" TO \"{role}\""
        ))
        .execute(&self.admin)
        .await
        .map_err(|err| Error::Provider(format!("grant privileges for {name}: {err}")))?;

        info!(sandbox_id, %database, "provisioned postgres database");

        let uri = format!(
            "postgres://{role}:{password}@{}:{}/{database}",
            self.host, self.port
        );
        Ok(ServiceCredentials {
            host: self.host.clone(),
            port: Some(self.port),
            username: role,
            password,
            database,
            uri,
            ..Default::default()
        })
    }

    async fn deprovision(&self, sandbox_id: &str, name: &str) -> Result<()> {
        validate_identifier(sandbox_id)?;
        let database = Self::database_name(sandbox_id);
        let role = Self::role_name(sandbox_id);

        if let Err(err) = sqlx::query(&format!(
            "DROP DATABASE IF EXISTS \"{database}\" WITH (FORCE)"
        ))
        .execute(&self.admin)
        .await
        {
            error!(sandbox_id, %database, "drop database during {name} deprovision: {err}");
        }
        if let Err(err) = sqlx::query(&format!("DROP ROLE IF EXISTS \"{role}\""))
            .execute(&self.admin)
            .await
        {
            error!(sandbox_id, %role, "drop role during {name} deprovision: {err}");
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.admin)
            .await
            .map_err(|err| Error::Provider(format!("postgres health check: {err}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_derived_with_underscores() {
        assert_eq!(PostgresProvider::database_name("ab-12"), "sandbox_ab_12");
        assert_eq!(PostgresProvider::role_name("ab-12"), "sandbox_user_ab_12");
    }

    #[test]
    fn identifier_validation_rejects_injection() {
        assert!(validate_identifier("abc123def456").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("x\"; DROP TABLE").is_err());
        assert!(validate_identifier("a'b").is_err());
    }
}
