//! Key-namespace provider over a shared Redis instance.
//!
//! Redis offers no true tenancy; isolation is a unique key prefix per
//! sandbox. Deprovision scans the prefix and deletes whatever the sandbox
//! left behind.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::{error, info};

use crate::error::{Error, Result};
use crate::model::ServiceCredentials;
use crate::providers::ServiceProvider;

const SCAN_BATCH: usize = 100;

pub struct RedisProvider {
    conn: ConnectionManager,
    host: String,
    port: u16,
    password: String,
}

impl RedisProvider {
    pub fn new(conn: ConnectionManager, host: String, port: u16, password: String) -> Self {
        Self { conn, host, port, password }
    }

    fn key_prefix(sandbox_id: &str) -> String {
        format!("sandbox:{sandbox_id}:")
    }
}

#[async_trait]
impl ServiceProvider for RedisProvider {
    fn service_type(&self) -> &str {
        "redis"
    }

    async fn provision(&self, sandbox_id: &str, _name: &str) -> Result<ServiceCredentials> {
        let prefix = Self::key_prefix(sandbox_id);
        let mut conn = self.conn.clone();
        // Marker key makes the namespace observable before the sandbox
        // writes anything of its own.
        conn.set::<_, _, ()>(format!("{prefix}provisioned"), "1")
            .await?;

        info!(sandbox_id, %prefix, "provisioned redis namespace");

        Ok(ServiceCredentials {
            host: self.host.clone(),
            port: Some(self.port),
            password: self.password.clone(),
            prefix,
            ..Default::default()
        })
    }

    async fn deprovision(&self, sandbox_id: &str, name: &str) -> Result<()> {
        let pattern = format!("{}*", Self::key_prefix(sandbox_id));
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut deleted = 0usize;

        loop {
            let scan: std::result::Result<(u64, Vec<String>), redis::RedisError> =
                redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(SCAN_BATCH)
                    .query_async(&mut conn)
                    .await;
            let (next, keys) = match scan {
                Ok(result) => result,
                Err(err) => {
                    error!(sandbox_id, "scan during {name} deprovision: {err}");
                    return Ok(());
                }
            };

            for chunk in keys.chunks(SCAN_BATCH) {
                if chunk.is_empty() {
                    continue;
                }
                if let Err(err) = conn.del::<_, ()>(chunk.to_vec()).await {
                    error!(sandbox_id, "delete during {name} deprovision: {err}");
                } else {
                    deleted += chunk.len();
                }
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        info!(sandbox_id, deleted, "deprovisioned redis namespace");
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|err| Error::Provider(format!("redis health check: {err}")))?;
        if pong != "PONG" {
            return Err(Error::Provider(format!("unexpected ping reply '{pong}'")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_is_scoped_to_sandbox() {
        assert_eq!(RedisProvider::key_prefix("abc123"), "sandbox:abc123:");
    }
}
