//! Direct Postgres transport
//!
//! Bypasses the generic execute function. Needed to provision that function
//! in the first place, and able to run a whole plan in one transaction.

use crate::config::DatabaseConfig;
use crate::error::{AppError, RemoteFailure};
use crate::executor::Transport;
use crate::migration::{ProtectedTable, Statement};
use async_trait::async_trait;
use deadpool_postgres::{Config, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio_postgres::NoTls;
use tracing::{debug, info};

pub struct PostgresTransport {
    pool: Pool,
}

impl PostgresTransport {
    /// Create the pool and verify it with a round trip
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, AppError> {
        let pool = Self::create_pool(config)?;

        let client = pool.get().await?;
        client.query_one("SELECT 1", &[]).await?;
        drop(client);

        info!(
            "✅ Direct database connection to {}:{}/{} (TLS: {})",
            config.host, config.port, config.database, config.require_tls
        );
        Ok(Self { pool })
    }

    fn create_pool(config: &DatabaseConfig) -> Result<Pool, AppError> {
        let mut cfg = Config::new();
        cfg.host = Some(config.host.clone());
        cfg.port = Some(config.port);
        cfg.user = Some(config.user.clone());
        cfg.password = Some(config.password.clone());
        cfg.dbname = Some(config.database.clone());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = Some(deadpool_postgres::PoolConfig::new(config.max_pool_size.max(1)));

        if config.require_tls {
            let certs = rustls_native_certs::load_native_certs();
            let mut root_store = rustls::RootCertStore::empty();
            for cert in certs.certs {
                root_store.add(cert).ok();
            }

            let tls_config = rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth();
            let tls = tokio_postgres_rustls::MakeRustlsConnect::new(tls_config);

            cfg.create_pool(Some(Runtime::Tokio1), tls)
                .map_err(|e| AppError::Internal(format!("Failed to create TLS pool: {}", e)))
        } else {
            cfg.create_pool(Some(Runtime::Tokio1), NoTls)
                .map_err(|e| AppError::Internal(format!("Failed to create pool: {}", e)))
        }
    }

    async fn client(&self) -> Result<deadpool_postgres::Object, RemoteFailure> {
        self.pool
            .get()
            .await
            .map_err(|e| RemoteFailure::transport(format!("Database pool error: {}", e)))
    }
}

#[async_trait]
impl Transport for PostgresTransport {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn execute(&self, sql: &str) -> Result<(), RemoteFailure> {
        let client = self.client().await?;
        client.batch_execute(sql).await.map_err(|e| RemoteFailure::from(&e))
    }

    fn supports_transactions(&self) -> bool {
        true
    }

    async fn execute_atomic(&self, statements: &[Statement]) -> Result<(), RemoteFailure> {
        let mut client = self.client().await?;
        let transaction = client.transaction().await.map_err(|e| RemoteFailure::from(&e))?;

        for statement in statements {
            debug!("In transaction: {}", statement.text);
            // Dropping the transaction without commit rolls it back
            transaction
                .batch_execute(&statement.text)
                .await
                .map_err(|e| RemoteFailure::from(&e))?;
        }

        transaction.commit().await.map_err(|e| RemoteFailure::from(&e))
    }

    async fn list_policies(&self, table: &ProtectedTable) -> Result<Option<Vec<String>>, RemoteFailure> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT policyname::text FROM pg_policies \
                 WHERE schemaname = $1 AND tablename = $2 ORDER BY policyname",
                &[&table.schema, &table.name],
            )
            .await
            .map_err(|e| RemoteFailure::from(&e))?;

        Ok(Some(rows.iter().map(|r| r.get::<_, String>(0)).collect()))
    }
}
