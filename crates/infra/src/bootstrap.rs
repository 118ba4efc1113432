//! Environment-driven wiring of a ready-to-use engine.

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing::info;

use crate::config::{EngineConfig, StoreBackend, StoreConfig};
use crate::engine::WalletEngine;
use crate::store::{InMemoryWalletStore, PostgresWalletStore, WalletStore};

pub type DynWalletEngine = WalletEngine<Arc<dyn WalletStore>>;

/// Build an engine over the backend selected by `store`.
///
/// For Postgres this connects, runs the bundled migrations and fails if either step does.
pub async fn build_engine(config: EngineConfig, store: &StoreConfig) -> anyhow::Result<DynWalletEngine> {
    let store: Arc<dyn WalletStore> = match &store.backend {
        StoreBackend::InMemory => {
            info!("using in-memory wallet store");
            Arc::new(InMemoryWalletStore::new())
        }
        StoreBackend::Postgres { database_url } => {
            info!("connecting to Postgres wallet store");
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(database_url)
                .await
                .context("failed to connect to Postgres")?;

            let store = PostgresWalletStore::new(pool);
            store.migrate().await.context("failed to run migrations")?;
            Arc::new(store)
        }
    };

    Ok(WalletEngine::with_config(store, config))
}

/// `build_engine` with both configs read from the environment.
pub async fn build_engine_from_env() -> anyhow::Result<DynWalletEngine> {
    let store = StoreConfig::from_env()?;
    build_engine(EngineConfig::from_env(), &store).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use coffer_wallet::CatalogItem;

    #[tokio::test]
    async fn in_memory_backend_is_usable() {
        let config = EngineConfig {
            initial_credit: 50,
            ..EngineConfig::default()
        };
        let engine = build_engine(config, &StoreConfig::default()).await.unwrap();

        let account = engine.open_account().await.unwrap();
        assert_eq!(account.balance, 50);

        let view = engine
            .purchase(account.id, CatalogItem::new("cid_001", "Raider", 20))
            .await
            .unwrap();
        assert_eq!(view.balance, 30);
    }
}
