//! Infrastructure layer: wallet stores, the operation engine, configuration and wiring.

pub mod bootstrap;
pub mod config;
pub mod engine;
pub mod store;

pub use bootstrap::{DynWalletEngine, build_engine, build_engine_from_env};
pub use config::{ConfigError, EngineConfig, StoreBackend, StoreConfig};
pub use engine::WalletEngine;
pub use store::{
    Dependents, InMemoryWalletStore, PostgresWalletStore, StoreError, WalletStore, WalletTx,
};
