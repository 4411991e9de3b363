//! Providers and dataset persistence

pub mod circuit_breaker;
pub mod memory;
pub mod provider;
pub mod schema;
pub mod store;
pub mod theta;

pub use circuit_breaker::CircuitBreaker;
pub use memory::InMemoryProvider;
pub use provider::{MarketDataProvider, ProviderError};
pub use store::{read_dataset, DatasetInfo, DatasetStore, StagedWrite, StoreError};
pub use theta::ThetaProvider;
