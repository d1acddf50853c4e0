pub mod config;
pub mod poll;

pub use config::{
    ClusterConfig, ConfigError, FleetConfig, NodeConfig, ReconcilerConfig, STORE_ENDPOINT_ENV,
    StoreBackend, StoreConfig,
};
pub use poll::PollPolicy;
