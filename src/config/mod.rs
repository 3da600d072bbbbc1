pub mod schema;

pub use schema::{
    resolve_config_dir, AccountConfig, Config, GoodsConfig, ReliabilityConfig, SchedulerConfig,
    StorageConfig, TimingConfig, TokenConfig, TransportConfig,
};
