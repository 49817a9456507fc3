//! Shard strategy composition for logical tables.

pub mod proxy;
pub mod strategy;

pub use proxy::{ShardStrategyProxy, ShardStrategyProxyBuilder};
pub use strategy::{DbShardContext, Lifecycle, ShardStrategy, TableShardContext};
