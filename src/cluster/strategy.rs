use crate::core::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Inputs for choosing the database shard of a statement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbShardContext {
    /// Logical database (cluster) name
    pub db_name: String,
    /// Explicit shard requested by the caller, bypassing the algorithm
    pub shard_hint: Option<u32>,
    /// Column name to value, as seen in the statement
    #[serde(default)]
    pub values: HashMap<String, String>,
}

impl DbShardContext {
    pub fn new(db_name: impl Into<String>) -> Self {
        Self {
            db_name: db_name.into(),
            ..Default::default()
        }
    }

    pub fn with_hint(mut self, shard: u32) -> Self {
        self.shard_hint = Some(shard);
        self
    }

    pub fn with_value(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(column.into(), value.into());
        self
    }
}

/// Inputs for choosing the table shard of a statement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableShardContext {
    pub db_name: String,
    /// Database shard already resolved for this statement, if any
    pub db_shard: Option<u32>,
    pub shard_hint: Option<String>,
    #[serde(default)]
    pub values: HashMap<String, String>,
}

impl TableShardContext {
    pub fn new(db_name: impl Into<String>) -> Self {
        Self {
            db_name: db_name.into(),
            ..Default::default()
        }
    }

    pub fn with_db_shard(mut self, shard: u32) -> Self {
        self.db_shard = Some(shard);
        self
    }

    pub fn with_hint(mut self, shard: impl Into<String>) -> Self {
        self.shard_hint = Some(shard.into());
        self
    }

    pub fn with_value(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(column.into(), value.into());
        self
    }
}

/// Pluggable sharding algorithm
///
/// Each strategy claims a fixed set of logical tables through
/// [`ShardStrategy::applied_tables`]; sets of different strategies must not overlap.
pub trait ShardStrategy: Send + Sync {
    /// Database shard for `table`, `None` when the context does not decide it.
    fn db_shard(&self, table: &str, context: &DbShardContext) -> Result<Option<u32>>;

    fn table_sharding_enabled(&self, table: &str) -> Result<bool>;

    /// Physical table suffix for `table`, `None` when the context does not decide it.
    fn table_shard(&self, table: &str, context: &TableShardContext) -> Result<Option<String>>;

    fn all_table_shards(&self, table: &str) -> Result<BTreeSet<String>>;

    /// Separator between logical table name and shard suffix.
    fn table_shard_separator(&self, table: &str) -> Result<Option<String>>;

    /// Logical tables this strategy owns.
    fn applied_tables(&self) -> Result<BTreeSet<String>>;
}

/// Start/stop hooks shared by managed cluster components.
pub trait Lifecycle {
    fn start(&self) -> Result<()>;

    fn stop(&self) -> Result<()>;
}
