use super::strategy::{DbShardContext, Lifecycle, ShardStrategy, TableShardContext};
use crate::core::{DalError, Result};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

fn same_strategy(a: &Arc<dyn ShardStrategy>, b: &Arc<dyn ShardStrategy>) -> bool {
    // Compare data pointers only; vtable pointers may differ across codegen units.
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Build phase of a [`ShardStrategyProxy`]
///
/// Collects table ownership from every strategy and rejects overlapping
/// claims as soon as they are added.
pub struct ShardStrategyProxyBuilder {
    default_strategy: Option<Arc<dyn ShardStrategy>>,
    table_strategies: HashMap<String, Arc<dyn ShardStrategy>>,
}

impl ShardStrategyProxyBuilder {
    /// Starts a builder whose fallback is `default_strategy`.
    ///
    /// Tables claimed by the default are recorded as owned by it.
    pub fn new(default_strategy: Option<Arc<dyn ShardStrategy>>) -> Result<Self> {
        let mut builder = Self {
            default_strategy: None,
            table_strategies: HashMap::new(),
        };
        if let Some(default_strategy) = &default_strategy {
            builder.add_strategy(Arc::clone(default_strategy))?;
        }
        builder.default_strategy = default_strategy;
        Ok(builder)
    }

    /// Registers `strategy` for every table it claims.
    ///
    /// Adding the default strategy again is a no-op. When any claimed table
    /// already belongs to another strategy, nothing is registered and a
    /// [`DalError::StrategyConflict`] naming that table is returned.
    pub fn add_strategy(&mut self, strategy: Arc<dyn ShardStrategy>) -> Result<()> {
        if self
            .default_strategy
            .as_ref()
            .is_some_and(|default| same_strategy(default, &strategy))
        {
            return Ok(());
        }

        let tables = strategy.applied_tables()?;
        for table in &tables {
            if let Some(owner) = self.table_strategies.get(table) {
                if !same_strategy(owner, &strategy) {
                    return Err(DalError::StrategyConflict {
                        table: table.clone(),
                    });
                }
            }
        }

        for table in tables {
            debug!(table = %table, "shard strategy registered for table");
            self.table_strategies.insert(table, Arc::clone(&strategy));
        }
        Ok(())
    }

    /// Chaining form of [`ShardStrategyProxyBuilder::add_strategy`].
    pub fn with_strategy(mut self, strategy: Arc<dyn ShardStrategy>) -> Result<Self> {
        self.add_strategy(strategy)?;
        Ok(self)
    }

    /// Freezes the routing table.
    pub fn build(self) -> ShardStrategyProxy {
        ShardStrategyProxy {
            default_strategy: self.default_strategy,
            table_strategies: self.table_strategies,
        }
    }
}

/// Routes shard queries to the strategy owning each table, falling back to
/// the default strategy for unclaimed tables.
///
/// The routing table is immutable once built, so concurrent readers need no
/// locking.
pub struct ShardStrategyProxy {
    default_strategy: Option<Arc<dyn ShardStrategy>>,
    table_strategies: HashMap<String, Arc<dyn ShardStrategy>>,
}

impl ShardStrategyProxy {
    pub fn builder(
        default_strategy: Option<Arc<dyn ShardStrategy>>,
    ) -> Result<ShardStrategyProxyBuilder> {
        ShardStrategyProxyBuilder::new(default_strategy)
    }

    /// Proxy with only a default strategy.
    pub fn new(default_strategy: Arc<dyn ShardStrategy>) -> Result<Self> {
        Ok(ShardStrategyProxyBuilder::new(Some(default_strategy))?.build())
    }

    pub fn default_strategy(&self) -> Option<&Arc<dyn ShardStrategy>> {
        self.default_strategy.as_ref()
    }

    /// Tables with an explicit owner, including those claimed by the default.
    pub fn routed_tables(&self) -> BTreeSet<&str> {
        self.table_strategies.keys().map(String::as_str).collect()
    }

    /// Strategy that answers queries for `table`.
    pub fn strategy_for(&self, table: &str) -> Result<&Arc<dyn ShardStrategy>> {
        self.resolve(table)?
            .ok_or_else(|| DalError::StrategyNotResolved {
                table: table.to_string(),
            })
    }

    fn resolve(&self, table: &str) -> Result<Option<&Arc<dyn ShardStrategy>>> {
        if table.trim().is_empty() {
            return Err(DalError::MissingTableName);
        }
        Ok(self
            .table_strategies
            .get(table)
            .or(self.default_strategy.as_ref()))
    }
}

impl ShardStrategy for ShardStrategyProxy {
    fn db_shard(&self, table: &str, context: &DbShardContext) -> Result<Option<u32>> {
        self.strategy_for(table)?.db_shard(table, context)
    }

    fn table_sharding_enabled(&self, table: &str) -> Result<bool> {
        match self.resolve(table)? {
            Some(strategy) => strategy.table_sharding_enabled(table),
            None => Ok(false),
        }
    }

    fn table_shard(&self, table: &str, context: &TableShardContext) -> Result<Option<String>> {
        self.strategy_for(table)?.table_shard(table, context)
    }

    fn all_table_shards(&self, table: &str) -> Result<BTreeSet<String>> {
        self.strategy_for(table)?.all_table_shards(table)
    }

    fn table_shard_separator(&self, table: &str) -> Result<Option<String>> {
        self.strategy_for(table)?.table_shard_separator(table)
    }

    fn applied_tables(&self) -> Result<BTreeSet<String>> {
        Err(DalError::UnsupportedComposition(
            "applied tables are not defined for a shard strategy proxy".to_string(),
        ))
    }
}

impl Lifecycle for ShardStrategyProxy {
    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for ShardStrategyProxyBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tables: Vec<&str> = self.table_strategies.keys().map(String::as_str).collect();
        tables.sort_unstable();
        f.debug_struct("ShardStrategyProxyBuilder")
            .field("has_default", &self.default_strategy.is_some())
            .field("tables", &tables)
            .finish()
    }
}

impl std::fmt::Debug for ShardStrategyProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardStrategyProxy")
            .field("has_default", &self.default_strategy.is_some())
            .field("routed_tables", &self.routed_tables())
            .finish()
    }
}
