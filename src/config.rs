use compact_str::CompactString;

/// Initial settings for a datastore instance. Everything here is also
/// adjustable at runtime through the corresponding setters, which is how
/// test harnesses flip consistency and indexing behavior mid-run.
#[derive(Debug, Clone)]
pub struct Config {
    /// Application id baked into every key this store accepts.
    pub app_id: CompactString,
    /// Extra commit-conflict retries `run_in_transaction` performs before
    /// surfacing the conflict (total attempts = retries + 1).
    pub txn_retry_count: u32,
    /// Automatically register and backfill a proposed composite index when
    /// a query needs one, instead of failing with a missing-index error.
    pub auto_index: bool,
    /// Drop maintenance of the `__entity_group__` family of special
    /// entities. Puts with incomplete keys and id allocation then fail.
    pub disable_special_entities: bool,
    /// Serve every query from a fresh head snapshot instead of the lagging
    /// eventually-consistent one.
    pub consistent: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            app_id: "dev~app".into(),
            txn_retry_count: 0,
            auto_index: false,
            disable_special_entities: false,
            consistent: false,
        }
    }
}
