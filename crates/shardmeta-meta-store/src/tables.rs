//! Redb table definitions for the embedded shard.

use redb::TableDefinition;

// Bucket name -> JSON BucketSchema
pub const CATALOG: TableDefinition<&str, &[u8]> = TableDefinition::new("buckets");

// "<bucket>/<trigger>" -> JSON TriggerDef
pub const TRIGGERS: TableDefinition<&str, &[u8]> = TableDefinition::new("triggers");

/// Name of the redb table holding the rows of `bucket`
#[must_use]
pub fn bucket_table_name(bucket: &str) -> String {
    format!("bucket:{bucket}")
}

/// Key of a trigger in [`TRIGGERS`]
#[must_use]
pub fn trigger_key(bucket: &str, name: &str) -> String {
    format!("{bucket}/{name}")
}
