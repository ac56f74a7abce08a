//! Buckets and triggers every writable shard must carry.
//!
//! Provisioning is idempotent and may race with other processes doing the
//! same. Any failure, including version or concurrent-update conflicts,
//! fails the whole attempt; the connection retries it with backoff.

use futures::future::try_join_all;
use shardmeta_common::{BucketNames, StoreResult};
use shardmeta_meta_store::{
    AdminStatement, BucketSchema, IndexType, RequestOptions, StoreClient, TriggerAction,
    TriggerDef,
};
use tracing::debug;

pub const METADATA_BUCKET_VERSION: u32 = 2;
pub const DELETE_LOG_VERSION: u32 = 1;
pub const FASTDELETE_QUEUE_VERSION: u32 = 2;
pub const DIRECTORY_COUNTS_VERSION: u32 = 1;

/// Trigger keeping directory entry counts
pub const DIRCOUNT_TRIGGER: &str = "shardmeta_count_dirents";

/// Primary metadata bucket
#[must_use]
pub fn metadata_schema() -> BucketSchema {
    BucketSchema::new(METADATA_BUCKET_VERSION)
        .index("dirname", IndexType::String)
        .index("name", IndexType::String)
        .index("owner", IndexType::String)
        .index("objectId", IndexType::String)
        .index("type", IndexType::String)
}

#[must_use]
pub fn delete_log_schema() -> BucketSchema {
    BucketSchema::new(DELETE_LOG_VERSION).index("objectId", IndexType::String)
}

#[must_use]
pub fn fastdelete_queue_schema() -> BucketSchema {
    BucketSchema::new(FASTDELETE_QUEUE_VERSION).index("objectId", IndexType::String)
}

#[must_use]
pub fn directory_counts_schema() -> BucketSchema {
    BucketSchema::new(DIRECTORY_COUNTS_VERSION).index("entries", IndexType::Number)
}

/// Every bucket to create, with its schema
#[must_use]
pub fn bucket_plan(names: &BucketNames) -> Vec<(String, BucketSchema)> {
    vec![
        (names.metadata.clone(), metadata_schema()),
        (names.delete_log.clone(), delete_log_schema()),
        (names.fastdelete_queue.clone(), fastdelete_queue_schema()),
        (names.directory_counts.clone(), directory_counts_schema()),
    ]
}

/// Drop-then-create script for the directory count trigger
#[must_use]
pub fn trigger_script(names: &BucketNames) -> String {
    let statements = [
        AdminStatement::DropTrigger {
            name: DIRCOUNT_TRIGGER.to_string(),
            bucket: names.metadata.clone(),
        },
        AdminStatement::CreateTrigger(TriggerDef {
            name: DIRCOUNT_TRIGGER.to_string(),
            bucket: names.metadata.clone(),
            action: TriggerAction::CountDirname {
                into: names.directory_counts.clone(),
            },
        }),
    ];
    statements
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(";\n")
}

/// Create or upgrade all buckets concurrently, then install the trigger.
pub async fn provision(
    client: &dyn StoreClient,
    names: &BucketNames,
    request_id: &str,
) -> StoreResult<()> {
    let plan = bucket_plan(names);
    try_join_all(
        plan.iter()
            .map(|(name, schema)| client.put_bucket(name, schema)),
    )
    .await?;
    debug!(shard = client.url(), buckets = plan.len(), "buckets provisioned");

    let script = trigger_script(names);
    let opts = RequestOptions {
        request_id: request_id.to_string(),
    };
    client.sql(&script, &opts).await?;
    debug!(shard = client.url(), "directory count trigger installed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardmeta_meta_store::{LocalConnector, StoreConnector};

    #[test]
    fn test_trigger_script_parses() {
        let names = BucketNames::default();
        let stmts = AdminStatement::parse_script(&trigger_script(&names)).unwrap();
        assert_eq!(stmts.len(), 2);
        assert!(matches!(stmts[0], AdminStatement::DropTrigger { .. }));
    }

    #[tokio::test]
    async fn test_provision_is_idempotent() {
        let connector = LocalConnector::new();
        let transport = connector.connect("mem://provision/").await.unwrap();
        let names = BucketNames::default();

        provision(transport.client.as_ref(), &names, "r1").await.unwrap();
        provision(transport.client.as_ref(), &names, "r2").await.unwrap();

        for (name, schema) in bucket_plan(&names) {
            assert_eq!(transport.client.get_bucket(&name).await.unwrap(), schema);
        }
    }

    #[tokio::test]
    async fn test_provision_fails_on_newer_bucket() {
        let connector = LocalConnector::new();
        let transport = connector.connect("mem://newer/").await.unwrap();
        let names = BucketNames::default();
        transport
            .client
            .put_bucket(&names.metadata, &BucketSchema::new(METADATA_BUCKET_VERSION + 1))
            .await
            .unwrap();

        let err = provision(transport.client.as_ref(), &names, "r1")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            shardmeta_common::StoreError::BucketVersionConflict { .. }
        ));
    }
}
