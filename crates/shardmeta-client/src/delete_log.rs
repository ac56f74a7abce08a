//! Delete log: superseded object versions queued for garbage collection.
//!
//! When a write replaces (or a delete removes) an object record whose
//! `objectId` differs from the new one, the old record is appended to the
//! durable delete log, or to the fast-delete queue when snaplinks are
//! disabled for the account.

use serde_json::Value;
use shardmeta_common::{BucketNames, MetadataRecord, Result, StoreResult, crc32c_hex};
use shardmeta_meta_store::{PutObjectOutcome, StoreClient, WriteOptions};

/// Which queue an entry goes to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteQueue {
    /// Durable log keyed by `/<objectId>/<epoch-ms>`
    DeleteLog,
    /// Fast-delete queue keyed by `objectId`
    FastDelete,
}

/// One queued deletion candidate
#[derive(Clone, Debug, PartialEq)]
pub struct DeleteLogEntry {
    pub queue: DeleteQueue,
    pub key: String,
    pub object_id: String,
    /// Snapshot of the superseded record
    pub value: Value,
    /// Hex CRC32C of the serialized snapshot
    pub checksum: String,
    pub mtime: u64,
}

impl DeleteLogEntry {
    /// Entry for `previous` being replaced by a record with
    /// `new_object_id` (`None` for a delete), or `None` if nothing is
    /// superseded.
    pub fn for_superseded(
        previous: &MetadataRecord,
        new_object_id: Option<&str>,
        snaplinks_disabled: bool,
        now_ms: u64,
    ) -> Result<Option<Self>> {
        let Some(old_id) = previous.data_object_id() else {
            return Ok(None);
        };
        if new_object_id == Some(old_id) {
            return Ok(None);
        }

        let value = previous.to_value()?;
        let checksum = crc32c_hex(value.to_string().as_bytes());
        let (queue, key) = if snaplinks_disabled {
            (DeleteQueue::FastDelete, old_id.to_string())
        } else {
            (DeleteQueue::DeleteLog, format!("/{old_id}/{now_ms}"))
        };

        Ok(Some(Self {
            queue,
            key,
            object_id: old_id.to_string(),
            value,
            checksum,
            mtime: now_ms,
        }))
    }

    /// Bucket this entry is written to
    #[must_use]
    pub fn bucket<'a>(&self, names: &'a BucketNames) -> &'a str {
        match self.queue {
            DeleteQueue::DeleteLog => &names.delete_log,
            DeleteQueue::FastDelete => &names.fastdelete_queue,
        }
    }

    /// Append the entry to its queue
    pub async fn write(
        &self,
        client: &dyn StoreClient,
        names: &BucketNames,
        request_id: &str,
    ) -> StoreResult<PutObjectOutcome> {
        let opts = WriteOptions {
            request_id: request_id.to_string(),
            etag: None,
        };
        client
            .put_object(self.bucket(names), &self.key, &self.value, &opts)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardmeta_common::{NewMetadata, ObjectFields, Shark};

    fn object(object_id: &str) -> MetadataRecord {
        NewMetadata::object(
            "/acct/stor/file",
            "acct",
            ObjectFields {
                content_length: 1,
                content_md5: "md5".into(),
                content_type: "text/plain".into(),
                object_id: object_id.into(),
                etag: None,
                sharks: vec![Shark::new("1.stor")],
            },
        )
        .into_record(10)
        .unwrap()
    }

    #[test]
    fn test_superseded_object() {
        let entry = DeleteLogEntry::for_superseded(&object("A"), Some("B"), false, 1234)
            .unwrap()
            .unwrap();
        assert_eq!(entry.queue, DeleteQueue::DeleteLog);
        assert_eq!(entry.key, "/A/1234");
        assert_eq!(entry.object_id, "A");
        assert_eq!(entry.value["objectId"], "A");
        assert_eq!(entry.checksum, crc32c_hex(entry.value.to_string().as_bytes()));
        assert_eq!(entry.bucket(&BucketNames::default()), "shardmeta_delete_log");
    }

    #[test]
    fn test_fast_delete_queue() {
        let entry = DeleteLogEntry::for_superseded(&object("A"), None, true, 1)
            .unwrap()
            .unwrap();
        assert_eq!(entry.queue, DeleteQueue::FastDelete);
        assert_eq!(entry.key, "A");
        assert_eq!(
            entry.bucket(&BucketNames::default()),
            "shardmeta_fastdelete_queue"
        );
    }

    #[test]
    fn test_nothing_superseded() {
        assert!(
            DeleteLogEntry::for_superseded(&object("A"), Some("A"), false, 1)
                .unwrap()
                .is_none()
        );
        let dir = NewMetadata::directory("/acct/stor/d", "acct")
            .into_record(1)
            .unwrap();
        assert!(
            DeleteLogEntry::for_superseded(&dir, Some("B"), false, 1)
                .unwrap()
                .is_none()
        );
    }
}
