//! Metadata verbs against one ready shard
//!
//! A [`MetadataStore`] is a cheap handle bound to the store client of one
//! shard connection. Blind writes (no expected etag) retry a bounded number
//! of times on optimistic-concurrency conflicts; compare-and-swap writes
//! surface the first conflict. Writes that supersede a stored object with a
//! different `objectId` queue the old record in the delete log.

use crate::delete_log::DeleteLogEntry;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde_json::Value;
use shardmeta_common::{
    BucketNames, Error, MAX_CONFLICT_ATTEMPTS, MetadataRecord, NewMetadata, Result,
    StoreResult, now_ms,
};
use shardmeta_meta_store::{
    Filter, FindOptions, PutObjectOutcome, RequestOptions, Sort, StoreClient, StoredObject,
    WriteOptions,
};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Options for `put_metadata` and `del_metadata`
#[derive(Clone, Debug, Default)]
pub struct PutOptions {
    /// Tracing id; a fresh UUID when absent
    pub request_id: Option<String>,
    /// Compare-and-swap against this store etag
    pub expected_etag: Option<String>,
    /// Record being replaced, if the caller already knows it
    pub previous_metadata: Option<MetadataRecord>,
    /// Route superseded objects to the fast-delete queue
    pub snaplinks_disabled: bool,
}

impl PutOptions {
    #[must_use]
    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.expected_etag = Some(etag.into());
        self
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

/// Options for `del_metadata`
#[derive(Clone, Debug, Default)]
pub struct DeleteOptions {
    pub request_id: Option<String>,
    /// Compare-and-swap against this store etag
    pub expected_etag: Option<String>,
    /// Record being deleted, if the caller already knows it
    pub previous_metadata: Option<MetadataRecord>,
    /// Route the deleted object to the fast-delete queue
    pub snaplinks_disabled: bool,
    /// Directory the record was placed by, when it differs from the key's
    /// parent (bucket objects with nested names)
    pub dirname: Option<String>,
}

impl DeleteOptions {
    #[must_use]
    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.expected_etag = Some(etag.into());
        self
    }

    #[must_use]
    pub fn with_dirname(mut self, dirname: impl Into<String>) -> Self {
        self.dirname = Some(dirname.into());
        self
    }
}

/// Options for `get_metadata` and `get_directory_count`
#[derive(Clone, Debug, Default)]
pub struct GetOptions {
    pub request_id: Option<String>,
    /// Directory the record was placed by, when it differs from the key's
    /// parent (bucket objects with nested names)
    pub dirname: Option<String>,
}

impl GetOptions {
    #[must_use]
    pub fn with_dirname(mut self, dirname: impl Into<String>) -> Self {
        self.dirname = Some(dirname.into());
        self
    }
}

/// Options for `search`
#[derive(Clone, Debug, Default)]
pub struct SearchOptions {
    pub request_id: Option<String>,
    pub limit: Option<usize>,
    pub offset: usize,
    pub sort: Option<Sort>,
}

/// A record together with the store etag guarding it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredMetadata {
    pub record: MetadataRecord,
    pub etag: String,
}

fn request_id_or_new(given: Option<&String>) -> String {
    given.map_or_else(|| uuid::Uuid::new_v4().to_string(), Clone::clone)
}

/// Metadata operations on one shard
#[derive(Clone)]
pub struct MetadataStore {
    shard: String,
    client: Arc<dyn StoreClient>,
    buckets: Arc<BucketNames>,
    read_only: bool,
}

impl MetadataStore {
    pub fn new(
        client: Arc<dyn StoreClient>,
        buckets: Arc<BucketNames>,
        read_only: bool,
    ) -> Self {
        Self {
            shard: client.url().to_string(),
            client,
            buckets,
            read_only,
        }
    }

    /// URL of the shard behind this store
    #[must_use]
    pub fn shard(&self) -> &str {
        &self.shard
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            Err(Error::ReadOnly {
                shard: self.shard.clone(),
            })
        } else {
            Ok(())
        }
    }

    /// Write the record described by `entry`.
    pub async fn put_metadata(
        &self,
        entry: NewMetadata,
        opts: &PutOptions,
    ) -> Result<StoredMetadata> {
        self.check_writable()?;
        let request_id = request_id_or_new(opts.request_id.as_ref());
        let record = entry.into_record(now_ms())?;
        let value = record.to_value()?;
        let key = record.key.clone();
        let write_opts = WriteOptions {
            request_id: request_id.clone(),
            etag: opts.expected_etag.clone(),
        };

        debug!(shard = %self.shard, key = %key, request_id = %request_id, "put_metadata");
        let outcome = self
            .with_conflict_retry(&key, &request_id, opts.expected_etag.is_some(), || {
                self.client
                    .put_object(&self.buckets.metadata, &key, &value, &write_opts)
            })
            .await?;

        let PutObjectOutcome { etag, previous } = outcome;
        let previous = opts
            .previous_metadata
            .clone()
            .or_else(|| self.parse_previous(previous));
        if let Some(previous) = previous {
            self.log_superseded(
                &previous,
                record.data_object_id(),
                opts.snaplinks_disabled,
                &request_id,
            )
            .await;
        }

        Ok(StoredMetadata { record, etag })
    }

    /// Read the record at `key`.
    pub async fn get_metadata(&self, key: &str, opts: &GetOptions) -> Result<StoredMetadata> {
        let request_id = request_id_or_new(opts.request_id.as_ref());
        debug!(shard = %self.shard, key, request_id = %request_id, "get_metadata");
        let stored = self
            .client
            .get_object(
                &self.buckets.metadata,
                key,
                &RequestOptions { request_id },
            )
            .await
            .map_err(|e| Error::from_store(&self.shard, key, e))?;
        Ok(StoredMetadata {
            record: MetadataRecord::from_value(stored.value)?,
            etag: stored.etag,
        })
    }

    /// Delete the record at `key`.
    pub async fn del_metadata(&self, key: &str, opts: &DeleteOptions) -> Result<()> {
        self.check_writable()?;
        let request_id = request_id_or_new(opts.request_id.as_ref());
        let write_opts = WriteOptions {
            request_id: request_id.clone(),
            etag: opts.expected_etag.clone(),
        };

        debug!(shard = %self.shard, key, request_id = %request_id, "del_metadata");
        let deleted = self
            .with_conflict_retry(key, &request_id, opts.expected_etag.is_some(), || {
                self.client
                    .delete_object(&self.buckets.metadata, key, &write_opts)
            })
            .await?;

        let previous = opts
            .previous_metadata
            .clone()
            .or_else(|| self.parse_previous(Some(deleted)));
        if let Some(previous) = previous {
            self.log_superseded(&previous, None, opts.snaplinks_disabled, &request_id)
                .await;
        }
        Ok(())
    }

    /// Number of entries directly under `dir`, maintained by the shard.
    pub async fn get_directory_count(&self, dir: &str, opts: &GetOptions) -> Result<u64> {
        let request_id = request_id_or_new(opts.request_id.as_ref());
        debug!(shard = %self.shard, key = dir, request_id = %request_id, "get_directory_count");
        let stored = self
            .client
            .get_object(
                &self.buckets.directory_counts,
                dir,
                &RequestOptions { request_id },
            )
            .await
            .map_err(|e| Error::from_store(&self.shard, dir, e))?;
        stored
            .value
            .get("entries")
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                Error::invalid_metadata(format!("directory count for {dir} has no entries"))
            })
    }

    /// Records matching an LDAP-style `filter`, streamed lazily.
    pub fn search(
        &self,
        filter: &str,
        opts: &SearchOptions,
    ) -> Result<BoxStream<'static, Result<MetadataRecord>>> {
        let filter = Filter::parse(filter)?;
        let request_id = request_id_or_new(opts.request_id.as_ref());
        debug!(shard = %self.shard, %filter, request_id = %request_id, "search");
        let find_opts = FindOptions {
            request_id,
            limit: opts.limit,
            offset: opts.offset,
            sort: opts.sort.clone(),
        };
        let shard = self.shard.clone();
        let query = filter.to_string();
        let stream = self
            .client
            .find_objects(&self.buckets.metadata, &filter, &find_opts)
            .map(move |item| match item {
                Ok(stored) => MetadataRecord::from_value(stored.value),
                Err(e) => Err(Error::from_store(&shard, &query, e)),
            });
        Ok(stream.boxed())
    }

    pub async fn ping(&self, request_id: Option<&String>) -> Result<()> {
        let request_id = request_id_or_new(request_id);
        self.client
            .ping(&RequestOptions { request_id })
            .await
            .map_err(|source| Error::Transport {
                shard: self.shard.clone(),
                source,
            })
    }

    /// Run `op`, retrying blind writes that hit a conflict.
    async fn with_conflict_retry<T, F, Fut>(
        &self,
        key: &str,
        request_id: &str,
        compare_and_swap: bool,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_conflict() && !compare_and_swap && attempt < MAX_CONFLICT_ATTEMPTS => {
                    debug!(
                        shard = %self.shard,
                        key,
                        request_id,
                        attempt,
                        error = %e,
                        "blind write conflicted, retrying"
                    );
                    attempt += 1;
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(Error::from_store(&self.shard, key, e)),
            }
        }
    }

    fn parse_previous(&self, previous: Option<StoredObject>) -> Option<MetadataRecord> {
        let previous = previous?;
        match MetadataRecord::from_value(previous.value) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(
                    shard = %self.shard,
                    key = %previous.key,
                    error = %e,
                    "previous value is not a metadata record, skipping delete log"
                );
                None
            }
        }
    }

    /// Queue `previous` for deletion if the write superseded its object.
    /// Failures are logged; the primary write has already landed.
    async fn log_superseded(
        &self,
        previous: &MetadataRecord,
        new_object_id: Option<&str>,
        snaplinks_disabled: bool,
        request_id: &str,
    ) {
        let entry = match DeleteLogEntry::for_superseded(
            previous,
            new_object_id,
            snaplinks_disabled,
            now_ms(),
        ) {
            Ok(Some(entry)) => entry,
            Ok(None) => return,
            Err(e) => {
                warn!(shard = %self.shard, key = %previous.key, error = %e, "cannot build delete log entry");
                return;
            }
        };

        match entry
            .write(self.client.as_ref(), &self.buckets, request_id)
            .await
        {
            Ok(_) => debug!(
                shard = %self.shard,
                key = %previous.key,
                object_id = %entry.object_id,
                log_key = %entry.key,
                request_id,
                "queued superseded object"
            ),
            Err(e) => warn!(
                shard = %self.shard,
                key = %previous.key,
                object_id = %entry.object_id,
                request_id,
                error = %e,
                "failed to write delete log entry"
            ),
        }
    }
}

impl fmt::Debug for MetadataStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetadataStore")
            .field("shard", &self.shard)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provision::provision;
    use futures::TryStreamExt;
    use shardmeta_common::{ObjectFields, ObjectType, Shark};
    use shardmeta_meta_store::{LocalConnector, StoreConnector};

    async fn store(name: &str, read_only: bool) -> MetadataStore {
        let connector = LocalConnector::new();
        let transport = connector.connect(&format!("mem://{name}/")).await.unwrap();
        let buckets = Arc::new(BucketNames::default());
        provision(transport.client.as_ref(), &buckets, "test")
            .await
            .unwrap();
        MetadataStore::new(transport.client, buckets, read_only)
    }

    fn object(key: &str, object_id: &str) -> NewMetadata {
        NewMetadata::object(
            key,
            "owner-1",
            ObjectFields {
                content_length: 3,
                content_md5: "md5".into(),
                content_type: "text/plain".into(),
                object_id: object_id.into(),
                etag: None,
                sharks: vec![Shark::new("1.stor")],
            },
        )
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = store("crud", false).await;
        let put = store
            .put_metadata(object("/acct/stor/a", "A"), &PutOptions::default())
            .await
            .unwrap();
        let got = store
            .get_metadata("/acct/stor/a", &GetOptions::default())
            .await
            .unwrap();
        assert_eq!(got, put);
        assert_eq!(got.record.object_type, ObjectType::Object);

        store
            .del_metadata("/acct/stor/a", &DeleteOptions::default())
            .await
            .unwrap();
        let err = store
            .get_metadata("/acct/stor/a", &GetOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let store = store("cas", false).await;
        let first = store
            .put_metadata(object("/acct/stor/a", "A"), &PutOptions::default())
            .await
            .unwrap();

        let err = store
            .put_metadata(
                object("/acct/stor/a", "B"),
                &PutOptions::default().with_etag("not-the-etag"),
            )
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        store
            .put_metadata(
                object("/acct/stor/a", "B"),
                &PutOptions::default().with_etag(first.etag),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_read_only_refuses_writes() {
        let store = store("ro", true).await;
        let err = store
            .put_metadata(object("/acct/stor/a", "A"), &PutOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ReadOnly { .. }));
        let err = store
            .del_metadata("/acct/stor/a", &DeleteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ReadOnly { .. }));
    }

    #[tokio::test]
    async fn test_directory_count_and_search() {
        let store = store("count", false).await;
        for name in ["a", "b", "c"] {
            store
                .put_metadata(
                    object(&format!("/acct/stor/dir/{name}"), name),
                    &PutOptions::default(),
                )
                .await
                .unwrap();
        }
        let count = store
            .get_directory_count("/acct/stor/dir", &GetOptions::default())
            .await
            .unwrap();
        assert_eq!(count, 3);

        let opts = SearchOptions {
            sort: Some(Sort {
                attribute: "name".into(),
                order: shardmeta_meta_store::SortOrder::Desc,
            }),
            limit: Some(2),
            ..SearchOptions::default()
        };
        let names: Vec<String> = store
            .search("(dirname=/acct/stor/dir)", &opts)
            .unwrap()
            .map_ok(|r| r.name)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(names, vec!["c", "b"]);

        assert!(store.search("(broken", &opts).is_err());
    }

    #[tokio::test]
    async fn test_previous_metadata_overrides_store() {
        let store = store("prev", false).await;
        let stale = object("/acct/stor/a", "OLD").into_record(1).unwrap();
        let opts = PutOptions {
            previous_metadata: Some(stale),
            ..PutOptions::default()
        };
        store
            .put_metadata(object("/acct/stor/a", "NEW"), &opts)
            .await
            .unwrap();

        let logged: Vec<_> = store
            .client
            .find_objects(
                &store.buckets.delete_log,
                &Filter::equal("objectId", "OLD"),
                &FindOptions::default(),
            )
            .try_collect()
            .await
            .unwrap();
        assert_eq!(logged.len(), 1);
    }
}
