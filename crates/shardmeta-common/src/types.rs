//! Metadata record model
//!
//! [`MetadataRecord`] is the normalized, stored form of one namespace entry.
//! Callers describe what they want to write with [`NewMetadata`]; the client
//! turns that into a record with [`NewMetadata::into_record`], deriving
//! `dirname`, `name`, `creator` and `etag` and flattening links into plain
//! objects.

use crate::error::{Error, Result};
use crate::path::{basename, effective_dirname};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Opaque string map carried with directories and objects
pub type Headers = BTreeMap<String, String>;

/// Kind of namespace entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    #[display("object")]
    Object,
    #[display("directory")]
    Directory,
    /// Only ever seen on input; links are stored as objects
    #[display("link")]
    Link,
    #[display("bucket")]
    Bucket,
    #[display("bucketobject")]
    BucketObject,
}

impl ObjectType {
    /// Whether records of this type reference stored data by `objectId`
    #[must_use]
    pub const fn carries_data(self) -> bool {
        matches!(self, Self::Object | Self::BucketObject)
    }
}

/// A physical storage node holding one replica of an object
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shark {
    /// Storage node identifier
    pub storage_id: String,
    /// Datacenter the node lives in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacenter: Option<String>,
}

impl Shark {
    #[must_use]
    pub fn new(storage_id: impl Into<String>) -> Self {
        Self {
            storage_id: storage_id.into(),
            datacenter: None,
        }
    }

    #[must_use]
    pub fn with_datacenter(mut self, dc: impl Into<String>) -> Self {
        self.datacenter = Some(dc.into());
        self
    }
}

/// One stored namespace entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataRecord {
    pub key: String,
    pub dirname: String,
    pub name: String,
    pub owner: String,
    pub creator: String,
    #[serde(rename = "type")]
    pub object_type: ObjectType,
    /// Write time, milliseconds since the epoch
    pub mtime: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,
    #[serde(default)]
    pub roles: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_length: Option<u64>,
    #[serde(
        default,
        rename = "contentMD5",
        skip_serializing_if = "Option::is_none"
    )]
    pub content_md5: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sharks: Vec<Shark>,

    /// Source key of a link
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_from: Option<String>,
    /// Multipart upload bookkeeping for directories and buckets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload: Option<serde_json::Value>,
}

impl MetadataRecord {
    /// Parse a record from a stored JSON value
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| Error::invalid_metadata(e.to_string()))
    }

    /// Serialize this record into the value stored in a bucket
    pub fn to_value(&self) -> Result<serde_json::Value> {
        serde_json::to_value(self).map_err(|e| Error::invalid_metadata(e.to_string()))
    }

    /// The object id of a data-carrying record
    #[must_use]
    pub fn data_object_id(&self) -> Option<&str> {
        if self.object_type.carries_data() {
            self.object_id.as_deref()
        } else {
            None
        }
    }
}

/// Fields shared by objects and bucket objects
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectFields {
    pub content_length: u64,
    pub content_md5: String,
    pub content_type: String,
    /// Caller-generated identifier of the stored bytes
    pub object_id: String,
    /// Defaults to `object_id`
    pub etag: Option<String>,
    pub sharks: Vec<Shark>,
}

/// Type-specific part of a metadata write
#[derive(Clone, Debug, PartialEq)]
pub enum EntryKind {
    Directory { upload: Option<serde_json::Value> },
    Bucket { upload: Option<serde_json::Value> },
    Object(ObjectFields),
    /// An object inside a bucket; the caller names the containing directory
    BucketObject {
        dirname: String,
        object: ObjectFields,
    },
    /// A copy of `source` under a new key, stored as a plain object
    Link { source: Box<MetadataRecord> },
}

impl EntryKind {
    #[must_use]
    pub const fn object_type(&self) -> ObjectType {
        match self {
            Self::Directory { .. } => ObjectType::Directory,
            Self::Bucket { .. } => ObjectType::Bucket,
            Self::Object(_) => ObjectType::Object,
            Self::BucketObject { .. } => ObjectType::BucketObject,
            Self::Link { .. } => ObjectType::Link,
        }
    }
}

/// Caller input for a metadata write
#[derive(Clone, Debug, PartialEq)]
pub struct NewMetadata {
    pub key: String,
    pub owner: String,
    /// Defaults to `owner`
    pub creator: Option<String>,
    pub headers: Headers,
    pub roles: Vec<String>,
    pub kind: EntryKind,
}

impl NewMetadata {
    fn new(key: impl Into<String>, owner: impl Into<String>, kind: EntryKind) -> Self {
        Self {
            key: key.into(),
            owner: owner.into(),
            creator: None,
            headers: Headers::new(),
            roles: Vec::new(),
            kind,
        }
    }

    /// A directory entry
    pub fn directory(key: impl Into<String>, owner: impl Into<String>) -> Self {
        Self::new(key, owner, EntryKind::Directory { upload: None })
    }

    /// A bucket entry
    pub fn bucket(key: impl Into<String>, owner: impl Into<String>) -> Self {
        Self::new(key, owner, EntryKind::Bucket { upload: None })
    }

    /// An object entry
    pub fn object(key: impl Into<String>, owner: impl Into<String>, object: ObjectFields) -> Self {
        Self::new(key, owner, EntryKind::Object(object))
    }

    /// An object stored inside a bucket directory
    pub fn bucket_object(
        key: impl Into<String>,
        owner: impl Into<String>,
        dirname: impl Into<String>,
        object: ObjectFields,
    ) -> Self {
        Self::new(
            key,
            owner,
            EntryKind::BucketObject {
                dirname: dirname.into(),
                object,
            },
        )
    }

    /// A link to an existing object record
    pub fn link(key: impl Into<String>, owner: impl Into<String>, source: MetadataRecord) -> Self {
        Self::new(
            key,
            owner,
            EntryKind::Link {
                source: Box::new(source),
            },
        )
    }

    #[must_use]
    pub fn with_creator(mut self, creator: impl Into<String>) -> Self {
        self.creator = Some(creator.into());
        self
    }

    #[must_use]
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    #[must_use]
    pub fn with_roles(mut self, roles: Vec<String>) -> Self {
        self.roles = roles;
        self
    }

    /// Attach an upload descriptor; ignored for anything but directories
    /// and buckets.
    #[must_use]
    pub fn with_upload(mut self, upload: serde_json::Value) -> Self {
        match &mut self.kind {
            EntryKind::Directory { upload: u } | EntryKind::Bucket { upload: u } => {
                *u = Some(upload);
            }
            _ => {}
        }
        self
    }

    /// Directory this entry is placed by. Bucket objects use their bucket
    /// directory even when the name nests deeper.
    #[must_use]
    pub fn placement_dir(&self) -> &str {
        match &self.kind {
            EntryKind::BucketObject { dirname, .. } => dirname,
            _ => effective_dirname(&self.key),
        }
    }

    /// Build the normalized record stored for this entry.
    pub fn into_record(self, mtime: u64) -> Result<MetadataRecord> {
        if !self.key.starts_with('/') {
            return Err(Error::invalid_metadata(format!(
                "key must be an absolute path: {}",
                self.key
            )));
        }
        if self.owner.is_empty() {
            return Err(Error::invalid_metadata("owner is required"));
        }

        let (dirname, name) = match &self.kind {
            EntryKind::BucketObject { dirname, .. } => {
                let name = self
                    .key
                    .strip_prefix(dirname.as_str())
                    .and_then(|rest| rest.strip_prefix('/'))
                    .filter(|rest| !rest.is_empty())
                    .ok_or_else(|| {
                        Error::invalid_metadata(format!(
                            "key {} is not inside bucket directory {dirname}",
                            self.key
                        ))
                    })?;
                (dirname.clone(), name.to_string())
            }
            _ => (
                effective_dirname(&self.key).to_string(),
                basename(&self.key).to_string(),
            ),
        };

        let mut record = MetadataRecord {
            dirname,
            name,
            creator: self.creator.unwrap_or_else(|| self.owner.clone()),
            owner: self.owner,
            object_type: self.kind.object_type(),
            mtime,
            headers: Some(self.headers),
            roles: self.roles,
            content_length: None,
            content_md5: None,
            content_type: None,
            object_id: None,
            etag: None,
            sharks: Vec::new(),
            created_from: None,
            upload: None,
            key: self.key,
        };

        match self.kind {
            EntryKind::Directory { upload } | EntryKind::Bucket { upload } => {
                record.upload = upload;
            }
            EntryKind::Object(object) | EntryKind::BucketObject { object, .. } => {
                validate_object(&object)?;
                record.content_length = Some(object.content_length);
                record.content_md5 = Some(object.content_md5);
                record.content_type = Some(object.content_type);
                record.etag = Some(object.etag.unwrap_or_else(|| object.object_id.clone()));
                record.object_id = Some(object.object_id);
                record.sharks = object.sharks;
            }
            EntryKind::Link { source } => {
                let source = *source;
                if source.object_id.is_none() {
                    return Err(Error::invalid_metadata(format!(
                        "link source {} has no objectId",
                        source.key
                    )));
                }
                record.object_type = ObjectType::Object;
                record.created_from = Some(source.key);
                record.headers = source.headers;
                record.content_length = source.content_length;
                record.content_md5 = source.content_md5;
                record.content_type = source.content_type;
                record.etag = source.etag;
                record.object_id = source.object_id;
                record.sharks = source.sharks;
            }
        }

        Ok(record)
    }
}

fn validate_object(object: &ObjectFields) -> Result<()> {
    if object.object_id.is_empty() {
        return Err(Error::invalid_metadata("objectId is required"));
    }
    if let Some(shark) = object.sharks.iter().find(|s| s.storage_id.is_empty()) {
        return Err(Error::invalid_metadata(format!(
            "shark has an empty storage id: {shark:?}"
        )));
    }
    Ok(())
}

/// Milliseconds since the Unix epoch
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT: &str = "/ff2f9a80-bbda-11e1-afa7-0800200c9a66/stor";

    fn fields(object_id: &str) -> ObjectFields {
        ObjectFields {
            content_length: 5,
            content_md5: "XUFAKrxLKna5cZ2REBfFkg==".to_string(),
            content_type: "text/plain".to_string(),
            object_id: object_id.to_string(),
            etag: None,
            sharks: vec![Shark::new("1.stor.local"), Shark::new("2.stor.local")],
        }
    }

    #[test]
    fn test_object_record() {
        let record = NewMetadata::object(format!("{ROOT}/home/a.txt"), "owner-1", fields("obj-a"))
            .into_record(42)
            .unwrap();
        assert_eq!(record.dirname, format!("{ROOT}/home"));
        assert_eq!(record.name, "a.txt");
        assert_eq!(record.creator, "owner-1");
        assert_eq!(record.object_type, ObjectType::Object);
        assert_eq!(record.etag.as_deref(), Some("obj-a"));
        assert_eq!(record.data_object_id(), Some("obj-a"));
        assert_eq!(record.sharks.len(), 2);
        assert_eq!(record.mtime, 42);
    }

    #[test]
    fn test_root_directory_record() {
        let record = NewMetadata::directory(ROOT, "owner-1")
            .with_creator("sub-user")
            .with_upload(serde_json::json!({"id": "u1"}))
            .into_record(1)
            .unwrap();
        assert_eq!(record.dirname, ROOT);
        assert_eq!(record.creator, "sub-user");
        assert_eq!(record.upload, Some(serde_json::json!({"id": "u1"})));
        assert!(record.object_id.is_none());
        assert!(record.data_object_id().is_none());
    }

    #[test]
    fn test_link_is_stored_as_object() {
        let mut headers = Headers::new();
        headers.insert("m-color".into(), "blue".into());
        let source = NewMetadata::object("/acct/stor/src", "owner-1", fields("obj-src"))
            .with_headers(headers.clone())
            .into_record(1)
            .unwrap();
        let link = NewMetadata::link("/acct/stor/dst", "owner-1", source)
            .with_headers(Headers::new())
            .into_record(2)
            .unwrap();
        assert_eq!(link.object_type, ObjectType::Object);
        assert_eq!(link.created_from.as_deref(), Some("/acct/stor/src"));
        assert_eq!(link.object_id.as_deref(), Some("obj-src"));
        assert_eq!(link.headers, Some(headers));
        assert_eq!(link.name, "dst");
    }

    #[test]
    fn test_bucket_object_name() {
        let record = NewMetadata::bucket_object(
            "/acct/buckets/b1/objects/dir/file.txt",
            "owner-1",
            "/acct/buckets/b1/objects",
            fields("obj-b"),
        )
        .into_record(1)
        .unwrap();
        assert_eq!(record.dirname, "/acct/buckets/b1/objects");
        assert_eq!(record.name, "dir/file.txt");
        assert_eq!(record.object_type, ObjectType::BucketObject);

        let err = NewMetadata::bucket_object("/other/x", "o", "/acct/b", fields("x"))
            .into_record(1)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidMetadata(_)));
    }

    #[test]
    fn test_placement_dir() {
        let nested = NewMetadata::bucket_object(
            "/acct/buckets/b1/objects/p3/file.txt",
            "owner-1",
            "/acct/buckets/b1/objects",
            fields("obj-p"),
        );
        assert_eq!(nested.placement_dir(), "/acct/buckets/b1/objects");

        let object = NewMetadata::object(format!("{ROOT}/home/a.txt"), "owner-1", fields("a"));
        assert_eq!(object.placement_dir(), format!("{ROOT}/home"));
        assert_eq!(NewMetadata::directory(ROOT, "owner-1").placement_dir(), ROOT);
    }

    #[test]
    fn test_validation() {
        assert!(NewMetadata::directory("relative", "o").into_record(1).is_err());
        assert!(NewMetadata::directory("/a", "").into_record(1).is_err());
        assert!(NewMetadata::object("/a/b", "o", fields("")).into_record(1).is_err());
    }

    #[test]
    fn test_wire_names() {
        let record = NewMetadata::object("/a/b", "o", fields("obj"))
            .into_record(1)
            .unwrap();
        let value = record.to_value().unwrap();
        assert_eq!(value["type"], "object");
        assert_eq!(value["contentMD5"], "XUFAKrxLKna5cZ2REBfFkg==");
        assert_eq!(value["objectId"], "obj");
        assert_eq!(value["sharks"][0]["storageId"], "1.stor.local");
        assert!(value.get("createdFrom").is_none());
        assert_eq!(MetadataRecord::from_value(value).unwrap(), record);

        let value = serde_json::to_value(ObjectType::BucketObject).unwrap();
        assert_eq!(value, "bucketobject");
        assert_eq!(ObjectType::BucketObject.to_string(), "bucketobject");
    }
}
