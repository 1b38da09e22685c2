//! Object identity: the container an object lives in and its key.

use serde::{Deserialize, Serialize};
use std::fmt;

const IMPORT_SCHEME: &str = "s3://";

/// Where an object lives.
///
/// Either a plain bucket name or an access-point ARN standing in for one.
/// The core never branches on the variant; transports resolve it once.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(from = "String", into = "String")]
pub enum ContainerRef {
    Bucket(String),
    AccessPoint(String),
}

impl ContainerRef {
    pub fn parse(value: impl Into<String>) -> Self {
        let value = value.into();
        if value.starts_with("arn:") && value.contains(":accesspoint/") {
            Self::AccessPoint(value)
        } else {
            Self::Bucket(value)
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Bucket(name) | Self::AccessPoint(name) => name,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.as_str().is_empty()
    }
}

impl From<String> for ContainerRef {
    fn from(value: String) -> Self {
        Self::parse(value)
    }
}

impl From<&str> for ContainerRef {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}

impl From<ContainerRef> for String {
    fn from(value: ContainerRef) -> Self {
        match value {
            ContainerRef::Bucket(name) | ContainerRef::AccessPoint(name) => name,
        }
    }
}

impl fmt::Display for ContainerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bucket + normalized key. Two resources with equal ids address the same remote object.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectId {
    pub bucket: ContainerRef,
    pub key: String,
}

impl ObjectId {
    /// Build an id, normalizing the key. Does not validate emptiness.
    pub fn new(bucket: impl Into<ContainerRef>, key: &str) -> Self {
        Self {
            bucket: bucket.into(),
            key: normalize_key(key).to_string(),
        }
    }

    /// Parse an import identifier of the form `s3://<bucket>/<key>`.
    ///
    /// The scheme is optional. Bucket and key split on the first `/`; the key
    /// may contain further separators and is normalized like configured keys.
    pub fn parse_import_id(id: &str) -> Option<Self> {
        let rest = id.strip_prefix(IMPORT_SCHEME).unwrap_or(id);
        let (bucket, key) = rest.split_once('/')?;
        let normalized = normalize_key(key);
        if bucket.is_empty() || normalized.is_empty() {
            return None;
        }
        Some(Self::new(bucket, normalized))
    }

    pub fn import_id(&self) -> String {
        format!("{}{}/{}", IMPORT_SCHEME, self.bucket, self.key)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// Strip leading `/` separators. Interior runs of `/` are kept literally.
pub fn normalize_key(key: &str) -> &str {
    key.trim_start_matches('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leading_separators_are_stripped() {
        assert_eq!(normalize_key("/////test-key"), "test-key");
        assert_eq!(normalize_key("/test-key"), "test-key");
        assert_eq!(normalize_key("test-key"), "test-key");
    }

    #[test]
    fn interior_separators_are_preserved() {
        assert_eq!(
            normalize_key("first//second///third//"),
            "first//second///third//"
        );
        assert_eq!(normalize_key("//a//b"), "a//b");
    }

    #[test]
    fn import_id_splits_on_first_separator() {
        let id = ObjectId::parse_import_id("s3://my-bucket/dir/sub//file.txt").unwrap();
        assert_eq!(id.bucket, ContainerRef::Bucket("my-bucket".into()));
        assert_eq!(id.key, "dir/sub//file.txt");
        assert_eq!(id.import_id(), "s3://my-bucket/dir/sub//file.txt");
    }

    #[test]
    fn import_id_normalizes_leading_slashes() {
        let id = ObjectId::parse_import_id("s3://my-bucket//////test-key").unwrap();
        assert_eq!(id.key, "test-key");
    }

    #[test]
    fn import_id_without_scheme_is_accepted() {
        let id = ObjectId::parse_import_id("my-bucket/k").unwrap();
        assert_eq!(id.bucket.as_str(), "my-bucket");
        assert_eq!(id.key, "k");
    }

    #[test]
    fn import_id_requires_bucket_and_key() {
        assert!(ObjectId::parse_import_id("s3://my-bucket").is_none());
        assert!(ObjectId::parse_import_id("s3:///key").is_none());
        assert!(ObjectId::parse_import_id("s3://my-bucket///").is_none());
    }

    #[test]
    fn access_point_arns_are_recognized() {
        let arn = "arn:aws:s3:us-west-2:123456789012:accesspoint/my-ap";
        assert_eq!(
            ContainerRef::parse(arn),
            ContainerRef::AccessPoint(arn.into())
        );
        assert_eq!(
            ContainerRef::parse("plain-bucket"),
            ContainerRef::Bucket("plain-bucket".into())
        );
    }
}
