//! Content fingerprinting: turn a [`Content`] source into a body and its MD5.

use crate::{
    errors::{ReconcileError, ReconcileResult},
    models::desired::Content,
    transport::Body,
};
use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::Bytes;
use md5::Context;
use tokio::{fs::File, io::AsyncReadExt};

const READ_CHUNK: usize = 64 * 1024;

/// A body ready to write, with the fingerprint the differ compares.
#[derive(Clone, Debug)]
pub struct ResolvedContent {
    /// File sources stay on disk; the transport streams them.
    pub body: Body,
    /// Lowercase hex MD5 of the body.
    pub content_hash: String,
    pub content_length: u64,
}

pub async fn resolve(content: &Content) -> ReconcileResult<ResolvedContent> {
    match content {
        Content::None => Ok(from_bytes(Bytes::new())),
        Content::Raw(bytes) => Ok(from_bytes(bytes.clone())),
        Content::Base64(encoded) => {
            let decoded = STANDARD.decode(encoded.trim())?;
            Ok(from_bytes(Bytes::from(decoded)))
        }
        Content::SourcePath(path) => {
            let source_err = |source| ReconcileError::ContentSource {
                path: path.clone(),
                source,
            };
            let mut file = File::open(path).await.map_err(source_err)?;
            let mut digest = Context::new();
            let mut length = 0u64;
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                let n = file.read(&mut buf).await.map_err(source_err)?;
                if n == 0 {
                    break;
                }
                digest.consume(&buf[..n]);
                length += n as u64;
            }
            Ok(ResolvedContent {
                body: Body::File(path.clone()),
                content_hash: format!("{:x}", digest.compute()),
                content_length: length,
            })
        }
    }
}

fn from_bytes(bytes: Bytes) -> ResolvedContent {
    ResolvedContent {
        content_hash: format!("{:x}", md5::compute(&bytes)),
        content_length: bytes.len() as u64,
        body: Body::Bytes(bytes),
    }
}
