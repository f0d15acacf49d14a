use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{
    error::{LensError, Result},
    identity::{DocumentIdentity, identity_of},
};

/// Normalized bytes handed over by the intake pipeline.
#[derive(Debug, Clone)]
pub struct DocumentPayload {
    pub identity: DocumentIdentity,
    pub mime_type: String,
    pub bytes: Arc<Vec<u8>>,
}

impl DocumentPayload {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Result<Self> {
        let mime_type = mime_type.into().trim().to_ascii_lowercase();
        if bytes.is_empty() {
            return Err(LensError::InvalidDocument("document is empty".to_string()));
        }
        if mime_type.is_empty() || !mime_type.contains('/') {
            return Err(LensError::InvalidDocument(format!(
                "unsupported mime type {mime_type:?}"
            )));
        }

        Ok(Self {
            identity: identity_of(&bytes),
            mime_type,
            bytes: Arc::new(bytes),
        })
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.bytes.as_slice())
    }

    pub fn to_stored(&self) -> StoredDocument {
        StoredDocument {
            mime_type: self.mime_type.clone(),
            data: self.to_base64(),
        }
    }
}

/// One upload as produced by the intake pipeline.
#[derive(Debug, Clone)]
pub struct UploadedDocument {
    pub file_name: String,
    pub preview: Option<String>,
    pub payload: DocumentPayload,
}

impl UploadedDocument {
    pub fn new(file_name: impl Into<String>, payload: DocumentPayload) -> Self {
        Self {
            file_name: file_name.into(),
            preview: None,
            payload,
        }
    }

    pub fn with_preview(mut self, preview: impl Into<String>) -> Self {
        self.preview = Some(preview.into());
        self
    }

    pub fn identity(&self) -> &DocumentIdentity {
        &self.payload.identity
    }
}

/// Persisted form of a payload, stored once per document so its history entries can be re-analyzed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub mime_type: String,
    /// Base64 (standard alphabet) of the normalized bytes.
    pub data: String,
}

impl StoredDocument {
    pub fn to_payload(&self) -> Result<DocumentPayload> {
        let bytes = STANDARD
            .decode(self.data.as_bytes())
            .map_err(|e| LensError::InvalidDocument(format!("stored source is not base64: {e}")))?;
        DocumentPayload::new(bytes, self.mime_type.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_identity_ignores_name_and_mime() {
        let a = DocumentPayload::new(b"ABC".to_vec(), "image/png").unwrap();
        let b = DocumentPayload::new(b"ABC".to_vec(), "IMAGE/JPEG ").unwrap();
        assert_eq!(a.identity, b.identity);
        assert_eq!(b.mime_type, "image/jpeg");
    }

    #[test]
    fn rejects_empty_or_bad_mime() {
        assert!(DocumentPayload::new(Vec::new(), "image/png").is_err());
        assert!(DocumentPayload::new(b"x".to_vec(), "png").is_err());
    }

    #[test]
    fn stored_document_restores_same_identity() {
        let payload = DocumentPayload::new(b"lab results".to_vec(), "text/plain").unwrap();
        let restored = payload.to_stored().to_payload().unwrap();
        assert_eq!(restored.identity, payload.identity);
        assert_eq!(restored.bytes.as_slice(), b"lab results");
    }

    #[test]
    fn corrupt_stored_document_is_rejected() {
        let stored = StoredDocument {
            mime_type: "image/png".to_string(),
            data: "%%%".to_string(),
        };
        assert!(matches!(stored.to_payload(), Err(LensError::InvalidDocument(_))));
    }
}
