use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ClientError;

/// Title and description attached to a campaign. The ledger stores them as
/// an opaque JSON string; only the client interprets it.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CampaignMetadata {
    pub title: String,
    pub description: String,
}

impl CampaignMetadata {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
        }
    }

    /// Blob as written by `create_campaign`.
    pub fn to_blob(&self) -> String {
        serde_json::json!({ "title": self.title, "description": self.description }).to_string()
    }

    /// Strict parse: the blob must be a JSON object. Missing or non-string
    /// fields still degrade to empty strings.
    pub fn try_parse(blob: &str) -> Result<Self, ClientError> {
        let value: Value = serde_json::from_str(blob)
            .map_err(|e| ClientError::InvalidInput(format!("metadata is not JSON: {e}")))?;
        let object = value
            .as_object()
            .ok_or_else(|| ClientError::InvalidInput("metadata is not a JSON object".into()))?;
        let text = |key: &str| {
            object
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        Ok(Self {
            title: text("title"),
            description: text("description"),
        })
    }

    /// Total parse used by the read path; anything malformed becomes the
    /// empty metadata.
    pub fn parse(blob: &str) -> Self {
        Self::try_parse(blob).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_empty() && self.description.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_round_trips() {
        let meta = CampaignMetadata::new("Save the Ocean", "Help us \"clean\" the ocean");
        assert_eq!(CampaignMetadata::parse(&meta.to_blob()), meta);
    }

    #[test]
    fn malformed_blobs_fall_back_to_empty() {
        for blob in ["", "not json", "[1,2,3]", "42", "null", "{\"title\":"] {
            assert!(CampaignMetadata::parse(blob).is_empty(), "blob {blob:?}");
        }
        assert!(CampaignMetadata::try_parse("[]").is_err());
    }

    #[test]
    fn wrong_field_types_degrade_per_field() {
        let meta = CampaignMetadata::parse(r#"{"title": 7, "description": "ok", "extra": true}"#);
        assert_eq!(meta.title, "");
        assert_eq!(meta.description, "ok");
    }
}
