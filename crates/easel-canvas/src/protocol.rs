//! Correlation envelopes exchanged with the canvas peer.
//!
//! Anything on the socket that does not parse as one of these four kinds
//! belongs to the sync layer and is passed through untouched.

use serde::{Deserialize, Serialize};

use easel_core::types::ImageData;

use crate::error::BrokerError;

const DEFAULT_MEDIA_TYPE: &str = "image/png";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Envelope {
    SnapshotRequest {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        page: Option<String>,
    },
    SnapshotResponse {
        id: String,
        /// Base64-encoded image.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ExportRequest {
        id: String,
    },
    ExportResponse {
        id: String,
        /// One base64-encoded image per page, in page order.
        #[serde(default)]
        pages: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Decoded payload of a response envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Snapshot(ImageData),
    Export(Vec<ImageData>),
}

impl Envelope {
    /// Parse a raw frame, returning `None` for non-envelope traffic.
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }

    /// Split a response envelope into its correlation id and outcome.
    /// Request kinds yield `None`.
    pub fn into_reply(self) -> Option<(String, Result<Reply, BrokerError>)> {
        match self {
            Envelope::SnapshotResponse {
                id,
                image,
                media_type,
                error,
            } => {
                let outcome = match (error, image) {
                    (Some(message), _) => Err(BrokerError::Peer(message)),
                    (None, None) => Err(BrokerError::UnexpectedReply(
                        "snapshot response carried no image".into(),
                    )),
                    (None, Some(image)) => decode_image(media_type.as_deref(), &image).map(Reply::Snapshot),
                };
                Some((id, outcome))
            }
            Envelope::ExportResponse {
                id,
                pages,
                media_type,
                error,
            } => {
                let outcome = match error {
                    Some(message) => Err(BrokerError::Peer(message)),
                    None => pages
                        .iter()
                        .map(|page| decode_image(media_type.as_deref(), page))
                        .collect::<Result<Vec<_>, _>>()
                        .map(Reply::Export),
                };
                Some((id, outcome))
            }
            Envelope::SnapshotRequest { .. } | Envelope::ExportRequest { .. } => None,
        }
    }
}

fn decode_image(media_type: Option<&str>, encoded: &str) -> Result<ImageData, BrokerError> {
    // Peers may send a data URL instead of bare base64.
    let (inline_type, payload) = match encoded
        .strip_prefix("data:")
        .and_then(|rest| rest.split_once(";base64,"))
    {
        Some((mime, data)) => (Some(mime), data),
        None => (None, encoded),
    };
    let media_type = inline_type.or(media_type).unwrap_or(DEFAULT_MEDIA_TYPE);
    ImageData::from_base64(media_type, payload)
        .map_err(|e| BrokerError::UnexpectedReply(format!("invalid image payload: {e}")))
}
