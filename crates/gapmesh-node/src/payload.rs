//! Private payload envelope carried inside `NoiseEncrypted` packets.
//!
//! One kind byte, then a kind-specific body:
//!
//! ```text
//! 0x01 text                  message id (16) | utf-8 text
//! 0x02 delivery ack          message id (16)
//! 0x03 read ack              message id (16)
//! 0x04 favorite notification json {"isFavorite":bool,"nostrPubKey":...}
//! ```

use serde::{Deserialize, Serialize};

use crate::error::NodeError;

/// Length of a message identifier.
pub const MESSAGE_ID_LEN: usize = 16;

const KIND_TEXT: u8 = 0x01;
const KIND_DELIVERY_ACK: u8 = 0x02;
const KIND_READ_ACK: u8 = 0x03;
const KIND_FAVORITE: u8 = 0x04;

/// Body of a favorite notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FavoriteNotification {
    /// Whether the sender now favorites us
    #[serde(rename = "isFavorite")]
    pub is_favorite: bool,
    /// The sender's Nostr pubkey, offered when favoriting
    #[serde(rename = "nostrPubKey", skip_serializing_if = "Option::is_none")]
    pub nostr_pubkey: Option<String>,
}

/// A decoded private payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrivatePayload {
    /// User-visible text message
    Text {
        /// Correlates acks with the message
        message_id: [u8; MESSAGE_ID_LEN],
        /// The message body
        text: String,
    },
    /// The peer's transport accepted the message
    DeliveryAck {
        /// Acked message
        message_id: [u8; MESSAGE_ID_LEN],
    },
    /// The peer's user saw the message
    ReadAck {
        /// Acked message
        message_id: [u8; MESSAGE_ID_LEN],
    },
    /// Favorite-state assertion
    Favorite(FavoriteNotification),
}

impl PrivatePayload {
    /// Serialize to envelope bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Text { message_id, text } => {
                let mut out = Vec::with_capacity(1 + MESSAGE_ID_LEN + text.len());
                out.push(KIND_TEXT);
                out.extend_from_slice(message_id);
                out.extend_from_slice(text.as_bytes());
                out
            }
            Self::DeliveryAck { message_id } => {
                let mut out = Vec::with_capacity(1 + MESSAGE_ID_LEN);
                out.push(KIND_DELIVERY_ACK);
                out.extend_from_slice(message_id);
                out
            }
            Self::ReadAck { message_id } => {
                let mut out = Vec::with_capacity(1 + MESSAGE_ID_LEN);
                out.push(KIND_READ_ACK);
                out.extend_from_slice(message_id);
                out
            }
            Self::Favorite(notification) => {
                let body = serde_json::to_vec(notification).unwrap_or_default();
                let mut out = Vec::with_capacity(1 + body.len());
                out.push(KIND_FAVORITE);
                out.extend_from_slice(&body);
                out
            }
        }
    }

    /// Parse envelope bytes.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::BadEnvelope`] for an unknown kind, short body,
    /// or invalid text/JSON.
    pub fn decode(bytes: &[u8]) -> Result<Self, NodeError> {
        let (&kind, body) = bytes
            .split_first()
            .ok_or(NodeError::BadEnvelope("empty payload"))?;
        let read_id = |body: &[u8]| -> Result<[u8; MESSAGE_ID_LEN], NodeError> {
            if body.len() < MESSAGE_ID_LEN {
                return Err(NodeError::BadEnvelope("short message id"));
            }
            let mut id = [0u8; MESSAGE_ID_LEN];
            id.copy_from_slice(&body[..MESSAGE_ID_LEN]);
            Ok(id)
        };
        match kind {
            KIND_TEXT => {
                let message_id = read_id(body)?;
                let text = std::str::from_utf8(&body[MESSAGE_ID_LEN..])
                    .map_err(|_| NodeError::BadEnvelope("text not utf-8"))?
                    .to_string();
                Ok(Self::Text { message_id, text })
            }
            KIND_DELIVERY_ACK => Ok(Self::DeliveryAck {
                message_id: read_id(body)?,
            }),
            KIND_READ_ACK => Ok(Self::ReadAck {
                message_id: read_id(body)?,
            }),
            KIND_FAVORITE => {
                let notification = serde_json::from_slice(body)
                    .map_err(|_| NodeError::BadEnvelope("favorite body not json"))?;
                Ok(Self::Favorite(notification))
            }
            _ => Err(NodeError::BadEnvelope("unknown payload kind")),
        }
    }
}
