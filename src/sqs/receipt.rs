//! Receipt handles identify one delivery of one message.
//!
//! A handle names the queue, the message and a random per-delivery nonce, so a
//! handle from an earlier delivery never matches a later one.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use uuid::Uuid;

use super::error::SqsError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle {
    queue: String,
    message_id: String,
    nonce: Uuid,
}

impl ReceiptHandle {
    pub fn issue(queue: &str, message_id: &str) -> Self {
        ReceiptHandle {
            queue: queue.to_string(),
            message_id: message_id.to_string(),
            nonce: Uuid::new_v4(),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }
}

impl fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let raw = format!("{}\n{}\n{}", self.queue, self.message_id, self.nonce);
        f.write_str(&URL_SAFE_NO_PAD.encode(raw))
    }
}

impl FromStr for ReceiptHandle {
    type Err = SqsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            SqsError::ReceiptHandleIsInvalid(format!(
                "The input receipt handle \"{s}\" is not a valid receipt handle."
            ))
        };
        let decoded = URL_SAFE_NO_PAD.decode(s).map_err(|_| invalid())?;
        let raw = String::from_utf8(decoded).map_err(|_| invalid())?;
        let mut parts = raw.splitn(3, '\n');
        let (Some(queue), Some(message_id), Some(nonce)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };
        if queue.is_empty() || message_id.is_empty() {
            return Err(invalid());
        }
        let nonce = Uuid::parse_str(nonce).map_err(|_| invalid())?;
        Ok(ReceiptHandle {
            queue: queue.to_string(),
            message_id: message_id.to_string(),
            nonce,
        })
    }
}
