//! JSON representation of [`Message`] used at the REST boundary.
//!
//! Field names are the lowercase names the REST clients send. Payloads are
//! base64 text in JSON and raw bytes internally. Numeric fields accept a
//! JSON number or a string of ASCII digits.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::Message;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required field `{0}`")]
    Missing(&'static str),

    #[error("field `{0}` must be a non-negative integer")]
    NotNumeric(&'static str),

    #[error("field `{0}` is out of range")]
    OutOfRange(&'static str),

    #[error("field `{0}` is not valid base64")]
    InvalidBase64(&'static str),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageJson {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub groupid: Option<String>,
    #[serde(default)]
    pub sequencenumber: Option<Value>,
    #[serde(default)]
    pub sequencetotal: Option<Value>,
    #[serde(default)]
    pub priority: Option<Value>,
    #[serde(default)]
    pub timestamp: Option<Value>,
    #[serde(default)]
    pub publisher: Option<String>,
    #[serde(default)]
    pub authid: Option<String>,
    #[serde(default)]
    pub authgroup: Option<String>,
    #[serde(default)]
    pub chainposition: Option<Value>,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub previoushash: Option<String>,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub difficultytarget: Option<Value>,
    #[serde(default)]
    pub infotype: Option<String>,
    #[serde(default)]
    pub infoformat: Option<String>,
    #[serde(default)]
    pub contextdata: Option<String>,
    #[serde(default)]
    pub contentdata: Option<String>,
}

impl MessageJson {
    /// Validate a publish request and convert it into a [`Message`].
    ///
    /// `id` and `timestamp` are accepted but overwritten by the bus.
    pub fn into_message(self) -> Result<Message, ValidationError> {
        let publisher = required("publisher", self.publisher)?;
        let info_type = required("infotype", self.infotype)?;
        let info_format = required("infoformat", self.infoformat)?;
        let content = self
            .contentdata
            .ok_or(ValidationError::Missing("contentdata"))?;

        Ok(Message {
            id: self.id.unwrap_or_default(),
            tag: self.tag.unwrap_or_default(),
            group_id: self.groupid.unwrap_or_default(),
            sequence_number: numeric("sequencenumber", self.sequencenumber)?,
            sequence_total: numeric("sequencetotal", self.sequencetotal)?,
            priority: numeric("priority", self.priority)?,
            timestamp: numeric("timestamp", self.timestamp)?,
            publisher,
            auth_identifier: self.authid.unwrap_or_default(),
            auth_group: self.authgroup.unwrap_or_default(),
            version: Message::VERSION,
            chain_position: numeric("chainposition", self.chainposition)?,
            hash: self.hash.unwrap_or_default(),
            previous_hash: self.previoushash.unwrap_or_default(),
            nonce: self.nonce.unwrap_or_default(),
            difficulty_target: numeric("difficultytarget", self.difficultytarget)?,
            info_type,
            info_format,
            context_data: base64_field("contextdata", self.contextdata.as_deref())?,
            content_data: base64_field("contentdata", Some(&content))?,
        })
    }
}

impl From<&Message> for MessageJson {
    fn from(m: &Message) -> Self {
        Self {
            id: Some(m.id.clone()),
            tag: Some(m.tag.clone()),
            groupid: Some(m.group_id.clone()),
            sequencenumber: Some(m.sequence_number.into()),
            sequencetotal: Some(m.sequence_total.into()),
            priority: Some(m.priority.into()),
            timestamp: Some(m.timestamp.into()),
            publisher: Some(m.publisher.clone()),
            authid: Some(m.auth_identifier.clone()),
            authgroup: Some(m.auth_group.clone()),
            chainposition: Some(m.chain_position.into()),
            hash: Some(m.hash.clone()),
            previoushash: Some(m.previous_hash.clone()),
            nonce: Some(m.nonce.clone()),
            difficultytarget: Some(m.difficulty_target.into()),
            infotype: Some(m.info_type.clone()),
            infoformat: Some(m.info_format.clone()),
            contextdata: Some(STANDARD.encode(&m.context_data)),
            contentdata: Some(STANDARD.encode(&m.content_data)),
        }
    }
}

fn required(field: &'static str, value: Option<String>) -> Result<String, ValidationError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ValidationError::Missing(field)),
    }
}

fn numeric<T>(field: &'static str, value: Option<Value>) -> Result<T, ValidationError>
where
    T: TryFrom<u64> + Default,
{
    let raw = match value {
        None | Some(Value::Null) => return Ok(T::default()),
        Some(Value::Number(n)) => n.as_u64().ok_or(ValidationError::NotNumeric(field))?,
        Some(Value::String(s)) if s.is_empty() => return Ok(T::default()),
        Some(Value::String(s)) => {
            if !s.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ValidationError::NotNumeric(field));
            }
            s.parse::<u64>()
                .map_err(|_| ValidationError::OutOfRange(field))?
        }
        Some(_) => return Err(ValidationError::NotNumeric(field)),
    };
    T::try_from(raw).map_err(|_| ValidationError::OutOfRange(field))
}

fn base64_field(field: &'static str, value: Option<&str>) -> Result<Vec<u8>, ValidationError> {
    match value {
        None | Some("") => Ok(Vec::new()),
        Some(text) => STANDARD
            .decode(text)
            .map_err(|_| ValidationError::InvalidBase64(field)),
    }
}
