//! The `message` module defines the unit of exchange on the bus.
//!
//! A [`Message`] is created by a publishing workload, stamped with an id
//! and timestamp by the bus, persisted once by the archive and never
//! modified afterwards. Every string and byte field is optional; absence is
//! represented by the empty value so the binary codec can encode it as a
//! zero length.

pub mod codec;
pub mod id;
pub mod json;

pub use codec::{CodecError, HEADER_SIZE};
pub use id::IdGenerator;
pub use json::{MessageJson, ValidationError};

/// A message published by a workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub tag: String,
    pub group_id: String,
    pub sequence_number: u32,
    pub sequence_total: u32,
    pub priority: u8,
    /// Milliseconds since the UNIX epoch, assigned by the bus on publish.
    pub timestamp: u64,
    pub publisher: String,
    pub auth_identifier: String,
    pub auth_group: String,
    pub version: u16,
    pub chain_position: u64,
    pub hash: String,
    pub previous_hash: String,
    pub nonce: String,
    pub difficulty_target: u32,
    pub info_type: String,
    pub info_format: String,
    pub context_data: Vec<u8>,
    pub content_data: Vec<u8>,
}

impl Message {
    /// Protocol version written into every encoded header.
    pub const VERSION: u16 = 4;

    /// Create a message carrying only the fields a publisher must supply.
    pub fn new(
        publisher: impl Into<String>,
        info_type: impl Into<String>,
        info_format: impl Into<String>,
        content_data: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            publisher: publisher.into(),
            info_type: info_type.into(),
            info_format: info_format.into(),
            content_data: content_data.into(),
            ..Self::default()
        }
    }
}

impl Default for Message {
    fn default() -> Self {
        Self {
            id: String::new(),
            tag: String::new(),
            group_id: String::new(),
            sequence_number: 0,
            sequence_total: 0,
            priority: 0,
            timestamp: 0,
            publisher: String::new(),
            auth_identifier: String::new(),
            auth_group: String::new(),
            version: Self::VERSION,
            chain_position: 0,
            hash: String::new(),
            previous_hash: String::new(),
            nonce: String::new(),
            difficulty_target: 0,
            info_type: String::new(),
            info_format: String::new(),
            context_data: Vec::new(),
            content_data: Vec::new(),
        }
    }
}
