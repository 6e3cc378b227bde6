//! Binary codec for [`Message`]
//!
//! An encoded message is a fixed 33-byte header followed by a variable
//! length data section. The header starts with a 2-byte big-endian protocol
//! version and then holds one slot per field, in the order of `LAYOUT`:
//!
//! - variable length fields store their length as a 1, 2 or 4 byte
//!   big-endian prefix
//! - integer fields store a single byte holding the value width, or `0`
//!   when the value is zero (absent)
//!
//! The data section concatenates the field contents in the same order.
//! Both encoding and decoding walk `LAYOUT`; no offset is computed
//! anywhere else.

use thiserror::Error;

use super::Message;

/// Size of the fixed header in bytes.
pub const HEADER_SIZE: usize = 33;

const VERSION_SIZE: usize = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("buffer too short: need {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },

    #[error("unsupported message version {0}")]
    UnsupportedVersion(u16),

    #[error("field `{field}` is {len} bytes, limit is {max}")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: u64,
    },

    #[error("field `{field}` declares width {width}, expected 0 or {expected}")]
    InvalidWidth {
        field: &'static str,
        width: u8,
        expected: usize,
    },

    #[error("field `{0}` is not valid UTF-8")]
    InvalidUtf8(&'static str),

    #[error("{0} unexpected bytes after the last field")]
    TrailingBytes(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Id,
    Tag,
    GroupId,
    SequenceNumber,
    SequenceTotal,
    Priority,
    Timestamp,
    Publisher,
    AuthIdentifier,
    AuthGroup,
    ChainPosition,
    Hash,
    PreviousHash,
    Nonce,
    DifficultyTarget,
    InfoType,
    InfoFormat,
    ContextData,
    ContentData,
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    /// Variable length content with an n-byte length prefix in the header.
    Prefixed(usize),
    /// Unsigned integer of n bytes; the header holds n, or 0 when absent.
    Fixed(usize),
}

impl Slot {
    fn width(self) -> usize {
        match self {
            Slot::Prefixed(width) | Slot::Fixed(width) => width,
        }
    }

    const fn header_width(self) -> usize {
        match self {
            Slot::Prefixed(width) => width,
            Slot::Fixed(_) => 1,
        }
    }
}

const LAYOUT: [(Field, Slot); 19] = [
    (Field::Id, Slot::Prefixed(1)),
    (Field::Tag, Slot::Prefixed(2)),
    (Field::GroupId, Slot::Prefixed(1)),
    (Field::SequenceNumber, Slot::Fixed(4)),
    (Field::SequenceTotal, Slot::Fixed(4)),
    (Field::Priority, Slot::Fixed(1)),
    (Field::Timestamp, Slot::Fixed(8)),
    (Field::Publisher, Slot::Prefixed(1)),
    (Field::AuthIdentifier, Slot::Prefixed(2)),
    (Field::AuthGroup, Slot::Prefixed(2)),
    (Field::ChainPosition, Slot::Fixed(8)),
    (Field::Hash, Slot::Prefixed(2)),
    (Field::PreviousHash, Slot::Prefixed(2)),
    (Field::Nonce, Slot::Prefixed(2)),
    (Field::DifficultyTarget, Slot::Fixed(4)),
    (Field::InfoType, Slot::Prefixed(1)),
    (Field::InfoFormat, Slot::Prefixed(1)),
    (Field::ContextData, Slot::Prefixed(4)),
    (Field::ContentData, Slot::Prefixed(4)),
];

const fn layout_header_size() -> usize {
    let mut size = VERSION_SIZE;
    let mut i = 0;
    while i < LAYOUT.len() {
        size += LAYOUT[i].1.header_width();
        i += 1;
    }
    size
}

const _: () = assert!(layout_header_size() == HEADER_SIZE);

impl Field {
    fn name(self) -> &'static str {
        match self {
            Field::Id => "id",
            Field::Tag => "tag",
            Field::GroupId => "groupId",
            Field::SequenceNumber => "sequenceNumber",
            Field::SequenceTotal => "sequenceTotal",
            Field::Priority => "priority",
            Field::Timestamp => "timestamp",
            Field::Publisher => "publisher",
            Field::AuthIdentifier => "authIdentifier",
            Field::AuthGroup => "authGroup",
            Field::ChainPosition => "chainPosition",
            Field::Hash => "hash",
            Field::PreviousHash => "previousHash",
            Field::Nonce => "nonce",
            Field::DifficultyTarget => "difficultyTarget",
            Field::InfoType => "infoType",
            Field::InfoFormat => "infoFormat",
            Field::ContextData => "contextData",
            Field::ContentData => "contentData",
        }
    }
}

enum Value<'a> {
    Bytes(&'a [u8]),
    Uint(u64),
}

impl Message {
    fn value(&self, field: Field) -> Value<'_> {
        match field {
            Field::Id => Value::Bytes(self.id.as_bytes()),
            Field::Tag => Value::Bytes(self.tag.as_bytes()),
            Field::GroupId => Value::Bytes(self.group_id.as_bytes()),
            Field::SequenceNumber => Value::Uint(self.sequence_number.into()),
            Field::SequenceTotal => Value::Uint(self.sequence_total.into()),
            Field::Priority => Value::Uint(self.priority.into()),
            Field::Timestamp => Value::Uint(self.timestamp),
            Field::Publisher => Value::Bytes(self.publisher.as_bytes()),
            Field::AuthIdentifier => Value::Bytes(self.auth_identifier.as_bytes()),
            Field::AuthGroup => Value::Bytes(self.auth_group.as_bytes()),
            Field::ChainPosition => Value::Uint(self.chain_position),
            Field::Hash => Value::Bytes(self.hash.as_bytes()),
            Field::PreviousHash => Value::Bytes(self.previous_hash.as_bytes()),
            Field::Nonce => Value::Bytes(self.nonce.as_bytes()),
            Field::DifficultyTarget => Value::Uint(self.difficulty_target.into()),
            Field::InfoType => Value::Bytes(self.info_type.as_bytes()),
            Field::InfoFormat => Value::Bytes(self.info_format.as_bytes()),
            Field::ContextData => Value::Bytes(&self.context_data),
            Field::ContentData => Value::Bytes(&self.content_data),
        }
    }

    fn assign(&mut self, field: Field, data: &[u8]) -> Result<(), CodecError> {
        let text = |data: &[u8]| {
            String::from_utf8(data.to_vec()).map_err(|_| CodecError::InvalidUtf8(field.name()))
        };
        // Widths were validated against the layout, so the narrowing casts
        // below never drop bits.
        let uint = || read_uint(data);
        match field {
            Field::Id => self.id = text(data)?,
            Field::Tag => self.tag = text(data)?,
            Field::GroupId => self.group_id = text(data)?,
            Field::SequenceNumber => self.sequence_number = uint() as u32,
            Field::SequenceTotal => self.sequence_total = uint() as u32,
            Field::Priority => self.priority = uint() as u8,
            Field::Timestamp => self.timestamp = uint(),
            Field::Publisher => self.publisher = text(data)?,
            Field::AuthIdentifier => self.auth_identifier = text(data)?,
            Field::AuthGroup => self.auth_group = text(data)?,
            Field::ChainPosition => self.chain_position = uint(),
            Field::Hash => self.hash = text(data)?,
            Field::PreviousHash => self.previous_hash = text(data)?,
            Field::Nonce => self.nonce = text(data)?,
            Field::DifficultyTarget => self.difficulty_target = uint() as u32,
            Field::InfoType => self.info_type = text(data)?,
            Field::InfoFormat => self.info_format = text(data)?,
            Field::ContextData => self.context_data = data.to_vec(),
            Field::ContentData => self.content_data = data.to_vec(),
        }
        Ok(())
    }
}

fn put_uint(out: &mut Vec<u8>, value: u64, width: usize) {
    out.extend_from_slice(&value.to_be_bytes()[8 - width..]);
}

fn read_uint(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

fn max_len(width: usize) -> u64 {
    (1u64 << (8 * width)) - 1
}

/// Encode a message into header and data sections, concatenated.
pub fn encode(message: &Message) -> Result<Vec<u8>, CodecError> {
    let mut header = Vec::with_capacity(HEADER_SIZE);
    let mut data = Vec::new();
    header.extend_from_slice(&message.version.to_be_bytes());

    for (field, slot) in LAYOUT {
        match message.value(field) {
            Value::Bytes(bytes) => {
                let width = slot.width();
                let max = max_len(width);
                if bytes.len() as u64 > max {
                    return Err(CodecError::FieldTooLong {
                        field: field.name(),
                        len: bytes.len(),
                        max,
                    });
                }
                put_uint(&mut header, bytes.len() as u64, width);
                data.extend_from_slice(bytes);
            }
            Value::Uint(0) => header.push(0),
            Value::Uint(value) => {
                let width = slot.width();
                header.push(width as u8);
                put_uint(&mut data, value, width);
            }
        }
    }

    header.extend_from_slice(&data);
    Ok(header)
}

/// Decode a message from one contiguous buffer.
pub fn decode(bytes: &[u8]) -> Result<Message, CodecError> {
    if bytes.len() < HEADER_SIZE {
        return Err(CodecError::Truncated {
            needed: HEADER_SIZE,
            available: bytes.len(),
        });
    }
    let (header, data) = bytes.split_at(HEADER_SIZE);
    decode_parts(header, data)
}

/// Decode a message whose header and data sections arrive separately.
pub fn decode_parts(header: &[u8], data: &[u8]) -> Result<Message, CodecError> {
    let lengths = field_lengths(header)?;
    let needed: usize = lengths.iter().map(|(_, len)| len).sum();
    if data.len() < needed {
        return Err(CodecError::Truncated {
            needed,
            available: data.len(),
        });
    }
    if data.len() > needed {
        return Err(CodecError::TrailingBytes(data.len() - needed));
    }

    let mut message = Message {
        version: read_uint(&header[..VERSION_SIZE]) as u16,
        ..Message::default()
    };
    let mut offset = 0;
    for (field, len) in lengths {
        message.assign(field, &data[offset..offset + len])?;
        offset += len;
    }
    Ok(message)
}

/// Length of the data section described by `header`.
pub fn payload_len(header: &[u8]) -> Result<usize, CodecError> {
    Ok(field_lengths(header)?.iter().map(|(_, len)| len).sum())
}

fn field_lengths(header: &[u8]) -> Result<Vec<(Field, usize)>, CodecError> {
    if header.len() < HEADER_SIZE {
        return Err(CodecError::Truncated {
            needed: HEADER_SIZE,
            available: header.len(),
        });
    }
    let version = read_uint(&header[..VERSION_SIZE]) as u16;
    if version != Message::VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }

    let mut lengths = Vec::with_capacity(LAYOUT.len());
    let mut cursor = VERSION_SIZE;
    for (field, slot) in LAYOUT {
        let slot_bytes = &header[cursor..cursor + slot.header_width()];
        cursor += slot.header_width();
        let len = match slot {
            Slot::Prefixed(_) => read_uint(slot_bytes) as usize,
            Slot::Fixed(width) => match slot_bytes[0] as usize {
                0 => 0,
                w if w == width => width,
                _ => {
                    return Err(CodecError::InvalidWidth {
                        field: field.name(),
                        width: slot_bytes[0],
                        expected: width,
                    });
                }
            },
        };
        lengths.push((field, len));
    }
    Ok(lengths)
}
