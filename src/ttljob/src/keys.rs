//! Primary-key encoding of raw range boundaries.
//!
//! The job only needs to turn raw range boundaries back into primary-key
//! tuples, which is what [`KeyDecoder`] exposes. [`OrderedKeyCodec`] is an
//! order-preserving encoding (`/table/index/col1/col2/...`) that backs the
//! in-memory store.

use chrono::DateTime;
use thiserror::Error;

use crate::types::{
    ColumnType, Datum, Datums, Direction, IndexId, PrimaryKeyColumn, RawKey, Span, TableId,
};

const TABLE_KEY_TAG: u8 = 0x80;

const NULL_TAG: u8 = 0x00;
const INT_TAG: u8 = 0x10;
const TIMESTAMP_TAG: u8 = 0x20;
const STRING_TAG: u8 = 0x30;

const ESCAPE: u8 = 0x00;
const ESCAPED_NUL: u8 = 0xff;
const ESCAPED_TERM: u8 = 0x01;

/// Result of decoding a raw key against a table's primary index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedKey {
    /// The key does not carry the table's prefix.
    OutsideTable,
    /// The key belongs to the table but not to its primary index.
    OutsideIndex,
    /// The decoded key columns. May be a prefix of the primary key.
    Tuple(Datums),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyDecodeError {
    #[error("key ended while decoding column {column}")]
    Truncated { column: String },

    #[error("invalid encoding tag {tag:#04x} for column {column}")]
    InvalidTag { column: String, tag: u8 },

    #[error("column {column} has type {expected:?} but the key holds tag {tag:#04x}")]
    TypeMismatch {
        column: String,
        expected: ColumnType,
        tag: u8,
    },

    #[error("invalid utf-8 in column {column}")]
    InvalidUtf8 { column: String },

    #[error("timestamp out of range in column {column}")]
    InvalidTimestamp { column: String },

    #[error("cannot encode {datum} into column {column} of type {expected:?}")]
    EncodeMismatch {
        column: String,
        expected: ColumnType,
        datum: String,
    },

    #[error("{given} values given for {columns} key columns")]
    TooManyValues { given: usize, columns: usize },
}

/// Translates raw keys of a table's primary index into key tuples.
pub trait KeyDecoder: Send + Sync + 'static {
    /// The key span holding every row of the table's primary index.
    fn primary_index_span(&self, table: TableId, index: IndexId) -> Span;

    /// Decodes `key` into the primary-key columns it carries.
    fn decode_primary_key(
        &self,
        key: &RawKey,
        table: TableId,
        index: IndexId,
        columns: &[PrimaryKeyColumn],
    ) -> Result<DecodedKey, KeyDecodeError>;
}

/// Order-preserving key codec.
///
/// Each datum is a tag byte followed by its payload. Integers and timestamps
/// are big-endian with the sign bit flipped, strings are NUL-escaped and
/// terminated. Descending columns store the bitwise complement.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrderedKeyCodec;

impl OrderedKeyCodec {
    pub fn table_prefix(&self, table: TableId) -> RawKey {
        let mut bytes = Vec::with_capacity(5);
        bytes.push(TABLE_KEY_TAG);
        bytes.extend_from_slice(&table.0.to_be_bytes());
        RawKey::new(bytes)
    }

    pub fn index_prefix(&self, table: TableId, index: IndexId) -> RawKey {
        let mut bytes = self.table_prefix(table).into_bytes();
        bytes.extend_from_slice(&index.0.to_be_bytes());
        RawKey::new(bytes)
    }

    /// Encodes a (possibly partial) primary-key tuple.
    pub fn encode_primary_key(
        &self,
        table: TableId,
        index: IndexId,
        columns: &[PrimaryKeyColumn],
        datums: &[Datum],
    ) -> Result<RawKey, KeyDecodeError> {
        if datums.len() > columns.len() {
            return Err(KeyDecodeError::TooManyValues {
                given: datums.len(),
                columns: columns.len(),
            });
        }

        let mut bytes = self.index_prefix(table, index).into_bytes();
        for (datum, column) in datums.iter().zip(columns) {
            encode_datum(&mut bytes, datum, column)?;
        }
        Ok(RawKey::new(bytes))
    }
}

impl KeyDecoder for OrderedKeyCodec {
    fn primary_index_span(&self, table: TableId, index: IndexId) -> Span {
        let prefix = self.index_prefix(table, index);
        let end = prefix.prefix_end();
        Span::new(prefix, end)
    }

    fn decode_primary_key(
        &self,
        key: &RawKey,
        table: TableId,
        index: IndexId,
        columns: &[PrimaryKeyColumn],
    ) -> Result<DecodedKey, KeyDecodeError> {
        if !key.starts_with(&self.table_prefix(table)) {
            return Ok(DecodedKey::OutsideTable);
        }
        let index_prefix = self.index_prefix(table, index);
        if !key.starts_with(&index_prefix) {
            return Ok(DecodedKey::OutsideIndex);
        }

        let rest = &key.as_bytes()[index_prefix.len()..];
        let mut datums = Vec::with_capacity(columns.len());
        let mut pos = 0;
        for column in columns {
            if pos == rest.len() {
                break;
            }
            let mut reader = KeyReader::new(rest, pos, column.direction);
            datums.push(decode_datum(&mut reader, column)?);
            pos = reader.pos;
        }

        Ok(DecodedKey::Tuple(datums))
    }
}

fn order_preserving(value: i64) -> [u8; 8] {
    ((value as u64) ^ (1 << 63)).to_be_bytes()
}

fn from_order_preserving(bytes: [u8; 8]) -> i64 {
    (u64::from_be_bytes(bytes) ^ (1 << 63)) as i64
}

fn encode_datum(
    buf: &mut Vec<u8>,
    datum: &Datum,
    column: &PrimaryKeyColumn,
) -> Result<(), KeyDecodeError> {
    let start = buf.len();
    match (datum, column.column_type) {
        (Datum::Null, _) => buf.push(NULL_TAG),
        (Datum::Int(v), ColumnType::Int) => {
            buf.push(INT_TAG);
            buf.extend_from_slice(&order_preserving(*v));
        }
        (Datum::Timestamp(ts), ColumnType::Timestamp) => {
            buf.push(TIMESTAMP_TAG);
            buf.extend_from_slice(&order_preserving(ts.timestamp_micros()));
        }
        (Datum::String(s), ColumnType::String) => {
            buf.push(STRING_TAG);
            for &byte in s.as_bytes() {
                if byte == ESCAPE {
                    buf.extend_from_slice(&[ESCAPE, ESCAPED_NUL]);
                } else {
                    buf.push(byte);
                }
            }
            buf.extend_from_slice(&[ESCAPE, ESCAPED_TERM]);
        }
        (datum, expected) => {
            return Err(KeyDecodeError::EncodeMismatch {
                column: column.name.clone(),
                expected,
                datum: datum.to_string(),
            });
        }
    }

    if column.direction == Direction::Descending {
        for byte in &mut buf[start..] {
            *byte = !*byte;
        }
    }
    Ok(())
}

/// Byte reader undoing the complement applied to descending columns.
struct KeyReader<'a> {
    bytes: &'a [u8],
    pos: usize,
    mask: u8,
}

impl<'a> KeyReader<'a> {
    fn new(bytes: &'a [u8], pos: usize, direction: Direction) -> Self {
        let mask = match direction {
            Direction::Ascending => 0x00,
            Direction::Descending => 0xff,
        };
        Self { bytes, pos, mask }
    }

    fn next_byte(&mut self) -> Option<u8> {
        let byte = *self.bytes.get(self.pos)?;
        self.pos += 1;
        Some(byte ^ self.mask)
    }

    fn next_word(&mut self) -> Option<[u8; 8]> {
        let mut word = [0u8; 8];
        for slot in &mut word {
            *slot = self.next_byte()?;
        }
        Some(word)
    }
}

fn decode_datum(reader: &mut KeyReader<'_>, column: &PrimaryKeyColumn) -> Result<Datum, KeyDecodeError> {
    let truncated = || KeyDecodeError::Truncated {
        column: column.name.clone(),
    };

    let tag = reader.next_byte().ok_or_else(truncated)?;
    let expected = match tag {
        NULL_TAG => return Ok(Datum::Null),
        INT_TAG => ColumnType::Int,
        TIMESTAMP_TAG => ColumnType::Timestamp,
        STRING_TAG => ColumnType::String,
        _ => {
            return Err(KeyDecodeError::InvalidTag {
                column: column.name.clone(),
                tag,
            });
        }
    };
    if expected != column.column_type {
        return Err(KeyDecodeError::TypeMismatch {
            column: column.name.clone(),
            expected: column.column_type,
            tag,
        });
    }

    match expected {
        ColumnType::Int => {
            let word = reader.next_word().ok_or_else(truncated)?;
            Ok(Datum::Int(from_order_preserving(word)))
        }
        ColumnType::Timestamp => {
            let word = reader.next_word().ok_or_else(truncated)?;
            let ts = DateTime::from_timestamp_micros(from_order_preserving(word)).ok_or_else(
                || KeyDecodeError::InvalidTimestamp {
                    column: column.name.clone(),
                },
            )?;
            Ok(Datum::Timestamp(ts))
        }
        ColumnType::String => {
            let mut bytes = Vec::new();
            loop {
                let byte = reader.next_byte().ok_or_else(truncated)?;
                if byte != ESCAPE {
                    bytes.push(byte);
                    continue;
                }
                match reader.next_byte().ok_or_else(truncated)? {
                    ESCAPED_NUL => bytes.push(0),
                    ESCAPED_TERM => break,
                    tag => {
                        return Err(KeyDecodeError::InvalidTag {
                            column: column.name.clone(),
                            tag,
                        });
                    }
                }
            }
            String::from_utf8(bytes)
                .map(Datum::String)
                .map_err(|_| KeyDecodeError::InvalidUtf8 {
                    column: column.name.clone(),
                })
        }
    }
}
