use std::borrow::Cow;
use std::fmt;

use smallvec::SmallVec;
use thiserror::Error;

use crate::decoder::{read_varint, read_varint_at};
use crate::header::TextEncoding;

/// A decoded column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(Text),
    Blob(Vec<u8>),
}

impl Value {
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&Text> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Integer(_) => "integer",
            Self::Real(_) => "real",
            Self::Text(_) => "text",
            Self::Blob(_) => "blob",
        }
    }

    fn display_blob(bytes: &[u8], f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("x'")?;
        for byte in bytes {
            write!(f, "{byte:02x}")?;
        }
        f.write_str("'")
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Integer(value) => write!(f, "{value}"),
            Self::Real(value) => write!(f, "{value}"),
            Self::Text(text) => f.write_str(&text.to_string_lossy()),
            Self::Blob(bytes) => Self::display_blob(bytes, f),
        }
    }
}

/// Text column bytes in the database's declared encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Text {
    bytes: Vec<u8>,
    encoding: TextEncoding,
}

impl Text {
    pub fn new(bytes: Vec<u8>, encoding: TextEncoding) -> Self {
        Self { bytes, encoding }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn encoding(&self) -> TextEncoding {
        self.encoding
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Borrow as `str` when the text is valid UTF-8 in a UTF-8 database.
    pub fn as_str(&self) -> Option<&str> {
        match self.encoding {
            TextEncoding::Utf8 => std::str::from_utf8(&self.bytes).ok(),
            TextEncoding::Utf16Le | TextEncoding::Utf16Be => None,
        }
    }

    pub fn to_string_lossy(&self) -> Cow<'_, str> {
        let units = |from: fn([u8; 2]) -> u16| {
            let units = self.bytes.chunks_exact(2).map(|pair| from([pair[0], pair[1]]));
            char::decode_utf16(units)
                .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
                .collect::<String>()
        };
        match self.encoding {
            TextEncoding::Utf8 => String::from_utf8_lossy(&self.bytes),
            TextEncoding::Utf16Le => Cow::Owned(units(u16::from_le_bytes)),
            TextEncoding::Utf16Be => Cow::Owned(units(u16::from_be_bytes)),
        }
    }
}

/// Per-column type code from a record header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SerialType {
    Null,
    Int8,
    Int16,
    Int24,
    Int32,
    Int48,
    Int64,
    Float,
    Zero,
    One,
    Blob(usize),
    Text(usize),
}

impl SerialType {
    /// Map a raw serial code; 10 and 11 are reserved and rejected.
    pub fn from_code(code: u64) -> Option<Self> {
        Some(match code {
            0 => Self::Null,
            1 => Self::Int8,
            2 => Self::Int16,
            3 => Self::Int24,
            4 => Self::Int32,
            5 => Self::Int48,
            6 => Self::Int64,
            7 => Self::Float,
            8 => Self::Zero,
            9 => Self::One,
            10 | 11 => return None,
            code if code % 2 == 0 => Self::Blob(usize::try_from((code - 12) / 2).ok()?),
            code => Self::Text(usize::try_from((code - 13) / 2).ok()?),
        })
    }

    pub fn code(self) -> u64 {
        match self {
            Self::Null => 0,
            Self::Int8 => 1,
            Self::Int16 => 2,
            Self::Int24 => 3,
            Self::Int32 => 4,
            Self::Int48 => 5,
            Self::Int64 => 6,
            Self::Float => 7,
            Self::Zero => 8,
            Self::One => 9,
            Self::Blob(len) => len as u64 * 2 + 12,
            Self::Text(len) => len as u64 * 2 + 13,
        }
    }

    /// Number of body bytes a value of this type occupies.
    pub fn body_len(self) -> usize {
        match self {
            Self::Null | Self::Zero | Self::One => 0,
            Self::Int8 => 1,
            Self::Int16 => 2,
            Self::Int24 => 3,
            Self::Int32 => 4,
            Self::Int48 => 6,
            Self::Int64 | Self::Float => 8,
            Self::Blob(len) | Self::Text(len) => len,
        }
    }
}

/// Why a record stopped decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RecordFaultKind {
    #[error("record header length {0} is invalid")]
    HeaderLength(u64),
    #[error("record header truncated")]
    HeaderTruncated,
    #[error("invalid serial type {0}")]
    InvalidSerialType(u64),
    #[error("body needs {needed} bytes, {available} remain")]
    BodyOverrun { needed: usize, available: usize },
}

/// Truncation marker: the column and payload offset where decoding stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordFault {
    pub column: usize,
    pub offset: usize,
    pub kind: RecordFaultKind,
}

/// Values decoded from one record, possibly cut short.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    pub values: Vec<Value>,
    pub fault: Option<RecordFault>,
}

impl Record {
    pub fn is_complete(&self) -> bool {
        self.fault.is_none()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }
}

/// The header half of a record: its length and raw serial codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub header_len: usize,
    pub serial_codes: SmallVec<[u64; 16]>,
}

impl RecordHeader {
    /// Parse a complete record header from the start of `bytes` without
    /// validating serial codes.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let (header_len, mut pos) = read_varint(bytes)?;
        let header_len = usize::try_from(header_len).ok()?;
        if header_len < pos || header_len > bytes.len() {
            return None;
        }

        let header = &bytes[..header_len];
        let mut serial_codes = SmallVec::new();
        while pos < header_len {
            serial_codes.push(read_varint_at(header, &mut pos)?);
        }
        Some(Self { header_len, serial_codes })
    }

    /// Sum of body lengths, `None` if any code is invalid or the sum
    /// overflows.
    pub fn body_len(&self) -> Option<usize> {
        self.serial_codes.iter().try_fold(0usize, |total, &code| {
            total.checked_add(SerialType::from_code(code)?.body_len())
        })
    }
}

/// Decode a record payload into values.
///
/// Decoding is strictly sequential. The first malformed header, invalid
/// serial type or body overrun stops it; the values decoded up to that
/// column are returned together with the fault.
pub fn decode_record(payload: &[u8], encoding: TextEncoding) -> Record {
    let mut record = Record::default();
    let fail = |record: &mut Record, column, offset, kind| {
        record.fault = Some(RecordFault { column, offset, kind });
    };

    let Some((header_len, mut header_pos)) = read_varint(payload) else {
        fail(&mut record, 0, 0, RecordFaultKind::HeaderTruncated);
        return record;
    };
    let header_end = match usize::try_from(header_len) {
        Ok(len) if len >= header_pos && len <= payload.len() => len,
        _ => {
            fail(&mut record, 0, 0, RecordFaultKind::HeaderLength(header_len));
            return record;
        }
    };

    let header = &payload[..header_end];
    let mut body_pos = header_end;
    while header_pos < header_end {
        let column = record.values.len();
        let code_offset = header_pos;
        let Some(code) = read_varint_at(header, &mut header_pos) else {
            fail(&mut record, column, code_offset, RecordFaultKind::HeaderTruncated);
            return record;
        };
        let Some(serial) = SerialType::from_code(code) else {
            fail(&mut record, column, code_offset, RecordFaultKind::InvalidSerialType(code));
            return record;
        };

        let len = serial.body_len();
        let available = payload.len() - body_pos;
        if len > available {
            fail(
                &mut record,
                column,
                body_pos,
                RecordFaultKind::BodyOverrun { needed: len, available },
            );
            return record;
        }

        record.values.push(decode_value(serial, &payload[body_pos..body_pos + len], encoding));
        body_pos += len;
    }

    record
}

/// Decode one column body. Callers slice `body` to `serial.body_len()`
/// bytes; a short body reads as if zero-padded on the left.
pub(crate) fn decode_value(serial: SerialType, body: &[u8], encoding: TextEncoding) -> Value {
    match serial {
        SerialType::Null => Value::Null,
        SerialType::Int8
        | SerialType::Int16
        | SerialType::Int24
        | SerialType::Int32
        | SerialType::Int48
        | SerialType::Int64 => Value::Integer(read_signed_be(body)),
        SerialType::Float => Value::Real(f64::from_bits(read_signed_be(body) as u64)),
        SerialType::Zero => Value::Integer(0),
        SerialType::One => Value::Integer(1),
        SerialType::Blob(_) => Value::Blob(body.to_vec()),
        SerialType::Text(_) => Value::Text(Text::new(body.to_vec(), encoding)),
    }
}

/// Big-endian two's complement integer of up to 8 bytes, sign-extended.
/// Only the last 8 bytes of a longer slice are read.
fn read_signed_be(bytes: &[u8]) -> i64 {
    let bytes = &bytes[bytes.len().saturating_sub(8)..];
    if bytes.is_empty() {
        return 0;
    }
    let len = bytes.len();
    let mut buf = [0u8; 8];
    buf[8 - len..].copy_from_slice(bytes);
    let shift = (8 - len) * 8;
    ((u64::from_be_bytes(buf) << shift) as i64) >> shift
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::decoder::varint_len;

    pub(crate) fn encode_varint(mut value: u64, out: &mut Vec<u8>) {
        if value > 0x00FF_FFFF_FFFF_FFFF {
            let mut buf = [0u8; 9];
            buf[8] = value as u8;
            value >>= 8;
            for idx in (0..8).rev() {
                buf[idx] = (value as u8 & 0x7F) | 0x80;
                value >>= 7;
            }
            out.extend_from_slice(&buf);
            return;
        }
        let len = varint_len(value);
        for idx in (0..len).rev() {
            let mut byte = ((value >> (idx * 7)) & 0x7F) as u8;
            if idx > 0 {
                byte |= 0x80;
            }
            out.push(byte);
        }
    }

    /// Build a record from `(serial code, body)` pairs.
    pub(crate) fn encode_record(columns: &[(u64, &[u8])]) -> Vec<u8> {
        let mut codes = Vec::new();
        for (code, _) in columns {
            encode_varint(*code, &mut codes);
        }
        let mut header_len = codes.len() + 1;
        if varint_len(header_len as u64) > 1 {
            header_len += 1;
        }
        let mut out = Vec::new();
        encode_varint(header_len as u64, &mut out);
        out.extend_from_slice(&codes);
        for (_, body) in columns {
            out.extend_from_slice(body);
        }
        out
    }

    #[test]
    fn decodes_each_integer_width_with_sign_extension() {
        let payload = encode_record(&[
            (1, &[0xFF]),
            (2, &[0x80, 0x00]),
            (3, &[0x7F, 0xFF, 0xFF]),
            (4, &[0xFF, 0xFF, 0xFF, 0xFE]),
            (5, &[0x80, 0, 0, 0, 0, 0]),
            (6, &i64::MIN.to_be_bytes()),
            (8, &[]),
            (9, &[]),
        ]);
        let record = decode_record(&payload, TextEncoding::Utf8);
        assert!(record.is_complete());
        let ints: Vec<_> = record.values.iter().map(|v| v.as_integer().unwrap()).collect();
        assert_eq!(ints, vec![-1, -32768, 8_388_607, -2, -(1 << 47), i64::MIN, 0, 1]);
    }

    #[test]
    fn decodes_real_text_blob_and_null() {
        let payload = encode_record(&[
            (0, &[]),
            (7, &1.5f64.to_be_bytes()),
            (13 + 2 * 5, b"hello"),
            (12 + 2 * 3, &[1, 2, 3]),
        ]);
        let record = decode_record(&payload, TextEncoding::Utf8);
        assert_eq!(record.len(), 4);
        assert!(record.values[0].is_null());
        assert_eq!(record.values[1], Value::Real(1.5));
        assert_eq!(record.values[2].as_text().and_then(Text::as_str), Some("hello"));
        assert_eq!(record.values[3], Value::Blob(vec![1, 2, 3]));
    }

    #[test]
    fn reserved_serial_type_stops_with_partial_values() {
        let payload = encode_record(&[(1, &[7]), (10, &[]), (1, &[8])]);
        let record = decode_record(&payload, TextEncoding::Utf8);
        assert_eq!(record.values, vec![Value::Integer(7)]);
        let fault = record.fault.expect("fault recorded");
        assert_eq!(fault.column, 1);
        assert_eq!(fault.kind, RecordFaultKind::InvalidSerialType(10));
    }

    #[test]
    fn body_overrun_is_reported_at_the_failing_column() {
        let mut payload = encode_record(&[(1, &[7]), (13 + 2 * 10, b"0123456789")]);
        payload.truncate(payload.len() - 4);
        let record = decode_record(&payload, TextEncoding::Utf8);
        assert_eq!(record.values, vec![Value::Integer(7)]);
        assert_eq!(
            record.fault.map(|f| (f.column, f.kind)),
            Some((1, RecordFaultKind::BodyOverrun { needed: 10, available: 6 }))
        );
    }

    #[test]
    fn header_length_past_payload_is_rejected() {
        let record = decode_record(&[0x20, 0x01, 0x01], TextEncoding::Utf8);
        assert!(record.is_empty());
        assert_eq!(record.fault.map(|f| f.kind), Some(RecordFaultKind::HeaderLength(0x20)));
    }

    #[test]
    fn utf16_text_decodes_lossily() {
        let le = Text::new(vec![b'h', 0, b'i', 0], TextEncoding::Utf16Le);
        assert_eq!(le.to_string_lossy(), "hi");
        assert_eq!(le.as_str(), None);
        let be = Text::new(vec![0, b'h', 0, b'i'], TextEncoding::Utf16Be);
        assert_eq!(be.to_string_lossy(), "hi");
    }

    #[test]
    fn serial_codes_round_trip() {
        for code in (0..=9).chain(12..40).chain([1_000_001, 1_000_002]) {
            let serial = SerialType::from_code(code).expect("legal code");
            assert_eq!(serial.code(), code);
        }
        assert_eq!(SerialType::from_code(10), None);
        assert_eq!(SerialType::from_code(11), None);
        assert_eq!(SerialType::from_code(12), Some(SerialType::Blob(0)));
        assert_eq!(SerialType::from_code(13), Some(SerialType::Text(0)));
    }

    #[test]
    fn record_header_reports_codes_and_body_length() {
        let payload = encode_record(&[(1, &[1]), (13 + 2 * 3, b"abc")]);
        let header = RecordHeader::parse(&payload).expect("header");
        assert_eq!(header.header_len, 3);
        assert_eq!(header.serial_codes.as_slice(), &[1, 19]);
        assert_eq!(header.body_len(), Some(4));
    }

    #[test]
    fn body_length_of_huge_serial_codes_does_not_overflow() {
        let mut payload = vec![28];
        for _ in 0..3 {
            payload.extend_from_slice(&[0xFF; 9]);
        }
        let header = RecordHeader::parse(&payload).expect("header");
        assert_eq!(header.serial_codes.len(), 3);
        assert_eq!(header.body_len(), None);

        let record = decode_record(&payload, TextEncoding::Utf8);
        assert!(record.values.is_empty());
        assert!(matches!(
            record.fault,
            Some(RecordFault { column: 0, kind: RecordFaultKind::BodyOverrun { .. }, .. })
        ));
    }

    #[test]
    fn mis_sized_bodies_decode_without_panicking() {
        assert_eq!(decode_value(SerialType::Int64, &[], TextEncoding::Utf8), Value::Integer(0));
        assert_eq!(decode_value(SerialType::Int8, &[0xFE], TextEncoding::Utf8), Value::Integer(-2));
        assert_eq!(decode_value(SerialType::Float, &[], TextEncoding::Utf8), Value::Real(0.0));
        let long = [0xAA, 0, 0, 0, 0, 0, 0, 0, 0x2A];
        assert_eq!(decode_value(SerialType::Int64, &long, TextEncoding::Utf8), Value::Integer(42));
    }
}
