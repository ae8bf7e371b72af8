use std::fmt;

use log::warn;

use crate::error::HeaderError;

pub const HEADER_SIZE: usize = 100;
pub const MAGIC: &[u8; 16] = b"SQLite format 3\0";

/// Smallest usable page size the file format permits.
const MIN_USABLE_SIZE: usize = 480;

/// Text encoding declared at header offset 56.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    Utf16Le,
    Utf16Be,
}

impl TextEncoding {
    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            // Zero only appears in freshly created, still empty files.
            0 | 1 => Some(Self::Utf8),
            2 => Some(Self::Utf16Le),
            3 => Some(Self::Utf16Be),
            _ => None,
        }
    }
}

impl fmt::Display for TextEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Utf8 => f.write_str("UTF-8"),
            Self::Utf16Le => f.write_str("UTF-16le"),
            Self::Utf16Be => f.write_str("UTF-16be"),
        }
    }
}

/// Journalling mode implied by the read/write format versions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JournalMode {
    Legacy,
    Wal,
    Unknown(u8),
}

impl JournalMode {
    fn from_version(version: u8) -> Self {
        match version {
            1 => Self::Legacy,
            2 => Self::Wal,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for JournalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Legacy => f.write_str("legacy rollback journal"),
            Self::Wal => f.write_str("WAL"),
            Self::Unknown(raw) => write!(f, "unknown ({raw})"),
        }
    }
}

/// Parsed SQLite database header values.
#[derive(Debug, Clone)]
pub struct DbHeader {
    pub page_size: usize,
    pub page_size_raw: u16,
    pub write_version: u8,
    pub read_version: u8,
    pub reserved: u8,
    pub usable_size: usize,
    pub max_payload_fraction: u8,
    pub min_payload_fraction: u8,
    pub leaf_payload_fraction: u8,
    pub change_counter: u32,
    pub page_count_hint: u32,
    pub first_freelist_trunk: u32,
    pub freelist_count: u32,
    pub schema_cookie: u32,
    pub schema_format: u32,
    pub default_cache_size: i32,
    pub largest_root_page: u32,
    pub encoding_raw: u32,
    pub encoding: TextEncoding,
    pub user_version: u32,
    pub incremental_vacuum: u32,
    pub application_id: u32,
    /// Bytes 72..92, reserved for expansion and zero in a well-formed file.
    pub expansion: [u8; 20],
    pub version_valid_for: u32,
    pub sqlite_version: u32,
}

impl DbHeader {
    /// Parse the 100-byte SQLite database header.
    ///
    /// Only a bad magic string or an impossible page geometry is fatal.
    /// Anything else a damaged or unusual file may carry is kept and logged.
    pub fn parse(header: &[u8]) -> Result<Self, HeaderError> {
        if header.len() < HEADER_SIZE {
            return Err(HeaderError::FileTooSmall(header.len()));
        }

        if &header[..16] != MAGIC {
            return Err(HeaderError::InvalidMagic);
        }

        let page_size_raw = be_u16(header, 16);
        let page_size = match page_size_raw {
            1 => 65536usize,
            size => size as usize,
        };
        if !is_valid_page_size(page_size) {
            return Err(HeaderError::InvalidPageSize(page_size_raw));
        }

        let reserved = header[20];
        let usable_size = page_size - reserved as usize;
        if usable_size < MIN_USABLE_SIZE {
            return Err(HeaderError::ReservedSpaceTooLarge { reserved, page_size });
        }

        let write_version = header[18];
        let read_version = header[19];
        if write_version == 2 || read_version == 2 {
            warn!("database is in WAL mode; uncheckpointed frames are not in this file");
        }

        let (max_payload_fraction, min_payload_fraction, leaf_payload_fraction) =
            (header[21], header[22], header[23]);
        if (max_payload_fraction, min_payload_fraction, leaf_payload_fraction) != (64, 32, 32) {
            warn!(
                "non-standard payload fractions {max_payload_fraction}/{min_payload_fraction}/\
                 {leaf_payload_fraction}"
            );
        }

        let encoding_raw = be_u32(header, 56);
        let encoding = TextEncoding::from_raw(encoding_raw).unwrap_or_else(|| {
            warn!("unknown text encoding {encoding_raw}, decoding text as UTF-8");
            TextEncoding::Utf8
        });

        let mut expansion = [0u8; 20];
        expansion.copy_from_slice(&header[72..92]);

        Ok(DbHeader {
            page_size,
            page_size_raw,
            write_version,
            read_version,
            reserved,
            usable_size,
            max_payload_fraction,
            min_payload_fraction,
            leaf_payload_fraction,
            change_counter: be_u32(header, 24),
            page_count_hint: be_u32(header, 28),
            first_freelist_trunk: be_u32(header, 32),
            freelist_count: be_u32(header, 36),
            schema_cookie: be_u32(header, 40),
            schema_format: be_u32(header, 44),
            default_cache_size: be_u32(header, 48) as i32,
            largest_root_page: be_u32(header, 52),
            encoding_raw,
            encoding,
            user_version: be_u32(header, 60),
            incremental_vacuum: be_u32(header, 64),
            application_id: be_u32(header, 68),
            expansion,
            version_valid_for: be_u32(header, 92),
            sqlite_version: be_u32(header, 96),
        })
    }

    pub fn journal_mode(&self) -> JournalMode {
        match (self.write_version, self.read_version) {
            (2, _) | (_, 2) => JournalMode::Wal,
            (write, _) => JournalMode::from_version(write),
        }
    }

    pub fn is_wal(&self) -> bool {
        self.journal_mode() == JournalMode::Wal
    }

    /// The in-header page count is only trustworthy when it is non-zero and
    /// the change counter matches version-valid-for.
    pub fn page_count_hint_is_valid(&self) -> bool {
        self.page_count_hint > 0 && self.change_counter == self.version_valid_for
    }

    /// Every header field as `(name, raw, interpreted)`.
    pub fn describe(&self) -> Vec<HeaderField> {
        let field = |name: &'static str, raw: String, meaning: String| HeaderField {
            name,
            raw,
            meaning,
        };

        let page_size_meaning = if self.page_size_raw == 1 {
            "65536 (SQLite 3.7.1 or later)".to_owned()
        } else {
            self.page_size.to_string()
        };

        let page_count_meaning = if self.page_count_hint_is_valid() {
            format!("{} page(s)", self.page_count_hint)
        } else {
            format!("invalid: {}", self.page_count_hint)
        };

        let mut change_counter_meaning = self.change_counter.to_string();
        if self.is_wal() {
            change_counter_meaning.push_str(" (WAL enabled, may be stale)");
        }

        let schema_format_meaning = match self.schema_format {
            1 => "1 - SQLite 3.0.0+".to_owned(),
            2 => "2 - SQLite 3.1.3+".to_owned(),
            3 => "3 - SQLite 3.1.4+".to_owned(),
            4 => "4 - SQLite 3.3.0+".to_owned(),
            other => format!("invalid: {other}"),
        };

        let (root_meaning, vacuum_meaning) = if self.largest_root_page == 0 {
            let vacuum = if self.incremental_vacuum == 0 {
                "0 - no auto-vacuum".to_owned()
            } else {
                format!("invalid: {}", self.incremental_vacuum)
            };
            ("0 - ptrmap pages disabled".to_owned(), vacuum)
        } else {
            let vacuum = if self.incremental_vacuum == 0 {
                "0 - full auto-vacuum".to_owned()
            } else {
                format!("{} - incremental vacuum", self.incremental_vacuum)
            };
            (self.largest_root_page.to_string(), vacuum)
        };

        let encoding_meaning = match TextEncoding::from_raw(self.encoding_raw) {
            Some(encoding) => encoding.to_string(),
            None => format!("invalid: {}", self.encoding_raw),
        };

        let fraction = |value: u8, expected: u8| {
            if value == expected { value.to_string() } else { format!("invalid: {value}") }
        };

        vec![
            field("page_size", self.page_size_raw.to_string(), page_size_meaning),
            field(
                "write_version",
                self.write_version.to_string(),
                JournalMode::from_version(self.write_version).to_string(),
            ),
            field(
                "read_version",
                self.read_version.to_string(),
                JournalMode::from_version(self.read_version).to_string(),
            ),
            field("reserved_space", self.reserved.to_string(), self.reserved.to_string()),
            field(
                "max_payload_fraction",
                self.max_payload_fraction.to_string(),
                fraction(self.max_payload_fraction, 64),
            ),
            field(
                "min_payload_fraction",
                self.min_payload_fraction.to_string(),
                fraction(self.min_payload_fraction, 32),
            ),
            field(
                "leaf_payload_fraction",
                self.leaf_payload_fraction.to_string(),
                fraction(self.leaf_payload_fraction, 32),
            ),
            field("change_counter", self.change_counter.to_string(), change_counter_meaning),
            field("page_count", self.page_count_hint.to_string(), page_count_meaning),
            field(
                "first_freelist_trunk",
                self.first_freelist_trunk.to_string(),
                self.first_freelist_trunk.to_string(),
            ),
            field(
                "freelist_count",
                self.freelist_count.to_string(),
                self.freelist_count.to_string(),
            ),
            field("schema_cookie", self.schema_cookie.to_string(), self.schema_cookie.to_string()),
            field("schema_format", self.schema_format.to_string(), schema_format_meaning),
            field(
                "default_cache_size",
                self.default_cache_size.to_string(),
                self.default_cache_size.to_string(),
            ),
            field("largest_root_page", self.largest_root_page.to_string(), root_meaning),
            field("text_encoding", self.encoding_raw.to_string(), encoding_meaning),
            field("user_version", self.user_version.to_string(), self.user_version.to_string()),
            field("incremental_vacuum", self.incremental_vacuum.to_string(), vacuum_meaning),
            field(
                "application_id",
                self.application_id.to_string(),
                format!("0x{:08x}", self.application_id),
            ),
            field(
                "expansion",
                self.expansion.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(":"),
                if self.expansion.iter().all(|&b| b == 0) {
                    "zeroed".to_string()
                } else {
                    "non-zero bytes in reserved area".to_string()
                },
            ),
            field(
                "version_valid_for",
                self.version_valid_for.to_string(),
                self.version_valid_for.to_string(),
            ),
            field(
                "sqlite_version",
                self.sqlite_version.to_string(),
                format_sqlite_version(self.sqlite_version),
            ),
        ]
    }
}

/// One row of [`DbHeader::describe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: &'static str,
    pub raw: String,
    pub meaning: String,
}

fn format_sqlite_version(raw: u32) -> String {
    format!("{}.{}.{}", raw / 1_000_000, (raw / 1000) % 1000, raw % 1000)
}

#[inline]
fn be_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([bytes[offset], bytes[offset + 1]])
}

#[inline]
fn be_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]])
}

fn is_valid_page_size(page_size: usize) -> bool {
    (512..=65536).contains(&page_size) && page_size.is_power_of_two()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_with_page_size(raw: u16) -> [u8; HEADER_SIZE] {
        let mut header = [0u8; HEADER_SIZE];
        header[..16].copy_from_slice(MAGIC);
        header[16..18].copy_from_slice(&raw.to_be_bytes());
        header[18] = 1;
        header[19] = 1;
        header[21] = 64;
        header[22] = 32;
        header[23] = 32;
        header[44..48].copy_from_slice(&4u32.to_be_bytes());
        header[56..60].copy_from_slice(&1u32.to_be_bytes());
        header
    }

    #[test]
    fn decodes_every_valid_page_size() {
        for shift in 9..=15 {
            let size = 1u16 << shift;
            let header = DbHeader::parse(&header_with_page_size(size)).expect("valid header");
            assert_eq!(header.page_size, size as usize);
            assert!(header.page_size.is_power_of_two());
        }

        let header = DbHeader::parse(&header_with_page_size(1)).expect("valid header");
        assert_eq!(header.page_size, 65536);
        assert_eq!(header.describe()[0].meaning, "65536 (SQLite 3.7.1 or later)");
    }

    #[test]
    fn rejects_bad_page_sizes_and_magic() {
        for raw in [0u16, 2, 256, 1000, 4097] {
            let err = DbHeader::parse(&header_with_page_size(raw)).unwrap_err();
            assert_eq!(err, HeaderError::InvalidPageSize(raw));
        }

        let mut header = header_with_page_size(4096);
        header[0] = b's';
        assert_eq!(DbHeader::parse(&header).unwrap_err(), HeaderError::InvalidMagic);
        assert_eq!(DbHeader::parse(&header[..50]).unwrap_err(), HeaderError::FileTooSmall(50));
    }

    #[test]
    fn usable_size_subtracts_reserved_bytes() {
        let mut header = header_with_page_size(1024);
        header[20] = 32;
        let parsed = DbHeader::parse(&header).expect("valid header");
        assert_eq!(parsed.usable_size, 992);

        let mut small = header_with_page_size(512);
        small[20] = 64;
        assert!(matches!(
            DbHeader::parse(&small),
            Err(HeaderError::ReservedSpaceTooLarge { reserved: 64, page_size: 512 })
        ));
    }

    #[test]
    fn wal_and_odd_encodings_are_not_fatal() {
        let mut header = header_with_page_size(4096);
        header[18] = 2;
        header[19] = 2;
        header[56..60].copy_from_slice(&9u32.to_be_bytes());
        let parsed = DbHeader::parse(&header).expect("header still parses");
        assert!(parsed.is_wal());
        assert_eq!(parsed.encoding, TextEncoding::Utf8);

        let described = parsed.describe();
        let encoding = described.iter().find(|f| f.name == "text_encoding").unwrap();
        assert_eq!(encoding.meaning, "invalid: 9");
        let read = described.iter().find(|f| f.name == "read_version").unwrap();
        assert_eq!(read.meaning, "WAL");
    }

    #[test]
    fn extracts_freelist_and_schema_fields() {
        let mut header = header_with_page_size(4096);
        header[24..28].copy_from_slice(&7u32.to_be_bytes());
        header[28..32].copy_from_slice(&12u32.to_be_bytes());
        header[32..36].copy_from_slice(&9u32.to_be_bytes());
        header[36..40].copy_from_slice(&3u32.to_be_bytes());
        header[40..44].copy_from_slice(&5u32.to_be_bytes());
        header[92..96].copy_from_slice(&7u32.to_be_bytes());
        header[96..100].copy_from_slice(&3_045_001u32.to_be_bytes());
        let parsed = DbHeader::parse(&header).expect("valid header");
        assert_eq!(parsed.first_freelist_trunk, 9);
        assert_eq!(parsed.freelist_count, 3);
        assert_eq!(parsed.schema_cookie, 5);
        assert!(parsed.page_count_hint_is_valid());

        let described = parsed.describe();
        let version = described.iter().find(|f| f.name == "sqlite_version").unwrap();
        assert_eq!(version.meaning, "3.45.1");
    }

    #[test]
    fn expansion_block_is_described_between_application_id_and_version() {
        let mut header = header_with_page_size(4096);
        let parsed = DbHeader::parse(&header).expect("valid header");
        let described = parsed.describe();
        let names: Vec<_> = described.iter().map(|f| f.name).collect();
        let at = names.iter().position(|&name| name == "expansion").expect("expansion row");
        assert_eq!(names[at - 1], "application_id");
        assert_eq!(names[at + 1], "version_valid_for");
        assert_eq!(described[at].raw, vec!["00"; 20].join(":"));
        assert_eq!(described[at].meaning, "zeroed");

        header[72] = 0xAB;
        header[91] = 0x01;
        let parsed = DbHeader::parse(&header).expect("expansion bytes are not fatal");
        assert_eq!(parsed.expansion[0], 0xAB);
        let expansion = parsed.describe().into_iter().find(|f| f.name == "expansion").unwrap();
        assert!(expansion.raw.starts_with("ab:00:"));
        assert!(expansion.raw.ends_with(":01"));
        assert_eq!(expansion.meaning, "non-zero bytes in reserved area");
    }
}
