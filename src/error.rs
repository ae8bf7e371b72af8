use thiserror::Error;

use crate::record::RecordFaultKind;

pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error.
///
/// Only [`Error::CorruptHeader`] and [`Error::Io`] abort an analysis. Every
/// other variant is recorded as a fault against the traversal branch, page or
/// record it came from, and the run carries on.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    #[error("corrupt database header: {0}")]
    CorruptHeader(#[from] HeaderError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("page {page} lies beyond the end of the file")]
    PageRead { page: u32 },

    #[error("record on page {page} at offset {offset} failed at column {column}: {reason}")]
    RecordDecode { page: u32, offset: usize, column: usize, reason: RecordFaultKind },

    #[error("overflow chain from page {page} offset {offset} broken at page {next}: {reason}")]
    OverflowChain { page: u32, offset: usize, next: u32, reason: OverflowFault },

    #[error("b-tree page {page} revisited from page {parent}")]
    CycleDetected { page: u32, parent: u32 },

    #[error("corrupted page {page} at offset {offset}: {kind}")]
    Corrupted { page: u32, offset: usize, kind: Corruption },
}

impl Error {
    /// Page the error refers to, if any.
    pub fn page(&self) -> Option<u32> {
        match self {
            Self::CorruptHeader(_) | Self::Io(_) => None,
            Self::PageRead { page }
            | Self::RecordDecode { page, .. }
            | Self::OverflowChain { page, .. }
            | Self::CycleDetected { page, .. }
            | Self::Corrupted { page, .. } => Some(*page),
        }
    }

    /// Whether the error aborts the whole run rather than one branch.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::CorruptHeader(_) | Self::Io(_))
    }

    pub(crate) fn corrupted(page: u32, offset: usize, kind: Corruption) -> Self {
        Self::Corrupted { page, offset, kind }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HeaderError {
    #[error("file is {0} bytes, shorter than the 100-byte header")]
    FileTooSmall(usize),
    #[error("magic string is not \"SQLite format 3\"")]
    InvalidMagic,
    #[error("page size {0} is not a power of two between 512 and 65536")]
    InvalidPageSize(u16),
    #[error("{reserved} reserved bytes leave too little usable space in a {page_size}-byte page")]
    ReservedSpaceTooLarge { reserved: u8, page_size: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum OverflowFault {
    #[error("next pointer is zero before the payload is complete")]
    ZeroPointer,
    #[error("page is out of range")]
    OutOfRange,
    #[error("page already belongs to this chain")]
    Loop,
}

/// Structural damage found while parsing a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Corruption {
    #[error("page header truncated")]
    PageHeaderTruncated,
    #[error("unknown b-tree page type 0x{0:02X}")]
    UnknownPageType(u8),
    #[error("page type 0x{0:02X} belongs to the other b-tree family")]
    WrongTreeFamily(u8),
    #[error("cell pointer array out of bounds")]
    CellPointerArrayOutOfBounds,
    #[error("cell offset out of bounds")]
    CellOffsetOutOfBounds,
    #[error("cell truncated")]
    CellTruncated,
    #[error("child page id is zero")]
    ChildPageZero,
    #[error("payload of {0} bytes is too large")]
    PayloadTooLarge(u64),
    #[error("freeblock chain is malformed")]
    FreeblockChain,
    #[error("byte spans overlap")]
    OverlappingSpans,
    #[error("partition covers {actual} bytes, usable size is {expected}")]
    PartitionMismatch { expected: usize, actual: usize },
    #[error("freelist trunk is malformed")]
    FreelistTrunk,
}
