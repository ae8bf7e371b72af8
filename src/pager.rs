use std::fmt;
use std::fs::File;
use std::num::NonZeroU32;
use std::ops::Deref;
use std::path::Path;

use log::warn;
use memmap2::Mmap;

use crate::decoder::Decoder;
use crate::error::{Error, HeaderError, Result};
use crate::header::{DbHeader, HEADER_SIZE};

/// Backing storage for the file image. Never mutated after open.
enum Bytes {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Deref for Bytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Self::Mapped(mmap) => &mmap[..],
            Self::Owned(bytes) => &bytes[..],
        }
    }
}

/// Read-only random access to a SQLite file as fixed-size pages.
pub struct Pager {
    header: DbHeader,
    bytes: Bytes,
    page_count: u32,
}

impl Pager {
    /// Memory-map the file at `path` read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(File::open(path)?)
    }

    /// Open a pager from a file handle.
    pub fn new(file: File) -> Result<Self> {
        let len = file.metadata()?.len() as usize;
        if len < HEADER_SIZE {
            return Err(HeaderError::FileTooSmall(len).into());
        }
        // SAFETY: the mapping is read-only and the file is never written by this
        // process. Concurrent external modification is outside what a forensic
        // copy should be subjected to.
        let mmap = unsafe { Mmap::map(&file) }?;
        Self::from_source(Bytes::Mapped(mmap))
    }

    /// Wrap an in-memory file image.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        Self::from_source(Bytes::Owned(bytes))
    }

    fn from_source(bytes: Bytes) -> Result<Self> {
        let header = DbHeader::parse(&bytes[..HEADER_SIZE.min(bytes.len())])?;

        let file_len = bytes.len();
        if file_len % header.page_size != 0 {
            warn!(
                "file length {file_len} is not a multiple of the page size {}; trailing {} bytes \
                 ignored",
                header.page_size,
                file_len % header.page_size
            );
        }

        let page_count = u32::try_from(file_len / header.page_size).unwrap_or(u32::MAX);
        if header.page_count_hint_is_valid() && header.page_count_hint != page_count {
            warn!(
                "header reports {} pages but the file holds {page_count}",
                header.page_count_hint
            );
        }

        Ok(Pager { header, bytes, page_count })
    }

    #[inline]
    /// Return the parsed database header.
    pub fn header(&self) -> &DbHeader {
        &self.header
    }

    /// Number of complete pages in the file.
    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    /// Length of the file image in bytes.
    pub fn file_len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether `page` names a page that exists in the file.
    pub fn contains(&self, page: u32) -> bool {
        page >= 1 && page <= self.page_count
    }

    /// Return the raw bytes for a page.
    pub fn page_bytes(&self, page_id: PageId) -> Result<&[u8]> {
        let page = page_id.into_inner();
        if !self.contains(page) {
            return Err(Error::PageRead { page });
        }

        let start = (page as usize - 1) * self.header.page_size;
        let end = start + self.header.page_size;
        self.bytes.get(start..end).ok_or(Error::PageRead { page })
    }

    /// Return a page reference.
    pub fn page(&self, page_id: PageId) -> Result<PageRef<'_>> {
        let bytes = self.page_bytes(page_id)?;
        Ok(PageRef { bytes, page_id, header: &self.header })
    }
}

/// Page wrapper with header-aware offsets.
#[derive(Clone, Copy)]
pub struct PageRef<'a> {
    bytes: &'a [u8],
    page_id: PageId,
    header: &'a DbHeader,
}

impl<'a> PageRef<'a> {
    pub fn id(&self) -> PageId {
        self.page_id
    }

    /// Byte offset of the b-tree page header; page 1 starts after the file header.
    pub fn offset(&self) -> usize {
        if self.page_id == PageId::ROOT { HEADER_SIZE } else { 0 }
    }

    /// Usable page size (page size minus reserved bytes).
    pub fn usable_size(&self) -> usize {
        self.header.usable_size
    }

    /// Return the raw bytes for the page.
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Return only the usable bytes for the page.
    pub fn usable_bytes(&self) -> &'a [u8] {
        let end = self.header.usable_size.min(self.bytes.len());
        &self.bytes[..end]
    }

    /// Create a decoder over the usable bytes positioned at `offset`.
    pub fn decoder_at(&self, offset: usize) -> Decoder<'a> {
        Decoder::new(self.usable_bytes()).split_at(offset)
    }
}

/// Non-zero SQLite page identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId(NonZeroU32);

impl PageId {
    /// Root page id (1), which holds the schema table.
    pub const ROOT: PageId = PageId(NonZeroU32::MIN);

    /// Create a page id, panicking if zero.
    pub fn new(id: u32) -> Self {
        Self::try_new(id).expect("page id must be non-zero")
    }

    /// Create a page id, returning `None` if zero.
    pub fn try_new(id: u32) -> Option<Self> {
        NonZeroU32::new(id).map(Self)
    }

    /// Return the underlying page number.
    pub fn into_inner(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
