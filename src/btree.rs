use std::borrow::Cow;

use log::warn;
use rustc_hash::FxHashSet;
use smallvec::SmallVec;

use crate::decoder::Decoder;
use crate::error::{Corruption, Error, OverflowFault, Result};
use crate::header::TextEncoding;
use crate::pager::{PageId, PageRef, Pager};
use crate::record::{Record, decode_record};

/// Largest payload SQLite will store (`SQLITE_MAX_LENGTH`).
const MAX_PAYLOAD_BYTES: u64 = 1_000_000_000;

/// Smallest on-page footprint of a cell; shorter cells are padded.
pub(crate) const MIN_CELL_SIZE: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BTreeKind {
    TableLeaf,
    TableInterior,
    IndexLeaf,
    IndexInterior,
}

impl BTreeKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x0D => Some(Self::TableLeaf),
            0x05 => Some(Self::TableInterior),
            0x0A => Some(Self::IndexLeaf),
            0x02 => Some(Self::IndexInterior),
            _ => None,
        }
    }

    pub fn is_leaf(self) -> bool {
        matches!(self, Self::TableLeaf | Self::IndexLeaf)
    }

    pub fn is_table(self) -> bool {
        matches!(self, Self::TableLeaf | Self::TableInterior)
    }

    pub fn header_size(self) -> usize {
        if self.is_leaf() { 8 } else { 12 }
    }
}

/// The 8- or 12-byte header at the start of every b-tree page.
#[derive(Clone, Copy, Debug)]
pub struct BTreePageHeader {
    pub kind: BTreeKind,
    /// Where the header starts (100 on page 1).
    pub offset: usize,
    pub first_freeblock: u16,
    pub cell_count: u16,
    pub content_start: usize,
    pub fragmented_bytes: u8,
    pub right_most_child: Option<u32>,
}

impl BTreePageHeader {
    pub fn parse(page: &PageRef<'_>) -> Result<Self> {
        let page_no = page.id().into_inner();
        let offset = page.offset();
        let mut decoder = page.decoder_at(offset);
        let truncated = || Error::corrupted(page_no, offset, Corruption::PageHeaderTruncated);

        let page_type = decoder.try_read_u8().ok_or_else(truncated)?;
        let kind = BTreeKind::from_byte(page_type)
            .ok_or(Error::corrupted(page_no, offset, Corruption::UnknownPageType(page_type)))?;
        let first_freeblock = decoder.try_read_u16().ok_or_else(truncated)?;
        let cell_count = decoder.try_read_u16().ok_or_else(truncated)?;
        let content_start = match decoder.try_read_u16().ok_or_else(truncated)? {
            0 => 65536,
            start => start as usize,
        };
        let fragmented_bytes = decoder.try_read_u8().ok_or_else(truncated)?;
        let right_most_child = if kind.is_leaf() {
            None
        } else {
            Some(decoder.try_read_u32().ok_or_else(truncated)?)
        };

        Ok(Self {
            kind,
            offset,
            first_freeblock,
            cell_count,
            content_start,
            fragmented_bytes,
            right_most_child,
        })
    }

    /// First byte of the cell pointer array.
    pub fn cell_ptrs_start(&self) -> usize {
        self.offset + self.kind.header_size()
    }

    /// One past the last byte of the cell pointer array.
    pub fn cell_ptrs_end(&self) -> usize {
        self.cell_ptrs_start() + self.cell_count as usize * 2
    }
}

/// The cell pointer array in key order.
pub fn cell_offsets(page: &PageRef<'_>, header: &BTreePageHeader) -> Result<Vec<usize>> {
    let bytes = page.usable_bytes();
    let ptrs = bytes.get(header.cell_ptrs_start()..header.cell_ptrs_end()).ok_or(
        Error::corrupted(
            page.id().into_inner(),
            header.cell_ptrs_start(),
            Corruption::CellPointerArrayOutOfBounds,
        ),
    )?;
    Ok(ptrs.chunks_exact(2).map(|ptr| u16::from_be_bytes([ptr[0], ptr[1]]) as usize).collect())
}

/// Maximum payload bytes a cell may keep on its own page.
pub(crate) fn max_local(kind: BTreeKind, usable_size: usize) -> usize {
    match kind {
        BTreeKind::TableLeaf | BTreeKind::TableInterior => usable_size - 35,
        BTreeKind::IndexLeaf | BTreeKind::IndexInterior => (usable_size - 12) * 64 / 255 - 23,
    }
}

fn min_local(usable_size: usize) -> usize {
    (usable_size - 12) * 32 / 255 - 23
}

/// Number of payload bytes stored on the b-tree page itself.
pub(crate) fn local_payload_len(kind: BTreeKind, usable_size: usize, payload_len: u64) -> usize {
    let max = max_local(kind, usable_size);
    if payload_len <= max as u64 {
        return payload_len as usize;
    }

    let min = min_local(usable_size);
    let surplus = min as u64 + (payload_len - min as u64) % (usable_size as u64 - 4);
    if surplus <= max as u64 { surplus as usize } else { min }
}

/// A parsed cell, borrowing its local payload from the page.
#[derive(Clone, Copy, Debug)]
pub struct Cell<'a> {
    pub offset: usize,
    /// Bytes the cell occupies on the page, including any overflow pointer.
    pub len: usize,
    pub left_child: Option<u32>,
    /// Rowid for table cells; `None` for index cells.
    pub rowid: Option<i64>,
    pub payload_len: u64,
    pub local: &'a [u8],
    pub first_overflow: Option<u32>,
}

/// Parse the cell at `offset` on a page of the given kind.
pub fn parse_cell<'a>(page: &PageRef<'a>, kind: BTreeKind, offset: usize) -> Result<Cell<'a>> {
    let page_no = page.id().into_inner();
    let bytes = page.usable_bytes();
    if offset < page.offset() + kind.header_size() || offset >= bytes.len() {
        return Err(Error::corrupted(page_no, offset, Corruption::CellOffsetOutOfBounds));
    }

    let truncated = || Error::corrupted(page_no, offset, Corruption::CellTruncated);
    let mut decoder = Decoder::new(bytes).split_at(offset);

    let left_child = match kind {
        BTreeKind::TableInterior | BTreeKind::IndexInterior => {
            Some(decoder.try_read_u32().ok_or_else(truncated)?)
        }
        BTreeKind::TableLeaf | BTreeKind::IndexLeaf => None,
    };

    if kind == BTreeKind::TableInterior {
        let key = decoder.try_read_varint().ok_or_else(truncated)? as i64;
        return Ok(Cell {
            offset,
            len: decoder.position() - offset,
            left_child,
            rowid: Some(key),
            payload_len: 0,
            local: &[],
            first_overflow: None,
        });
    }

    let payload_len = decoder.try_read_varint().ok_or_else(truncated)?;
    if payload_len > MAX_PAYLOAD_BYTES {
        return Err(Error::corrupted(page_no, offset, Corruption::PayloadTooLarge(payload_len)));
    }
    let rowid = match kind {
        BTreeKind::TableLeaf => Some(decoder.try_read_varint().ok_or_else(truncated)? as i64),
        _ => None,
    };

    let local_len = local_payload_len(kind, page.usable_size(), payload_len);
    let local = decoder.try_read_bytes(local_len).ok_or_else(truncated)?;
    let first_overflow = if (local_len as u64) < payload_len {
        Some(decoder.try_read_u32().ok_or_else(truncated)?)
    } else {
        None
    };

    Ok(Cell {
        offset,
        len: (decoder.position() - offset).max(MIN_CELL_SIZE),
        left_child,
        rowid,
        payload_len,
        local,
        first_overflow,
    })
}

/// A cell payload with its overflow chain resolved as far as possible.
#[derive(Debug)]
pub struct Payload<'a> {
    pub bytes: Cow<'a, [u8]>,
    pub overflow_pages: SmallVec<[PageId; 4]>,
    /// Set when the overflow chain broke before the declared length.
    pub fault: Option<Error>,
}

impl Payload<'_> {
    pub fn is_truncated(&self) -> bool {
        self.fault.is_some()
    }
}

/// Assemble a cell's full payload, following its overflow chain.
///
/// Each overflow page holds a 4-byte next pointer followed by data. A zero,
/// out-of-range or repeated pointer stops the chain; the bytes gathered so far
/// are returned with an [`Error::OverflowChain`] fault.
pub fn read_payload<'a>(pager: &'a Pager, page: PageId, cell: &Cell<'a>) -> Payload<'a> {
    let Some(first) = cell.first_overflow else {
        return Payload {
            bytes: Cow::Borrowed(cell.local),
            overflow_pages: SmallVec::new(),
            fault: None,
        };
    };

    let total = cell.payload_len as usize;
    let mut bytes = Vec::with_capacity(total);
    bytes.extend_from_slice(cell.local);
    let mut overflow_pages = SmallVec::new();
    let mut visited = FxHashSet::default();
    let mut next = first;

    let broken = |bytes: Vec<u8>, overflow_pages, next: u32, reason| Payload {
        bytes: bytes.into(),
        overflow_pages,
        fault: Some(Error::OverflowChain {
            page: page.into_inner(),
            offset: cell.offset,
            next,
            reason,
        }),
    };

    while bytes.len() < total {
        let Some(overflow) = PageId::try_new(next) else {
            return broken(bytes, overflow_pages, next, OverflowFault::ZeroPointer);
        };
        if !visited.insert(overflow) {
            return broken(bytes, overflow_pages, next, OverflowFault::Loop);
        }
        let Ok(page_bytes) = pager.page_bytes(overflow) else {
            return broken(bytes, overflow_pages, next, OverflowFault::OutOfRange);
        };

        overflow_pages.push(overflow);
        let usable = pager.header().usable_size.min(page_bytes.len());
        let content = &page_bytes[4..usable];
        let take = (total - bytes.len()).min(content.len());
        bytes.extend_from_slice(&content[..take]);
        next = u32::from_be_bytes([page_bytes[0], page_bytes[1], page_bytes[2], page_bytes[3]]);
    }

    Payload { bytes: bytes.into(), overflow_pages, fault: None }
}

/// How a b-tree entry is keyed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RowKey {
    Rowid(i64),
    /// Index entries are keyed by the record itself.
    Index,
}

impl RowKey {
    pub fn rowid(self) -> Option<i64> {
        match self {
            Self::Rowid(rowid) => Some(rowid),
            Self::Index => None,
        }
    }
}

/// One cell reached by [`walk`], in key order.
#[derive(Debug)]
pub struct CellVisit<'a> {
    pub page: PageId,
    pub kind: BTreeKind,
    pub offset: usize,
    pub key: RowKey,
    pub payload: Payload<'a>,
}

/// Events produced by [`walk`].
#[derive(Debug)]
pub enum Visit<'a> {
    Page { page: PageId, header: BTreePageHeader },
    Cell(CellVisit<'a>),
}

/// What a walk touched and what went wrong along the way.
#[derive(Debug, Default)]
pub struct WalkSummary {
    pub pages: Vec<(PageId, BTreeKind)>,
    pub overflow_pages: Vec<PageId>,
    pub cells: usize,
    pub faults: Vec<Error>,
}

impl WalkSummary {
    /// Whether any branch was cut short.
    pub fn is_partial(&self) -> bool {
        !self.faults.is_empty()
    }

    fn fault(&mut self, err: Error) {
        warn!("{err}");
        self.faults.push(err);
    }
}

enum Work {
    Page { page: PageId, parent: Option<PageId> },
    IndexKey { page: PageId, offset: usize },
}

/// Depth-first traversal of the b-tree rooted at `root`.
///
/// Uses an explicit work stack and a visited-page set rather than recursion.
/// Interior pages push their right-most child first and then, for each cell
/// in reverse, the child (and for index trees the separator key), so cells
/// reach `visit` in ascending key order. A damaged branch is recorded in the
/// returned summary and its siblings are still visited.
pub fn walk<'a, F>(pager: &'a Pager, root: PageId, mut visit: F) -> WalkSummary
where
    F: FnMut(Visit<'a>),
{
    let mut summary = WalkSummary::default();
    let mut visited = FxHashSet::default();
    let mut stack = vec![Work::Page { page: root, parent: None }];
    let mut is_table_tree = None;

    while let Some(work) = stack.pop() {
        let (page_id, parent) = match work {
            Work::Page { page, parent } => (page, parent),
            Work::IndexKey { page, offset } => {
                if let Ok(page_ref) = pager.page(page) {
                    emit_cell(
                        pager,
                        &page_ref,
                        BTreeKind::IndexInterior,
                        offset,
                        &mut summary,
                        &mut visit,
                    );
                }
                continue;
            }
        };

        if !visited.insert(page_id) {
            let parent = parent.map_or(0, PageId::into_inner);
            summary.fault(Error::CycleDetected { page: page_id.into_inner(), parent });
            continue;
        }

        let page = match pager.page(page_id) {
            Ok(page) => page,
            Err(err) => {
                summary.fault(err);
                continue;
            }
        };
        let header = match BTreePageHeader::parse(&page) {
            Ok(header) => header,
            Err(err) => {
                summary.fault(err);
                continue;
            }
        };
        if *is_table_tree.get_or_insert(header.kind.is_table()) != header.kind.is_table() {
            let raw = page.usable_bytes()[header.offset];
            summary.fault(Error::corrupted(
                page_id.into_inner(),
                header.offset,
                Corruption::WrongTreeFamily(raw),
            ));
            continue;
        }

        summary.pages.push((page_id, header.kind));
        visit(Visit::Page { page: page_id, header });

        let offsets = match cell_offsets(&page, &header) {
            Ok(offsets) => offsets,
            Err(err) => {
                summary.fault(err);
                continue;
            }
        };

        if header.kind.is_leaf() {
            for offset in offsets {
                emit_cell(pager, &page, header.kind, offset, &mut summary, &mut visit);
            }
            continue;
        }

        match header.right_most_child.and_then(PageId::try_new) {
            Some(right_most) => stack.push(Work::Page { page: right_most, parent: Some(page_id) }),
            None => summary.fault(Error::corrupted(
                page_id.into_inner(),
                header.offset + 8,
                Corruption::ChildPageZero,
            )),
        }

        for offset in offsets.into_iter().rev() {
            let cell = match parse_cell(&page, header.kind, offset) {
                Ok(cell) => cell,
                Err(err) => {
                    summary.fault(err);
                    continue;
                }
            };
            if header.kind == BTreeKind::IndexInterior {
                stack.push(Work::IndexKey { page: page_id, offset });
            }
            match cell.left_child.and_then(PageId::try_new) {
                Some(child) => stack.push(Work::Page { page: child, parent: Some(page_id) }),
                None => summary.fault(Error::corrupted(
                    page_id.into_inner(),
                    offset,
                    Corruption::ChildPageZero,
                )),
            }
        }
    }

    summary
}

fn emit_cell<'a, F>(
    pager: &'a Pager,
    page: &PageRef<'a>,
    kind: BTreeKind,
    offset: usize,
    summary: &mut WalkSummary,
    visit: &mut F,
) where
    F: FnMut(Visit<'a>),
{
    let cell = match parse_cell(page, kind, offset) {
        Ok(cell) => cell,
        Err(err) => {
            summary.fault(err);
            return;
        }
    };

    let payload = read_payload(pager, page.id(), &cell);
    summary.overflow_pages.extend(payload.overflow_pages.iter().copied());
    if let Some(&Error::OverflowChain { page, offset, next, reason }) = payload.fault.as_ref() {
        summary.fault(Error::OverflowChain { page, offset, next, reason });
    }

    let key = cell.rowid.map_or(RowKey::Index, RowKey::Rowid);
    summary.cells += 1;
    visit(Visit::Cell(CellVisit { page: page.id(), kind, offset, key, payload }));
}

/// A decoded entry of a table or index b-tree.
#[derive(Debug, Clone)]
pub struct TreeRecord {
    pub page: PageId,
    pub offset: usize,
    pub key: RowKey,
    pub record: Record,
    pub overflow_truncated: bool,
}

/// Walk the tree at `root` and decode every cell's record.
///
/// A record that fails to decode from a complete payload is corrupt: it is
/// logged, recorded as a fault and skipped. A record cut short by a broken
/// overflow chain is kept with whatever columns survived.
pub fn collect_records(
    pager: &Pager,
    root: PageId,
    encoding: TextEncoding,
) -> (Vec<TreeRecord>, WalkSummary) {
    let mut records = Vec::new();
    let mut corrupt = Vec::new();

    let mut summary = walk(pager, root, |visit| {
        let Visit::Cell(cell) = visit else {
            return;
        };
        let record = decode_record(&cell.payload.bytes, encoding);
        let overflow_truncated = cell.payload.is_truncated();
        if let Some(fault) = record.fault.filter(|_| !overflow_truncated) {
            corrupt.push(Error::RecordDecode {
                page: cell.page.into_inner(),
                offset: cell.offset,
                column: fault.column,
                reason: fault.kind,
            });
            return;
        }
        records.push(TreeRecord {
            page: cell.page,
            offset: cell.offset,
            key: cell.key,
            record,
            overflow_truncated,
        });
    });

    for err in corrupt {
        summary.fault(err);
    }
    (records, summary)
}
