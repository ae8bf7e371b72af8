use std::fmt;

use log::warn;
use rustc_hash::FxHashSet;

use crate::btree::{BTreePageHeader, cell_offsets, parse_cell};
use crate::error::{Corruption, Error, Result};
use crate::pager::{PageId, PageRef, Pager};

/// Where a run of unallocated bytes came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegionSource {
    /// A node of the page's freeblock chain, header included.
    Freeblock,
    /// Between the cell pointer array and the cell content area.
    TrailingGap,
    /// A hole under 4 bytes inside the content area.
    FragmentedByte,
    /// A whole freelist leaf page.
    FreePage,
    /// Content-area bytes claimed by neither a cell nor a freeblock.
    Unaccounted,
    /// The unused tail of a freelist trunk page.
    TrunkSlack,
}

impl fmt::Display for RegionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Freeblock => "freeblock",
            Self::TrailingGap => "trailing gap",
            Self::FragmentedByte => "fragmented bytes",
            Self::FreePage => "free page",
            Self::Unaccounted => "unaccounted",
            Self::TrunkSlack => "trunk slack",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UnallocatedRegion {
    pub page: PageId,
    pub offset: usize,
    pub len: usize,
    pub source: RegionSource,
}

impl UnallocatedRegion {
    pub fn end(&self) -> usize {
        self.offset + self.len
    }

    /// The region's bytes within its page.
    pub fn bytes<'a>(&self, pager: &'a Pager) -> Result<&'a [u8]> {
        let page = pager.page_bytes(self.page)?;
        page.get(self.offset..self.end()).ok_or(Error::corrupted(
            self.page.into_inner(),
            self.offset,
            Corruption::CellOffsetOutOfBounds,
        ))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpanKind {
    /// Page header, plus the file header on page 1.
    Header,
    CellPointers,
    Cell,
    Unallocated(RegionSource),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Span {
    pub offset: usize,
    pub len: usize,
    pub kind: SpanKind,
}

/// How the usable bytes of one b-tree page divide between live structures
/// and free space.
#[derive(Debug)]
pub struct PageLayout {
    pub page: PageId,
    pub header: BTreePageHeader,
    pub usable_size: usize,
    /// Sorted by offset.
    pub spans: Vec<Span>,
    pub faults: Vec<Error>,
    overlap: Option<usize>,
}

impl PageLayout {
    /// Partition a b-tree page. Fails only when the page header itself is
    /// unreadable; everything after that is recorded as faults.
    pub fn analyze(page: &PageRef<'_>) -> Result<Self> {
        let header = BTreePageHeader::parse(page)?;
        let page_no = page.id().into_inner();
        let bytes = page.usable_bytes();
        let usable = bytes.len();

        let mut builder = Coverage::new(usable);
        let mut faults = Vec::new();
        let mut fault = |err: Error| {
            warn!("{err}");
            faults.push(err);
        };

        let header_end = header.cell_ptrs_start();
        builder.claim(0, header_end, SpanKind::Header);

        let ptrs_end = if header.cell_ptrs_end() > usable {
            fault(Error::corrupted(
                page_no,
                header_end,
                Corruption::CellPointerArrayOutOfBounds,
            ));
            usable
        } else {
            header.cell_ptrs_end()
        };
        builder.claim(header_end, ptrs_end, SpanKind::CellPointers);

        let content_start = header.content_start.min(usable);
        if content_start > ptrs_end {
            let gap = SpanKind::Unallocated(RegionSource::TrailingGap);
            builder.claim(ptrs_end, content_start, gap);
        }

        match cell_offsets(page, &header) {
            Ok(offsets) => {
                for offset in offsets {
                    match parse_cell(page, header.kind, offset) {
                        Ok(cell) => {
                            builder.claim(offset, (offset + cell.len).min(usable), SpanKind::Cell)
                        }
                        Err(err) => fault(err),
                    }
                }
            }
            Err(err) => fault(err),
        }

        let mut next = header.first_freeblock as usize;
        let mut previous_end = 0;
        while next != 0 {
            let block = next;
            let chain_broken = || Error::corrupted(page_no, block, Corruption::FreeblockChain);
            if block < previous_end || block < ptrs_end || block + 4 > usable {
                fault(chain_broken());
                break;
            }
            let size = u16::from_be_bytes([bytes[block + 2], bytes[block + 3]]) as usize;
            if size < 4 || block + size > usable {
                fault(chain_broken());
                break;
            }
            builder.claim(block, block + size, SpanKind::Unallocated(RegionSource::Freeblock));
            previous_end = block + size;
            next = u16::from_be_bytes([bytes[block], bytes[block + 1]]) as usize;
        }

        let (spans, overlap) = builder.finish();
        if let Some(offset) = overlap {
            fault(Error::corrupted(page_no, offset, Corruption::OverlappingSpans));
        }

        Ok(Self { page: page.id(), header, usable_size: usable, spans, faults, overlap })
    }

    fn total(&self, wanted: impl Fn(SpanKind) -> bool) -> usize {
        self.spans.iter().filter(|span| wanted(span.kind)).map(|span| span.len).sum()
    }

    pub fn cell_bytes(&self) -> usize {
        self.total(|kind| kind == SpanKind::Cell)
    }

    pub fn unallocated_bytes(&self) -> usize {
        self.total(|kind| matches!(kind, SpanKind::Unallocated(_)))
    }

    /// Verify header + pointers + cells + gap + freeblocks + the header's
    /// fragmented byte count add up to the usable size with no overlaps.
    pub fn check(&self) -> Result<()> {
        let page = self.page.into_inner();
        if let Some(offset) = self.overlap {
            return Err(Error::corrupted(page, offset, Corruption::OverlappingSpans));
        }

        let accounted = self.total(|kind| {
            !matches!(
                kind,
                SpanKind::Unallocated(RegionSource::FragmentedByte | RegionSource::Unaccounted)
            )
        });
        let actual = accounted + self.header.fragmented_bytes as usize;
        if actual != self.usable_size {
            return Err(Error::corrupted(
                page,
                0,
                Corruption::PartitionMismatch { expected: self.usable_size, actual },
            ));
        }
        Ok(())
    }

    /// Every unallocated span as a carvable region.
    pub fn regions(&self) -> impl Iterator<Item = UnallocatedRegion> + '_ {
        self.spans.iter().filter_map(|span| match span.kind {
            SpanKind::Unallocated(source) => Some(UnallocatedRegion {
                page: self.page,
                offset: span.offset,
                len: span.len,
                source,
            }),
            _ => None,
        })
    }
}

/// Per-byte ownership map used to find holes and overlaps.
struct Coverage {
    owner: Vec<Option<SpanKind>>,
    spans: Vec<Span>,
    overlap: Option<usize>,
}

impl Coverage {
    fn new(len: usize) -> Self {
        Self { owner: vec![None; len], spans: Vec::new(), overlap: None }
    }

    fn claim(&mut self, start: usize, end: usize, kind: SpanKind) {
        if start >= end {
            return;
        }
        for (offset, owner) in self.owner[start..end].iter_mut().enumerate() {
            if owner.is_some() && self.overlap.is_none() {
                self.overlap = Some(start + offset);
            }
            owner.get_or_insert(kind);
        }
        self.spans.push(Span { offset: start, len: end - start, kind });
    }

    /// Unclaimed runs become fragments or unaccounted spans.
    fn finish(mut self) -> (Vec<Span>, Option<usize>) {
        let mut idx = 0;
        while idx < self.owner.len() {
            if self.owner[idx].is_some() {
                idx += 1;
                continue;
            }
            let start = idx;
            while idx < self.owner.len() && self.owner[idx].is_none() {
                idx += 1;
            }
            let source = if idx - start < 4 {
                RegionSource::FragmentedByte
            } else {
                RegionSource::Unaccounted
            };
            self.spans.push(Span {
                offset: start,
                len: idx - start,
                kind: SpanKind::Unallocated(source),
            });
        }
        self.spans.sort_by_key(|span| span.offset);
        (self.spans, self.overlap)
    }
}

/// Pages on the file-level freelist and the regions they contribute.
#[derive(Debug, Default)]
pub struct Freelist {
    pub trunks: Vec<PageId>,
    pub leaves: Vec<PageId>,
    pub regions: Vec<UnallocatedRegion>,
    pub faults: Vec<Error>,
}

impl Freelist {
    fn fault(&mut self, err: Error) {
        warn!("{err}");
        self.faults.push(err);
    }
}

/// Walk the freelist trunk chain from the header's first trunk page.
///
/// Each trunk is `[next trunk:4][leaf count:4][leaf page:4]...`. Leaves become
/// [`RegionSource::FreePage`] regions covering the whole usable page; the part
/// of each trunk past its leaf array becomes [`RegionSource::TrunkSlack`].
pub fn read_freelist(pager: &Pager) -> Freelist {
    let mut freelist = Freelist::default();
    let usable = pager.header().usable_size;
    let max_leaves = usable / 4 - 2;
    let mut seen = FxHashSet::default();
    let mut next = pager.header().first_freelist_trunk;

    while let Some(trunk) = PageId::try_new(next) {
        if !seen.insert(trunk) {
            freelist.fault(Error::corrupted(trunk.into_inner(), 0, Corruption::FreelistTrunk));
            break;
        }
        let bytes = match pager.page_bytes(trunk) {
            Ok(bytes) => bytes,
            Err(err) => {
                freelist.fault(err);
                break;
            }
        };
        freelist.trunks.push(trunk);

        let read_u32 = |at: usize| {
            u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        };
        next = read_u32(0);
        let mut count = read_u32(4) as usize;
        if count > max_leaves {
            freelist.fault(Error::corrupted(trunk.into_inner(), 4, Corruption::FreelistTrunk));
            count = max_leaves;
        }

        for idx in 0..count {
            let at = 8 + idx * 4;
            let leaf = read_u32(at);
            match PageId::try_new(leaf).filter(|leaf| pager.contains(leaf.into_inner())) {
                Some(leaf) if seen.insert(leaf) => {
                    freelist.leaves.push(leaf);
                    freelist.regions.push(UnallocatedRegion {
                        page: leaf,
                        offset: 0,
                        len: usable,
                        source: RegionSource::FreePage,
                    });
                }
                _ => freelist.fault(Error::corrupted(
                    trunk.into_inner(),
                    at,
                    Corruption::FreelistTrunk,
                )),
            }
        }

        let slack_start = 8 + count * 4;
        if slack_start < usable {
            freelist.regions.push(UnallocatedRegion {
                page: trunk,
                offset: slack_start,
                len: usable - slack_start,
                source: RegionSource::TrunkSlack,
            });
        }
    }

    let found = freelist.trunks.len() + freelist.leaves.len();
    let declared = pager.header().freelist_count as usize;
    if found != declared {
        warn!("header declares {declared} freelist pages, found {found}");
    }
    freelist
}
