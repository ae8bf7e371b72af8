//! Hand-built database images for unit tests.

use crate::header::{HEADER_SIZE, MAGIC};
use crate::pager::Pager;
use crate::record::tests::encode_varint;

pub(crate) const LEAF_TABLE: u8 = 0x0D;
pub(crate) const INTERIOR_TABLE: u8 = 0x05;
pub(crate) const LEAF_INDEX: u8 = 0x0A;
pub(crate) const INTERIOR_INDEX: u8 = 0x02;

pub(crate) struct ImageBuilder {
    page_size: usize,
    pages: Vec<Vec<u8>>,
    freelist: (u32, u32),
}

impl ImageBuilder {
    /// Page 1 starts as an empty schema leaf.
    pub(crate) fn new(page_size: usize) -> Self {
        let mut builder = Self { page_size, pages: vec![vec![0; page_size]], freelist: (0, 0) };
        builder.btree_page(1, LEAF_TABLE, &[], None);
        builder
    }

    /// Append a zeroed page and return its number.
    pub(crate) fn add_page(&mut self) -> u32 {
        self.pages.push(vec![0; self.page_size]);
        self.pages.len() as u32
    }

    pub(crate) fn page_mut(&mut self, page: u32) -> &mut [u8] {
        &mut self.pages[page as usize - 1]
    }

    pub(crate) fn set_freelist(&mut self, first_trunk: u32, count: u32) {
        self.freelist = (first_trunk, count);
    }

    /// Lay out `cells` from the end of the page downward and write the page
    /// header and pointer array. Returns each cell's offset.
    pub(crate) fn btree_page(
        &mut self,
        page: u32,
        kind: u8,
        cells: &[Vec<u8>],
        right_most: Option<u32>,
    ) -> Vec<usize> {
        let hdr = if page == 1 { HEADER_SIZE } else { 0 };
        let bytes = self.page_mut(page);
        let mut content_start = bytes.len();
        let mut offsets = Vec::with_capacity(cells.len());
        for cell in cells {
            content_start -= cell.len();
            bytes[content_start..content_start + cell.len()].copy_from_slice(cell);
            offsets.push(content_start);
        }

        bytes[hdr] = kind;
        bytes[hdr + 1..hdr + 3].copy_from_slice(&0u16.to_be_bytes());
        bytes[hdr + 3..hdr + 5].copy_from_slice(&(cells.len() as u16).to_be_bytes());
        bytes[hdr + 5..hdr + 7].copy_from_slice(&(content_start as u16).to_be_bytes());
        bytes[hdr + 7] = 0;
        let mut ptrs = hdr + 8;
        if let Some(right_most) = right_most {
            bytes[hdr + 8..hdr + 12].copy_from_slice(&right_most.to_be_bytes());
            ptrs += 4;
        }
        for (idx, offset) in offsets.iter().enumerate() {
            let at = ptrs + idx * 2;
            bytes[at..at + 2].copy_from_slice(&(*offset as u16).to_be_bytes());
        }
        offsets
    }

    pub(crate) fn build(mut self) -> Vec<u8> {
        let page_size = self.page_size;
        let page_count = self.pages.len() as u32;
        let (first_trunk, free_count) = self.freelist;
        let first = &mut self.pages[0];
        first[..16].copy_from_slice(MAGIC);
        let raw_size = if page_size == 65536 { 1u16 } else { page_size as u16 };
        first[16..18].copy_from_slice(&raw_size.to_be_bytes());
        first[18] = 1;
        first[19] = 1;
        first[21] = 64;
        first[22] = 32;
        first[23] = 32;
        first[24..28].copy_from_slice(&1u32.to_be_bytes());
        first[28..32].copy_from_slice(&page_count.to_be_bytes());
        first[32..36].copy_from_slice(&first_trunk.to_be_bytes());
        first[36..40].copy_from_slice(&free_count.to_be_bytes());
        first[44..48].copy_from_slice(&4u32.to_be_bytes());
        first[56..60].copy_from_slice(&1u32.to_be_bytes());
        first[92..96].copy_from_slice(&1u32.to_be_bytes());
        self.pages.concat()
    }

    pub(crate) fn pager(self) -> Pager {
        Pager::from_bytes(self.build()).expect("valid test image")
    }
}

pub(crate) fn table_leaf_cell(rowid: i64, payload: &[u8]) -> Vec<u8> {
    let mut cell = Vec::new();
    encode_varint(payload.len() as u64, &mut cell);
    encode_varint(rowid as u64, &mut cell);
    cell.extend_from_slice(payload);
    cell
}

pub(crate) fn table_interior_cell(child: u32, key: i64) -> Vec<u8> {
    let mut cell = child.to_be_bytes().to_vec();
    encode_varint(key as u64, &mut cell);
    cell
}

pub(crate) fn index_leaf_cell(payload: &[u8]) -> Vec<u8> {
    let mut cell = Vec::new();
    encode_varint(payload.len() as u64, &mut cell);
    cell.extend_from_slice(payload);
    cell
}

pub(crate) fn index_interior_cell(child: u32, payload: &[u8]) -> Vec<u8> {
    let mut cell = child.to_be_bytes().to_vec();
    cell.extend_from_slice(&index_leaf_cell(payload));
    cell
}

/// Record with one integer column and one text column.
pub(crate) fn int_text_record(value: i8, text: &str) -> Vec<u8> {
    crate::record::tests::encode_record(&[
        (1, &[value as u8]),
        (13 + 2 * text.len() as u64, text.as_bytes()),
    ])
}
