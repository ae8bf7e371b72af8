//! Recovery of deleted records from unallocated space.
//!
//! Two strategies run over each region:
//!
//! * a header scan tries every byte offset as the start of a record header
//!   and keeps whatever columns validate before the first inconsistency;
//! * a freeblock rebuild handles cells SQLite freed in place, whose first
//!   four bytes were overwritten by the freeblock's `[next:2][size:2]`
//!   header. The surviving serial types are matched against each table in
//!   the schema.
//!
//! Carving is confined to one page and never follows pointers found in
//! free space.

use std::fmt;

use log::{trace, warn};
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use smallvec::SmallVec;

use crate::btree::MIN_CELL_SIZE;
use crate::decoder::{read_varint, read_varint_at};
use crate::freespace::{RegionSource, UnallocatedRegion};
use crate::header::TextEncoding;
use crate::pager::Pager;
use crate::record::{
    Record, RecordFault, RecordFaultKind, RecordHeader, SerialType, Value, decode_value,
};
use crate::schema::{SchemaCatalog, SchemaObject};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CarveMethod {
    HeaderScan,
    FreeblockRebuild,
}

impl fmt::Display for CarveMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::HeaderScan => "header scan",
            Self::FreeblockRebuild => "freeblock rebuild",
        })
    }
}

/// Acceptance thresholds for carved candidates.
#[derive(Clone, Debug, PartialEq)]
pub struct CarveConfig {
    /// Fewest fully decoded columns a candidate needs.
    pub min_columns: usize,
    /// Lowest decoded / declared column ratio a candidate needs.
    pub min_confidence: f64,
    /// Require the declared column count to match some table.
    pub match_schema: bool,
    /// Try to rebuild cells whose header was overwritten by a freeblock.
    pub rebuild_freeblocks: bool,
    /// Resume scanning after a complete record instead of at the next byte.
    pub skip_consumed: bool,
}

impl Default for CarveConfig {
    fn default() -> Self {
        Self {
            min_columns: 2,
            min_confidence: 0.5,
            match_schema: true,
            rebuild_freeblocks: true,
            skip_consumed: true,
        }
    }
}

impl CarveConfig {
    pub fn min_columns(mut self, min_columns: usize) -> Self {
        self.min_columns = min_columns;
        self
    }

    pub fn min_confidence(mut self, min_confidence: f64) -> Self {
        self.min_confidence = min_confidence;
        self
    }

    pub fn match_schema(mut self, match_schema: bool) -> Self {
        self.match_schema = match_schema;
        self
    }

    pub fn rebuild_freeblocks(mut self, rebuild_freeblocks: bool) -> Self {
        self.rebuild_freeblocks = rebuild_freeblocks;
        self
    }

    pub fn skip_consumed(mut self, skip_consumed: bool) -> Self {
        self.skip_consumed = skip_consumed;
        self
    }
}

/// A record recovered from free space.
#[derive(Clone, Debug, PartialEq)]
pub struct CarvedRecord {
    pub region: UnallocatedRegion,
    /// Page offset where the record (or rebuilt cell) starts.
    pub offset: usize,
    pub record: Record,
    /// Columns whose values were fully decoded from intact bytes.
    pub decoded: Vec<usize>,
    pub declared_columns: usize,
    pub confidence: f64,
    pub rowid: Option<i64>,
    pub method: CarveMethod,
    /// Set when exactly one table has a matching column layout.
    pub table: Option<String>,
}

impl CarvedRecord {
    pub fn is_complete(&self) -> bool {
        self.decoded.len() == self.declared_columns
    }
}

/// A decode attempt before acceptance filtering.
struct Candidate {
    start: usize,
    end: usize,
    record: Record,
    decoded: Vec<usize>,
    declared: usize,
    rowid: Option<i64>,
    method: CarveMethod,
    table: Option<String>,
}

impl Candidate {
    fn confidence(&self) -> f64 {
        if self.declared == 0 { 0.0 } else { self.decoded.len() as f64 / self.declared as f64 }
    }

    fn is_complete(&self) -> bool {
        self.decoded.len() == self.declared
    }
}

pub struct Carver<'c> {
    config: CarveConfig,
    catalog: &'c SchemaCatalog,
    encoding: TextEncoding,
}

impl<'c> Carver<'c> {
    pub fn new(config: CarveConfig, catalog: &'c SchemaCatalog, encoding: TextEncoding) -> Self {
        Self { config, catalog, encoding }
    }

    pub fn config(&self) -> &CarveConfig {
        &self.config
    }

    /// Carve every region, keeping region order in the output.
    pub fn carve_all(&self, pager: &Pager, regions: &[UnallocatedRegion]) -> Vec<CarvedRecord> {
        #[cfg(feature = "parallel")]
        {
            regions.par_iter().flat_map_iter(|region| self.carve_region(pager, region)).collect()
        }
        #[cfg(not(feature = "parallel"))]
        {
            regions.iter().flat_map(|region| self.carve_region(pager, region)).collect()
        }
    }

    /// Carve one region. Results are ordered by offset.
    pub fn carve_region(&self, pager: &Pager, region: &UnallocatedRegion) -> Vec<CarvedRecord> {
        let page = match pager.page_bytes(region.page) {
            Ok(page) => page,
            Err(err) => {
                warn!("cannot carve {} region on page {}: {err}", region.source, region.page);
                return Vec::new();
            }
        };
        let usable = pager.header().usable_size.min(page.len());
        let start = region.offset.min(usable);
        let end = region.end().min(usable);

        let mut carved = Vec::new();
        let mut pos = start;

        if self.config.rebuild_freeblocks && region.source == RegionSource::Freeblock {
            if let Some(candidate) = self.rebuild_freeblock(&page[start..end], start) {
                trace!("rebuilt freeblock on page {} at {}", region.page, candidate.start);
                if self.config.skip_consumed {
                    pos = candidate.end;
                }
                carved.push(self.finish(region, candidate));
            }
        }

        while pos < end {
            let Some(candidate) = self.scan_at(page, pos, end) else {
                pos += 1;
                continue;
            };
            if !self.accept(&candidate) {
                pos += 1;
                continue;
            }
            trace!(
                "carved {} of {} columns on page {} at {}",
                candidate.decoded.len(),
                candidate.declared,
                region.page,
                candidate.start
            );
            let next = if self.config.skip_consumed && candidate.is_complete() {
                candidate.end
            } else {
                pos + 1
            };
            carved.push(self.finish(region, candidate));
            pos = next;
        }

        carved
    }

    fn finish(&self, region: &UnallocatedRegion, candidate: Candidate) -> CarvedRecord {
        let confidence = candidate.confidence();
        CarvedRecord {
            region: *region,
            offset: candidate.start,
            record: candidate.record,
            decoded: candidate.decoded,
            declared_columns: candidate.declared,
            confidence,
            rowid: candidate.rowid,
            method: candidate.method,
            table: candidate.table,
        }
    }

    fn accept(&self, candidate: &Candidate) -> bool {
        candidate.decoded.len() >= self.config.min_columns
            && candidate.confidence() >= self.config.min_confidence
            && !candidate.record.values.iter().all(Value::is_null)
    }

    /// Tables a record with these serial codes could belong to. A rowid alias
    /// column is always stored as NULL.
    fn matching_tables(&self, codes: &[u64]) -> SmallVec<[&'c SchemaObject; 2]> {
        self.catalog
            .tables_with_column_count(codes.len())
            .filter(|table| table.rowid_alias.is_none_or(|alias| codes[alias] == 0))
            .collect()
    }

    /// Try to read a record whose header-length varint sits at `start`,
    /// without reading at or past `end`.
    fn scan_at(&self, page: &[u8], start: usize, end: usize) -> Option<Candidate> {
        let header = RecordHeader::parse(&page[start..end])?;
        let codes = header.serial_codes.as_slice();
        if codes.is_empty() {
            return None;
        }
        let header_end = start + header.header_len;

        let tables = self.matching_tables(codes);
        if self.config.match_schema && tables.is_empty() {
            return None;
        }

        let mut record = Record::default();
        let mut decoded = Vec::new();
        let mut body = header_end;
        for (column, &code) in codes.iter().enumerate() {
            let Some(serial) = SerialType::from_code(code) else {
                record.fault = Some(RecordFault {
                    column,
                    offset: body - start,
                    kind: RecordFaultKind::InvalidSerialType(code),
                });
                break;
            };
            let len = serial.body_len();
            if len > end - body {
                record.fault = Some(RecordFault {
                    column,
                    offset: body - start,
                    kind: RecordFaultKind::BodyOverrun { needed: len, available: end - body },
                });
                break;
            }
            record.values.push(decode_value(serial, &page[body..body + len], self.encoding));
            decoded.push(column);
            body += len;
        }

        let rowid =
            if record.is_complete() { recover_rowid(page, start, body - start) } else { None };
        let table = match tables.as_slice() {
            [table] => Some(table.name.clone()),
            _ => None,
        };

        Some(Candidate {
            start,
            end: body,
            record,
            decoded,
            declared: codes.len(),
            rowid,
            method: CarveMethod::HeaderScan,
            table,
        })
    }

    /// Rebuild a freed cell from the serial types that survive after its
    /// overwritten first four bytes. `base` is the freeblock's page offset.
    fn rebuild_freeblock(&self, block: &[u8], base: usize) -> Option<Candidate> {
        if block.len() <= MIN_CELL_SIZE {
            return None;
        }

        let mut best: Option<Candidate> = None;
        for table in self.catalog.tables().filter(|table| !table.columns.is_empty()) {
            let columns = table.columns.len();
            let attempts = [columns - 1, columns];
            for intact in attempts.into_iter().filter(|&intact| intact > 0) {
                let Some(candidate) = self.rebuild_as(block, base, table, intact) else {
                    continue;
                };
                if !self.accept(&candidate) {
                    continue;
                }
                let better = best.as_ref().is_none_or(|best| {
                    (candidate.confidence(), candidate.decoded.len())
                        > (best.confidence(), best.decoded.len())
                });
                if better {
                    best = Some(candidate);
                }
            }
        }
        best
    }

    fn rebuild_as(
        &self,
        block: &[u8],
        base: usize,
        table: &SchemaObject,
        intact: usize,
    ) -> Option<Candidate> {
        let columns = table.columns.len();
        let lost_first = intact < columns;

        let mut pos = MIN_CELL_SIZE;
        let mut serials = SmallVec::<[SerialType; 16]>::new();
        let mut rest = 0usize;
        for _ in 0..intact {
            let serial = SerialType::from_code(read_varint_at(block, &mut pos)?)?;
            if serial.body_len() > block.len() {
                return None;
            }
            rest = rest.checked_add(serial.body_len())?;
            serials.push(serial);
        }
        let types_end = pos;

        let first_column = usize::from(lost_first);
        if let Some(alias) = table.rowid_alias {
            if alias >= first_column && serials[alias - first_column] != SerialType::Null {
                return None;
            }
        }

        let mut record = Record::default();
        let mut decoded = Vec::with_capacity(columns);
        let mut body = types_end;
        if lost_first {
            if table.rowid_alias == Some(0) {
                record.values.push(Value::Null);
                decoded.push(0);
            } else {
                let len = block.len().checked_sub(types_end.checked_add(rest)?)?;
                let bytes = &block[types_end..types_end + len];
                record.values.push(infer_value(bytes, &table.columns[0].decl_type, self.encoding)?);
                body += len;
            }
        }

        let end = body.checked_add(rest)?;
        if end > block.len() {
            return None;
        }
        if !lost_first && block.len() - end >= MIN_CELL_SIZE {
            return None;
        }

        for (idx, serial) in serials.iter().enumerate() {
            let len = serial.body_len();
            record.values.push(decode_value(*serial, &block[body..body + len], self.encoding));
            decoded.push(first_column + idx);
            body += len;
        }

        Some(Candidate {
            start: base,
            end: base + end,
            record,
            decoded,
            declared: columns,
            rowid: None,
            method: CarveMethod::FreeblockRebuild,
            table: Some(table.name.clone()),
        })
    }
}

/// Recover a rowid from a table-leaf cell header left intact just before a
/// record: a payload-length varint equal to the record length followed by
/// the rowid varint.
fn recover_rowid(page: &[u8], record_start: usize, record_len: usize) -> Option<i64> {
    for rowid_len in 1..=9 {
        for len_len in 1..=9 {
            let Some(cell_start) = record_start.checked_sub(rowid_len + len_len) else {
                continue;
            };
            let Some((payload_len, used)) = read_varint(&page[cell_start..record_start]) else {
                continue;
            };
            if used != len_len || payload_len != record_len as u64 {
                continue;
            }
            let rowid_bytes = &page[cell_start + len_len..record_start];
            if let Some((rowid, used)) = read_varint(rowid_bytes) {
                if used == rowid_len {
                    return Some(rowid as i64);
                }
            }
        }
    }
    None
}

/// Guess a value from its body bytes alone, using the column's declared
/// type the way SQLite assigns column affinity.
fn infer_value(bytes: &[u8], decl_type: &str, encoding: TextEncoding) -> Option<Value> {
    let int_serial = |len| match len {
        1 => Some(SerialType::Int8),
        2 => Some(SerialType::Int16),
        3 => Some(SerialType::Int24),
        4 => Some(SerialType::Int32),
        6 => Some(SerialType::Int48),
        8 => Some(SerialType::Int64),
        _ => None,
    };
    if bytes.is_empty() {
        return Some(Value::Null);
    }

    let decl = decl_type.to_ascii_uppercase();
    let text = || {
        let valid = encoding != TextEncoding::Utf8 || std::str::from_utf8(bytes).is_ok();
        valid.then(|| Value::Text(crate::record::Text::new(bytes.to_vec(), encoding)))
    };

    if decl.contains("INT") {
        return int_serial(bytes.len()).map(|serial| decode_value(serial, bytes, encoding));
    }
    if ["CHAR", "CLOB", "TEXT"].iter().any(|kw| decl.contains(kw)) {
        return text();
    }
    if decl.is_empty() || decl.contains("BLOB") {
        return Some(Value::Blob(bytes.to_vec()));
    }
    if ["REAL", "FLOA", "DOUB"].iter().any(|kw| decl.contains(kw)) && bytes.len() == 8 {
        return Some(decode_value(SerialType::Float, bytes, encoding));
    }
    int_serial(bytes.len()).map(|serial| decode_value(serial, bytes, encoding)).or_else(text)
}
