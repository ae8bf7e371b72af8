use std::path::Path;
use std::sync::OnceLock;

use log::debug;
#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::btree::{RowKey, TreeRecord, WalkSummary, collect_records};
use crate::carve::{CarveConfig, CarvedRecord, Carver};
use crate::error::{Error, Result};
use crate::freespace::{Freelist, PageLayout, UnallocatedRegion, read_freelist};
use crate::header::DbHeader;
use crate::pagemap::PageMap;
use crate::pager::{PageId, Pager};
use crate::record::Record;
use crate::schema::{SchemaCatalog, SchemaObject};
use crate::stats::Statistics;

/// What a [`Database`] analysis covers.
#[derive(Clone, Debug, PartialEq)]
pub struct AnalysisOptions {
    /// Walk objects and carve regions on the rayon pool. Has no effect
    /// without the `parallel` feature.
    pub parallel: bool,
    /// Treat freelist pages as unallocated regions.
    pub scan_freelist: bool,
    pub carve: CarveConfig,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self { parallel: true, scan_freelist: true, carve: CarveConfig::default() }
    }
}

impl AnalysisOptions {
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn scan_freelist(mut self, scan_freelist: bool) -> Self {
        self.scan_freelist = scan_freelist;
        self
    }

    pub fn carve(mut self, carve: CarveConfig) -> Self {
        self.carve = carve;
        self
    }
}

/// The decoded contents of one object's b-tree.
#[derive(Debug)]
pub struct ObjectWalk {
    pub object: String,
    pub root: PageId,
    pub records: Vec<TreeRecord>,
    pub summary: WalkSummary,
}

/// A live row or index entry, tagged with the object it belongs to.
#[derive(Clone, Copy, Debug)]
pub struct ActiveRecord<'a> {
    pub object: &'a str,
    pub page: PageId,
    pub offset: usize,
    pub key: RowKey,
    pub record: &'a Record,
    pub overflow_truncated: bool,
}

/// Read-only forensic view of a SQLite database file.
///
/// Every output is computed on first request and cached; later requests and
/// outputs built on top of it share the same traversal.
///
/// ```no_run
/// use sqlcarve::Database;
///
/// let db = Database::open("evidence.db").unwrap();
/// for row in db.active_records() {
///     println!("{} {:?} {:?}", row.object, row.key, row.record.values);
/// }
/// for carved in db.carved() {
///     let at = (carved.region.page, carved.offset);
///     println!("page {} offset {}: {:?}", at.0, at.1, carved.record.values);
/// }
/// ```
pub struct Database {
    pager: Pager,
    options: AnalysisOptions,
    catalog: OnceLock<SchemaCatalog>,
    walks: OnceLock<Vec<ObjectWalk>>,
    layouts: OnceLock<Vec<PageLayout>>,
    freelist: OnceLock<Freelist>,
    regions: OnceLock<Vec<UnallocatedRegion>>,
    carved: OnceLock<Vec<CarvedRecord>>,
    statistics: OnceLock<Statistics>,
    page_map: OnceLock<PageMap>,
}

impl Database {
    /// Open and memory-map a database file. Fails only when the file cannot
    /// be read or its header is unusable.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(Pager::open(path)?))
    }

    /// Analyse an in-memory file image.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        Ok(Self::new(Pager::from_bytes(bytes)?))
    }

    fn new(pager: Pager) -> Self {
        Self {
            pager,
            options: AnalysisOptions::default(),
            catalog: OnceLock::new(),
            walks: OnceLock::new(),
            layouts: OnceLock::new(),
            freelist: OnceLock::new(),
            regions: OnceLock::new(),
            carved: OnceLock::new(),
            statistics: OnceLock::new(),
            page_map: OnceLock::new(),
        }
    }

    /// Replace the analysis options. Outputs already computed are discarded.
    pub fn with_options(self, options: AnalysisOptions) -> Self {
        Self { options, ..Self::new(self.pager) }
    }

    pub fn options(&self) -> &AnalysisOptions {
        &self.options
    }

    pub fn pager(&self) -> &Pager {
        &self.pager
    }

    pub fn header(&self) -> &DbHeader {
        self.pager.header()
    }

    pub fn catalog(&self) -> &SchemaCatalog {
        self.catalog.get_or_init(|| SchemaCatalog::load(&self.pager))
    }

    /// One walk per object with a b-tree, in catalog order.
    pub fn walks(&self) -> &[ObjectWalk] {
        self.walks.get_or_init(|| {
            let rooted = self.catalog().rooted().collect::<Vec<_>>();
            let walk = |&(object, root): &(&SchemaObject, PageId)| self.walk_object(object, root);

            #[cfg(feature = "parallel")]
            if self.options.parallel {
                return rooted.par_iter().map(walk).collect();
            }
            rooted.iter().map(walk).collect()
        })
    }

    fn walk_object(&self, object: &SchemaObject, root: PageId) -> ObjectWalk {
        let (records, summary) = collect_records(&self.pager, root, self.header().encoding);
        debug!(
            "{} {}: {} records on {} pages, {} faults",
            object.kind,
            object.name,
            records.len(),
            summary.pages.len(),
            summary.faults.len()
        );
        ObjectWalk { object: object.name.clone(), root, records, summary }
    }

    pub fn walk(&self, name: &str) -> Option<&ObjectWalk> {
        let object = self.catalog().get(name)?;
        self.walks().iter().find(|walk| walk.object == object.name)
    }

    /// Live records of every stored table and index, in catalog then key order.
    pub fn active_records(&self) -> impl Iterator<Item = ActiveRecord<'_>> {
        self.walks()
            .iter()
            .filter(|walk| walk.root != PageId::ROOT)
            .flat_map(|walk| {
                walk.records.iter().map(move |entry| ActiveRecord {
                    object: walk.object.as_str(),
                    page: entry.page,
                    offset: entry.offset,
                    key: entry.key,
                    record: &entry.record,
                    overflow_truncated: entry.overflow_truncated,
                })
            })
    }

    /// Byte partition of every b-tree page reached by a walk, by page number.
    pub fn layouts(&self) -> &[PageLayout] {
        self.layouts.get_or_init(|| {
            let mut pages = self
                .walks()
                .iter()
                .flat_map(|walk| walk.summary.pages.iter().map(|&(page, _)| page))
                .collect::<Vec<_>>();
            pages.sort_unstable();
            pages.dedup();

            pages
                .into_iter()
                .filter_map(|page| {
                    let page = self.pager.page(page).ok()?;
                    PageLayout::analyze(&page).ok()
                })
                .collect()
        })
    }

    pub fn freelist(&self) -> &Freelist {
        self.freelist.get_or_init(|| {
            if self.options.scan_freelist {
                read_freelist(&self.pager)
            } else {
                Freelist::default()
            }
        })
    }

    /// Every unallocated region, ordered by page and offset.
    pub fn regions(&self) -> &[UnallocatedRegion] {
        self.regions.get_or_init(|| {
            let mut regions = self
                .layouts()
                .iter()
                .flat_map(PageLayout::regions)
                .chain(self.freelist().regions.iter().copied())
                .collect::<Vec<_>>();
            regions.sort_by_key(|region| (region.page, region.offset));
            regions
        })
    }

    /// Records carved from the unallocated regions, in region order.
    pub fn carved(&self) -> &[CarvedRecord] {
        self.carved.get_or_init(|| {
            let carver =
                Carver::new(self.options.carve.clone(), self.catalog(), self.header().encoding);
            if self.options.parallel {
                carver.carve_all(&self.pager, self.regions())
            } else {
                self.regions()
                    .iter()
                    .flat_map(|region| carver.carve_region(&self.pager, region))
                    .collect()
            }
        })
    }

    pub fn statistics(&self) -> &Statistics {
        self.statistics.get_or_init(|| {
            Statistics::collect(
                &self.pager,
                self.catalog(),
                self.walks(),
                self.freelist(),
                self.regions(),
                self.carved(),
            )
        })
    }

    pub fn page_map(&self) -> &PageMap {
        self.page_map
            .get_or_init(|| PageMap::build(self.pager.page_count(), self.walks(), self.freelist()))
    }

    /// Every fault recorded so far across the schema, walks, page layouts and
    /// freelist.
    pub fn faults(&self) -> impl Iterator<Item = &Error> {
        self.catalog()
            .faults()
            .iter()
            .chain(
                self.walks()
                    .iter()
                    .filter(|walk| walk.root != PageId::ROOT)
                    .flat_map(|walk| walk.summary.faults.iter()),
            )
            .chain(self.layouts().iter().flat_map(|layout| layout.faults.iter()))
            .chain(self.freelist().faults.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;

    fn image() -> Vec<u8> {
        let mut image = ImageBuilder::new(512);
        let root = image.add_page();
        let sql = "CREATE TABLE t (n INTEGER, s TEXT)";
        let schema_row = crate::record::tests::encode_record(&[
            (13 + 2 * 5, b"table"),
            (13 + 2, b"t"),
            (13 + 2, b"t"),
            (1, &[root as u8]),
            (13 + 2 * sql.len() as u64, sql.as_bytes()),
        ]);
        image.btree_page(1, LEAF_TABLE, &[table_leaf_cell(1, &schema_row)], None);
        image.btree_page(
            root,
            LEAF_TABLE,
            &[
                table_leaf_cell(1, &int_text_record(10, "ten")),
                table_leaf_cell(2, &int_text_record(20, "twenty")),
            ],
            None,
        );
        image.build()
    }

    #[test]
    fn caches_catalog_walks_and_records() {
        let db = Database::from_bytes(image()).expect("open image");
        assert!(std::ptr::eq(db.catalog(), db.catalog()));
        assert_eq!(db.catalog().counts().tables, 1);
        assert_eq!(db.walks().len(), 2);

        let rows: Vec<_> = db
            .active_records()
            .map(|row| (row.object, row.key, row.record.values[1].to_string()))
            .collect();
        assert_eq!(
            rows,
            vec![
                ("t", RowKey::Rowid(1), "ten".to_string()),
                ("t", RowKey::Rowid(2), "twenty".to_string()),
            ]
        );
        assert_eq!(db.walk("T").map(|walk| walk.records.len()), Some(2));
        assert_eq!(db.faults().count(), 0);
    }

    #[test]
    fn sequential_and_parallel_runs_agree() {
        let parallel = Database::from_bytes(image()).unwrap();
        let sequential = Database::from_bytes(image())
            .unwrap()
            .with_options(AnalysisOptions::default().parallel(false));
        assert_eq!(parallel.regions(), sequential.regions());
        assert_eq!(parallel.carved(), sequential.carved());
        assert_eq!(parallel.statistics(), sequential.statistics());
        assert!(parallel.layouts().iter().all(|layout| layout.check().is_ok()));
    }
}
