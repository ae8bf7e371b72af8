use rustc_hash::FxHashSet;

use crate::carve::CarvedRecord;
use crate::db::ObjectWalk;
use crate::freespace::{Freelist, UnallocatedRegion};
use crate::pager::{PageId, Pager};
use crate::schema::{ObjectCounts, ObjectKind, SchemaCatalog};

/// Per-object totals from one b-tree walk.
#[derive(Clone, Debug, PartialEq)]
pub struct ObjectStats {
    pub name: String,
    pub kind: ObjectKind,
    pub root_page: Option<PageId>,
    pub rows: usize,
    pub pages: usize,
    pub leaf_pages: usize,
    pub interior_pages: usize,
    pub overflow_pages: usize,
    pub faults: usize,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct GlobalStats {
    pub objects: ObjectCounts,
    pub active_rows: usize,
    pub btree_pages: usize,
    pub overflow_pages: usize,
    pub freelist_pages: usize,
    pub total_pages: u32,
    pub file_bytes: usize,
    pub unallocated_bytes: usize,
    pub carved_records: usize,
    pub faults: usize,
    /// Unallocated bytes as a share of the file.
    pub slack_ratio: f64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Statistics {
    pub objects: Vec<ObjectStats>,
    pub global: GlobalStats,
}

impl Statistics {
    pub fn collect(
        pager: &Pager,
        catalog: &SchemaCatalog,
        walks: &[ObjectWalk],
        freelist: &Freelist,
        regions: &[UnallocatedRegion],
        carved: &[CarvedRecord],
    ) -> Self {
        let mut objects = Vec::with_capacity(catalog.objects().len());
        let mut btree_pages = FxHashSet::default();
        let mut overflow_pages = FxHashSet::default();
        let mut faults = catalog.faults().len() + freelist.faults.len();

        for object in catalog.objects() {
            let walk = walks.iter().find(|walk| walk.object == object.name);
            let mut stats = ObjectStats {
                name: object.name.clone(),
                kind: object.kind,
                root_page: object.root_page,
                rows: 0,
                pages: 0,
                leaf_pages: 0,
                interior_pages: 0,
                overflow_pages: 0,
                faults: 0,
            };

            if let Some(walk) = walk {
                let summary = &walk.summary;
                stats.rows = walk.records.len();
                stats.pages = summary.pages.len();
                stats.leaf_pages = summary.pages.iter().filter(|(_, kind)| kind.is_leaf()).count();
                stats.interior_pages = stats.pages - stats.leaf_pages;
                stats.overflow_pages = summary.overflow_pages.len();
                stats.faults = summary.faults.len();

                btree_pages.extend(summary.pages.iter().map(|&(page, _)| page));
                overflow_pages.extend(summary.overflow_pages.iter().copied());
                if !object.is_builtin() {
                    faults += stats.faults;
                }
            }
            objects.push(stats);
        }

        let file_bytes = pager.page_count() as usize * pager.header().page_size;
        let unallocated_bytes = regions.iter().map(|region| region.len).sum::<usize>();
        let slack_ratio =
            if file_bytes == 0 { 0.0 } else { unallocated_bytes as f64 / file_bytes as f64 };

        let global = GlobalStats {
            objects: catalog.counts(),
            active_rows: objects
                .iter()
                .filter(|stats| {
                    stats.kind == ObjectKind::Table && stats.root_page != Some(PageId::ROOT)
                })
                .map(|stats| stats.rows)
                .sum(),
            btree_pages: btree_pages.len(),
            overflow_pages: overflow_pages.len(),
            freelist_pages: freelist.trunks.len() + freelist.leaves.len(),
            total_pages: pager.page_count(),
            file_bytes,
            unallocated_bytes,
            carved_records: carved.len(),
            faults,
            slack_ratio,
        };

        Self { objects, global }
    }

    pub fn object(&self, name: &str) -> Option<&ObjectStats> {
        self.objects.iter().find(|stats| stats.name.eq_ignore_ascii_case(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::{BTreeKind, RowKey, TreeRecord, WalkSummary};
    use crate::freespace::RegionSource;
    use crate::record::Record;
    use crate::schema::SchemaObject;
    use crate::testutil::ImageBuilder;

    fn walk(object: &str, pages: &[(u32, BTreeKind)], rows: usize) -> ObjectWalk {
        let summary = WalkSummary {
            pages: pages.iter().map(|&(page, kind)| (PageId::new(page), kind)).collect(),
            cells: rows,
            ..WalkSummary::default()
        };
        let records = (0..rows)
            .map(|idx| TreeRecord {
                page: PageId::new(pages[pages.len() - 1].0),
                offset: 0,
                key: RowKey::Rowid(idx as i64 + 1),
                record: Record::default(),
                overflow_truncated: false,
            })
            .collect();
        ObjectWalk { object: object.to_string(), root: PageId::new(pages[0].0), records, summary }
    }

    #[test]
    fn aggregates_rows_pages_and_slack() {
        let mut image = ImageBuilder::new(512);
        for _ in 0..3 {
            image.add_page();
        }
        let pager = image.pager();
        let catalog = SchemaCatalog::from_objects([SchemaObject::new(
            ObjectKind::Table,
            "t",
            "t",
            PageId::try_new(2),
            Some("CREATE TABLE t (a, b)".into()),
        )]);
        let walks = [
            walk("sqlite_schema", &[(1, BTreeKind::TableLeaf)], 1),
            walk(
                "t",
                &[
                    (2, BTreeKind::TableInterior),
                    (3, BTreeKind::TableLeaf),
                    (4, BTreeKind::TableLeaf),
                ],
                5,
            ),
        ];
        let regions = [UnallocatedRegion {
            page: PageId::new(3),
            offset: 100,
            len: 256,
            source: RegionSource::TrailingGap,
        }];

        let freelist = Freelist::default();
        let stats = Statistics::collect(&pager, &catalog, &walks, &freelist, &regions, &[]);
        let t = stats.object("T").expect("table stats");
        assert_eq!((t.rows, t.pages, t.leaf_pages, t.interior_pages), (5, 3, 2, 1));
        assert_eq!(stats.global.active_rows, 5);
        assert_eq!(stats.global.btree_pages, 4);
        assert_eq!(stats.global.total_pages, 4);
        assert_eq!(stats.global.objects.tables, 1);
        assert_eq!(stats.global.unallocated_bytes, 256);
        assert!((stats.global.slack_ratio - 0.125).abs() < 1e-9);
    }
}
