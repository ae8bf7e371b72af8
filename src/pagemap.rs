use std::fmt;

use log::warn;

use crate::btree::BTreeKind;
use crate::db::ObjectWalk;
use crate::freespace::Freelist;
use crate::pager::PageId;

/// What a page is used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PageType {
    InteriorTable,
    LeafTable,
    InteriorIndex,
    LeafIndex,
    Overflow,
    FreelistTrunk,
    FreelistLeaf,
    /// Reachable from no b-tree, overflow chain or freelist.
    Unreferenced,
}

impl From<BTreeKind> for PageType {
    fn from(kind: BTreeKind) -> Self {
        match kind {
            BTreeKind::TableInterior => Self::InteriorTable,
            BTreeKind::TableLeaf => Self::LeafTable,
            BTreeKind::IndexInterior => Self::InteriorIndex,
            BTreeKind::IndexLeaf => Self::LeafIndex,
        }
    }
}

impl fmt::Display for PageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::InteriorTable => "interior table",
            Self::LeafTable => "leaf table",
            Self::InteriorIndex => "interior index",
            Self::LeafIndex => "leaf index",
            Self::Overflow => "overflow",
            Self::FreelistTrunk => "freelist trunk",
            Self::FreelistLeaf => "freelist leaf",
            Self::Unreferenced => "unreferenced",
        })
    }
}

/// Page type for every page of the file, with the object owning it.
#[derive(Clone, Debug)]
pub struct PageMap {
    entries: Vec<(PageType, Option<String>)>,
}

impl PageMap {
    pub fn build(page_count: u32, walks: &[ObjectWalk], freelist: &Freelist) -> Self {
        let mut map = Self { entries: vec![(PageType::Unreferenced, None); page_count as usize] };

        for walk in walks {
            for &(page, kind) in &walk.summary.pages {
                map.assign(page, kind.into(), Some(&walk.object));
            }
            for &page in &walk.summary.overflow_pages {
                map.assign(page, PageType::Overflow, Some(&walk.object));
            }
        }
        for &page in &freelist.trunks {
            map.assign(page, PageType::FreelistTrunk, None);
        }
        for &page in &freelist.leaves {
            map.assign(page, PageType::FreelistLeaf, None);
        }
        map
    }

    fn assign(&mut self, page: PageId, page_type: PageType, owner: Option<&str>) {
        let Some(entry) = self.entries.get_mut(page.into_inner() as usize - 1) else {
            return;
        };
        if entry.0 != PageType::Unreferenced {
            warn!("page {page} is both {} and {page_type}", entry.0);
            return;
        }
        *entry = (page_type, owner.map(str::to_string));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, page: PageId) -> Option<PageType> {
        self.entries.get(page.into_inner() as usize - 1).map(|(page_type, _)| *page_type)
    }

    /// Object whose b-tree or overflow chain the page belongs to.
    pub fn owner(&self, page: PageId) -> Option<&str> {
        self.entries.get(page.into_inner() as usize - 1)?.1.as_deref()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PageId, PageType)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .map(|(idx, (page_type, _))| (PageId::new(idx as u32 + 1), *page_type))
    }

    pub fn count(&self, page_type: PageType) -> usize {
        self.entries.iter().filter(|(kind, _)| *kind == page_type).count()
    }
}
