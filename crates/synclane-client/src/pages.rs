//! Page keys, the page map and finder result normalization.
//!
//! # Design
//! - Pages live in a `BTreeMap`, so flattening in ascending key order is a
//!   pure walk over the map and tolerates out-of-order arrival.
//! - Numeric offsets order before server-supplied cursor keys.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies one page inside a [`PageMap`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PageKey {
    /// Numeric record offset.
    Offset(u64),
    /// Opaque key supplied by the server.
    Cursor(String),
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offset(offset) => write!(f, "{offset}"),
            Self::Cursor(cursor) => f.write_str(cursor),
        }
    }
}

/// Concatenate every page in ascending key order.
#[must_use]
pub fn flatten_pages<R: Clone>(pages: &BTreeMap<PageKey, Vec<R>>) -> Vec<R> {
    pages.values().flatten().cloned().collect()
}

/// Page key to ordered records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageMap<R> {
    pages: BTreeMap<PageKey, Vec<R>>,
}

impl<R> Default for PageMap<R> {
    fn default() -> Self {
        Self {
            pages: BTreeMap::new(),
        }
    }
}

impl<R> PageMap<R> {
    /// Empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `records` under `key`, replacing any previous page.
    pub fn insert(&mut self, key: PageKey, records: Vec<R>) {
        self.pages.insert(key, records);
    }

    /// Drop every page.
    pub fn clear(&mut self) {
        self.pages.clear();
    }

    /// Number of pages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Whether no page is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Records across every page.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.pages.values().map(Vec::len).sum()
    }

    /// Records stored under `key`.
    #[must_use]
    pub fn page(&self, key: &PageKey) -> Option<&[R]> {
        self.pages.get(key).map(Vec::as_slice)
    }

    /// Offset the page after the highest stored page starts at.
    ///
    /// Offset pages advance by their record count; cursor pages fall back to
    /// the total accumulated record count.
    #[must_use]
    pub fn next_offset(&self) -> u64 {
        match self.pages.iter().next_back() {
            Some((PageKey::Offset(offset), records)) => offset + len_u64(records.len()),
            Some((PageKey::Cursor(_), _)) => len_u64(self.record_count()),
            None => 0,
        }
    }

    /// Borrow the underlying map.
    #[must_use]
    pub const fn as_map(&self) -> &BTreeMap<PageKey, Vec<R>> {
        &self.pages
    }
}

impl<R: Clone> PageMap<R> {
    /// Every record in ascending key order.
    #[must_use]
    pub fn flatten(&self) -> Vec<R> {
        flatten_pages(&self.pages)
    }
}

fn len_u64(len: usize) -> u64 {
    u64::try_from(len).unwrap_or(u64::MAX)
}

/// Paginated finder response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageResponse<R> {
    /// Records of the loaded page.
    pub records: Vec<R>,
    /// Total records across every page, when the server knows it.
    #[serde(default)]
    pub records_total_count: Option<u64>,
    /// Explicit continuation signal.
    #[serde(default)]
    pub has_next_page: Option<bool>,
    /// Key the page should be stored under; defaults to the requested offset.
    #[serde(default)]
    pub loaded_page_key: Option<PageKey>,
}

impl<R> PageResponse<R> {
    /// Page with only records.
    #[must_use]
    pub const fn new(records: Vec<R>) -> Self {
        Self {
            records,
            records_total_count: None,
            has_next_page: None,
            loaded_page_key: None,
        }
    }

    /// Attach the total record count.
    #[must_use]
    pub const fn with_total(mut self, total: u64) -> Self {
        self.records_total_count = Some(total);
        self
    }

    /// Attach an explicit continuation signal.
    #[must_use]
    pub const fn with_next_page(mut self, has_next_page: bool) -> Self {
        self.has_next_page = Some(has_next_page);
        self
    }

    /// Store the page under `key`.
    #[must_use]
    pub fn with_key(mut self, key: PageKey) -> Self {
        self.loaded_page_key = Some(key);
        self
    }
}

/// Anything a finder may settle with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FinderOutput<R> {
    /// Complete, non-paginated result.
    Records(Vec<R>),
    /// One page of a possibly paginated result.
    Page(PageResponse<R>),
}

impl<R> From<Vec<R>> for FinderOutput<R> {
    fn from(records: Vec<R>) -> Self {
        Self::Records(records)
    }
}

impl<R> From<PageResponse<R>> for FinderOutput<R> {
    fn from(page: PageResponse<R>) -> Self {
        Self::Page(page)
    }
}

/// Finder output resolved against the requested offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct NormalizedPage<R> {
    pub(crate) key: PageKey,
    pub(crate) records: Vec<R>,
    pub(crate) total: Option<u64>,
    pub(crate) explicit_next: Option<bool>,
    pub(crate) paginated: bool,
}

impl<R> NormalizedPage<R> {
    pub(crate) fn from_output(output: FinderOutput<R>, requested_offset: u64) -> Self {
        match output {
            FinderOutput::Records(records) => Self {
                key: PageKey::Offset(requested_offset),
                records,
                total: None,
                explicit_next: Some(false),
                paginated: false,
            },
            FinderOutput::Page(page) => {
                let key = page
                    .loaded_page_key
                    .unwrap_or(PageKey::Offset(requested_offset));
                match page.records_total_count {
                    Some(total) => Self {
                        key,
                        records: page.records,
                        total: Some(total),
                        explicit_next: page.has_next_page,
                        paginated: true,
                    },
                    None => Self {
                        key,
                        records: page.records,
                        total: None,
                        explicit_next: Some(false),
                        paginated: false,
                    },
                }
            }
        }
    }
}

/// Continuation rule: an explicit server signal wins, otherwise more pages
/// exist while fewer records are held than the known total.
#[must_use]
pub fn infer_has_next_page(explicit: Option<bool>, held: usize, total: Option<u64>) -> bool {
    explicit.unwrap_or_else(|| total.is_some_and(|total| len_u64(held) < total))
}
