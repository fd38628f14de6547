//! B-tree page format and cost constants.

// Control row columns (slot 0 of every page)

pub(crate) const COLUMN_FORMAT: usize = 0;
pub(crate) const COLUMN_LEFT_SIBLING: usize = 1;
pub(crate) const COLUMN_RIGHT_SIBLING: usize = 2;
pub(crate) const COLUMN_PARENT: usize = 3;
pub(crate) const COLUMN_LEVEL: usize = 4;
pub(crate) const COLUMN_IS_ROOT: usize = 5;
/// Serialized index descriptor on the root page, NULL elsewhere.
pub(crate) const COLUMN_DESCRIPTOR: usize = 6;
/// Left child page of a branch, NULL on a leaf.
pub(crate) const COLUMN_LEFT_CHILD: usize = 7;
pub(crate) const CONTROL_ROW_COLUMNS: usize = 8;

/// Format tag stored in a leaf control row.
pub(crate) const LEAF_FORMAT: i32 = 1;
/// Format tag stored in a branch control row.
pub(crate) const BRANCH_FORMAT: i32 = 2;

/// Slot of the control row.
pub(crate) const CONTROL_SLOT: usize = 0;
/// First slot holding an index or branch row.
pub(crate) const FIRST_ROW_SLOT: usize = 1;

/// Version byte leading the serialized descriptor.
pub(crate) const DESCRIPTOR_VERSION: u8 = 1;

// Split hints passed from the insert that triggered a split

/// The incoming row goes to the first slot of the page.
pub(crate) const SPLIT_FLAG_FIRST_ON_PAGE: u32 = 0x01;
/// The incoming row goes after the last slot of the page.
pub(crate) const SPLIT_FLAG_LAST_ON_PAGE: u32 = 0x02;
/// The page is the leftmost leaf.
pub(crate) const SPLIT_FLAG_FIRST_IN_TABLE: u32 = 0x04;
/// The page is the rightmost leaf.
pub(crate) const SPLIT_FLAG_LAST_IN_TABLE: u32 = 0x08;

// Cost model

/// Fetch by key, per tree level, when the index and base rows are read in
/// key order.
pub(crate) const SORTMERGE_FETCH_BY_KEY_PER_LEVEL: f64 = 1.432 / 2.0;
/// Fetch by key, per tree level, with no locality assumed.
pub(crate) const UNCACHED_FETCH_BY_KEY_PER_LEVEL: f64 = 3.143 / 2.0;
/// Reading one leaf page that is not cached.
pub(crate) const UNCACHED_PAGE_FETCH_COST: f64 = 1.5;
/// Reading one more row from a page already in hand.
pub(crate) const CACHED_ROW_FETCH_COST: f64 = 0.12;
/// Reading one more row into a hash table.
pub(crate) const HASHSCAN_ROW_FETCH_COST: f64 = 0.14;
/// Per byte of every row returned.
pub(crate) const ROW_PER_BYTE_COST: f64 = 0.004;
/// Row size assumed for an empty index.
pub(crate) const EMPTY_INDEX_ROW_SIZE: f64 = 4.0;
