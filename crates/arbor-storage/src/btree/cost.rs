//! Cost estimates for choosing between access paths.
//!
//! Page and row counts are snapshotted when the controller opens and are
//! estimates: the container counts control rows and delete-marked rows
//! alike. A scan range is measured by searching for its bounds with the
//! search tracking what fraction of the key space lies to the left.

use tracing::trace;

use arbor_common::{ArborError, Result, Value};

use super::constants::{
    CACHED_ROW_FETCH_COST, EMPTY_INDEX_ROW_SIZE, HASHSCAN_ROW_FETCH_COST, ROW_PER_BYTE_COST,
    SORTMERGE_FETCH_BY_KEY_PER_LEVEL, UNCACHED_FETCH_BY_KEY_PER_LEVEL, UNCACHED_PAGE_FETCH_COST,
};
use super::open::OpenBTree;
use super::scan::SearchOp;
use super::search::{PartialKeyOrder, SearchParameters};

/// How the rows of a costed scan are consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanKind {
    /// Row at a time or in groups.
    #[default]
    Normal,
    /// Into a hash table.
    Hash,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanCost {
    pub estimated_cost: f64,
    pub estimated_row_count: u64,
}

pub struct BTreeCostController {
    open: OpenBTree,
    num_pages: u64,
    num_rows: u64,
    page_size: u64,
    tree_height: u32,
}

impl BTreeCostController {
    pub(crate) fn new(open: OpenBTree) -> Result<Self> {
        let container = open.container();
        let num_pages = container.estimated_page_count();
        // One control row per page
        let num_rows = container.estimated_row_count().saturating_sub(num_pages);
        let page_size = container.page_size() as u64;
        let tree_height = open.root()?.level() + 1;
        Ok(Self {
            open,
            num_pages,
            num_rows,
            page_size,
            tree_height,
        })
    }

    pub fn height(&self) -> u32 {
        self.tree_height
    }

    /// Estimated number of index rows. Branch rows and delete-marked rows
    /// are counted along with live leaf rows.
    pub fn row_count(&self) -> u64 {
        self.num_rows
    }

    /// Cost of fetching one row by its full key. `clustered` assumes the
    /// probes arrive in key order, so upper levels stay cached.
    pub fn fetch_from_full_key_cost(&self, clustered: bool) -> f64 {
        let per_level = if clustered {
            SORTMERGE_FETCH_BY_KEY_PER_LEVEL
        } else {
            UNCACHED_FETCH_BY_KEY_PER_LEVEL
        };
        per_level * f64::from(self.tree_height)
    }

    /// Index rows have no row location of their own.
    pub fn fetch_from_row_location_cost(&self) -> Result<f64> {
        Err(ArborError::UnimplementedFeature("fetch cost by row location"))
    }

    /// Estimates a scan between the given bounds, with the same meaning as
    /// the bounds of a [`ScanParams`](super::ScanParams). `row_count`
    /// overrides the estimated number of rows in the index.
    pub fn scan_cost(
        &self,
        kind: ScanKind,
        row_count: Option<u64>,
        start: Option<(&[Value], SearchOp)>,
        stop: Option<(&[Value], SearchOp)>,
        clustered: bool,
    ) -> Result<ScanCost> {
        let input_rows = row_count.unwrap_or(self.num_rows);
        let left_of_start = match start {
            None => 0.0,
            Some((key, op)) => self.left_fraction(key, op)?,
        };
        let left_of_stop = match stop {
            None => 1.0,
            Some((key, op)) => self.left_fraction(key, op)?,
        };
        let fraction = (left_of_stop - left_of_start).clamp(0.0, 1.0);
        let estimated_rows = input_rows as f64 * fraction;

        // Descend once, then read the leaves of the range
        let mut cost = self.fetch_from_full_key_cost(clustered);
        cost += self.num_pages as f64 * fraction * UNCACHED_PAGE_FETCH_COST;

        // Rows past the first of each page are already in hand
        let cached_rows = (estimated_rows as u64).saturating_sub(self.num_pages);
        cost += cached_rows as f64
            * match kind {
                ScanKind::Normal => CACHED_ROW_FETCH_COST,
                ScanKind::Hash => HASHSCAN_ROW_FETCH_COST,
            };

        let row_size = if input_rows == 0 {
            EMPTY_INDEX_ROW_SIZE
        } else {
            ((self.num_pages * self.page_size) / input_rows) as f64
        };
        cost += estimated_rows * row_size * ROW_PER_BYTE_COST;

        trace!(
            container = self.open.container().id(),
            fraction,
            cost,
            rows = estimated_rows,
            "scan costed"
        );
        Ok(ScanCost {
            estimated_cost: cost,
            estimated_row_count: estimated_rows.round() as u64,
        })
    }

    fn left_fraction(&self, key: &[Value], op: SearchOp) -> Result<f64> {
        let order = match op {
            SearchOp::Ge => PartialKeyOrder::Left,
            SearchOp::Gt => PartialKeyOrder::Right,
        };
        let mut sp = SearchParameters::new(key, order, true);
        drop(self.open.root()?.search(&self.open, &mut sp)?);
        Ok(sp.left_fraction)
    }
}

impl std::fmt::Debug for BTreeCostController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BTreeCostController")
            .field("index", &self.open.conglomerate().name())
            .field("num_pages", &self.num_pages)
            .field("num_rows", &self.num_rows)
            .field("tree_height", &self.tree_height)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::conglomerate::CreateIndex;
    use crate::btree::locking::LockingPolicy;
    use crate::btree::test_support::{int_row, TestIndex};
    use arbor_common::{IndexConfig, TypeId};

    fn filled(n: i64) -> TestIndex {
        let index = TestIndex::new(CreateIndex::new("c", 1, &[TypeId::Int64]));
        let config = IndexConfig {
            max_rows_per_page: Some(8),
            check_consistency: false,
        };
        let mut cc = index
            .btree
            .open_controller(&index.txn, LockingPolicy::Table, &config)
            .unwrap();
        for k in 1..=n {
            cc.insert(&int_row(k)).unwrap();
        }
        index
    }

    fn key(k: i64) -> Vec<Value> {
        vec![Value::Int64(k)]
    }

    #[test]
    fn test_empty_index() {
        let index = filled(0);
        let cost = index.btree.open_cost_controller(&index.txn).unwrap();
        assert_eq!(cost.height(), 1);
        assert_eq!(cost.row_count(), 0);
        assert_eq!(cost.fetch_from_full_key_cost(false), UNCACHED_FETCH_BY_KEY_PER_LEVEL);

        let scan = cost.scan_cost(ScanKind::Normal, None, None, None, false).unwrap();
        assert_eq!(scan.estimated_row_count, 0);
        assert!(scan.estimated_cost >= cost.fetch_from_full_key_cost(false));
    }

    #[test]
    fn test_fetch_cost_scales_with_height() {
        let index = filled(200);
        let cost = index.btree.open_cost_controller(&index.txn).unwrap();
        let height = index.btree.height(&index.txn).unwrap();
        assert!(height > 1);
        assert_eq!(cost.height(), height);
        assert!(cost.fetch_from_full_key_cost(true) < cost.fetch_from_full_key_cost(false));
        assert!(
            (cost.fetch_from_full_key_cost(false) - UNCACHED_FETCH_BY_KEY_PER_LEVEL * f64::from(height)).abs()
                < 1e-9
        );
        assert!(matches!(
            cost.fetch_from_row_location_cost(),
            Err(ArborError::UnimplementedFeature(_))
        ));
    }

    #[test]
    fn test_range_estimates() {
        let index = filled(200);
        let cost = index.btree.open_cost_controller(&index.txn).unwrap();
        let levels = index.btree.level_row_counts(&index.txn).unwrap();
        assert_eq!(levels[0], 200);
        // Separator rows on branch pages count too
        let all_rows: usize = levels.iter().sum();
        assert!(all_rows > 200);
        assert_eq!(cost.row_count(), all_rows as u64);

        let full = cost.scan_cost(ScanKind::Normal, None, None, None, false).unwrap();
        assert_eq!(full.estimated_row_count, cost.row_count());

        let upper = key(101);
        let half = cost
            .scan_cost(ScanKind::Normal, None, Some((&upper, SearchOp::Ge)), None, false)
            .unwrap();
        assert!((50..=150).contains(&half.estimated_row_count), "{:?}", half);
        assert!(half.estimated_cost < full.estimated_cost);

        // Stop before start
        let low = key(10);
        let empty = cost
            .scan_cost(
                ScanKind::Normal,
                None,
                Some((&upper, SearchOp::Ge)),
                Some((&low, SearchOp::Ge)),
                false,
            )
            .unwrap();
        assert_eq!(empty.estimated_row_count, 0);

        let hashed = cost.scan_cost(ScanKind::Hash, None, None, None, false).unwrap();
        assert!(hashed.estimated_cost > full.estimated_cost);

        let fewer = cost
            .scan_cost(ScanKind::Normal, Some(20), None, None, false)
            .unwrap();
        assert_eq!(fewer.estimated_row_count, 20);
    }
}
