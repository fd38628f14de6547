//! Index descriptor.
//!
//! A `BTree` describes one index: the container holding its pages, the
//! base table its row locations point into, and the type and sort order of
//! every column. It never changes after creation. The root page carries a
//! serialized copy in its control row so an index can be reopened from its
//! container alone:
//!
//! ```text
//! +---------------------+
//! | version: u8         |
//! | name_len: u16       |
//! | name: [u8]          |
//! | container_id: u32   |
//! | base_container: u32 |
//! | n_key_fields: u16   |
//! | n_unique: u16       |
//! | flags: u8           |  bit 0 = allow duplicates, bit 1 = parent links
//! +---------------------+
//! | type_id: u8         |  repeated n_key_fields times
//! | ascending: u8       |
//! +---------------------+
//! ```

use bytes::{Buf, BufMut, BytesMut};
use std::sync::Arc;
use tracing::info;

use arbor_buffer::{Container, DiskManager};
use arbor_common::{
    ArborError, ContainerConfig, IndexConfig, Result, Row, TypeId, Value, FIRST_PAGE_NUM,
};
use arbor_txn::{Transaction, TransactionManager};

use super::constants::{COLUMN_DESCRIPTOR, CONTROL_SLOT, DESCRIPTOR_VERSION};
use super::control_row::{ControlInfo, ControlRow};
use super::controller::BTreeController;
use super::cost::BTreeCostController;
use super::locking::LockingPolicy;
use super::max_scan;
use super::open::OpenBTree;
use super::scan::{BTreeScan, ScanParams};

const FLAG_ALLOW_DUPLICATES: u8 = 0x01;
const FLAG_MAINTAIN_PARENT_LINKS: u8 = 0x02;

/// Type and sort direction of one index column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexColumn {
    pub type_id: TypeId,
    pub ascending: bool,
}

impl IndexColumn {
    /// An ascending column.
    pub fn asc(type_id: TypeId) -> Self {
        Self {
            type_id,
            ascending: true,
        }
    }

    /// A descending column.
    pub fn desc(type_id: TypeId) -> Self {
        Self {
            type_id,
            ascending: false,
        }
    }
}

/// Parameters of `BTree::create`.
#[derive(Debug, Clone)]
pub struct CreateIndex {
    /// Index name, kept for diagnostics.
    pub name: String,
    /// Container of the base table the row locations point into.
    pub base_container_id: u32,
    /// Index columns in key order. The last column must be the row location.
    pub columns: Vec<IndexColumn>,
    /// Enforce uniqueness on every column but the row location.
    pub unique: bool,
    /// Relax a unique index to compare on every column, row location
    /// included.
    pub allow_duplicates: bool,
    /// Keep each page's parent pointer current across splits.
    pub maintain_parent_links: bool,
}

impl CreateIndex {
    /// A non-unique index over `key_types` followed by a row location.
    pub fn new(name: &str, base_container_id: u32, key_types: &[TypeId]) -> Self {
        let mut columns: Vec<IndexColumn> = key_types.iter().copied().map(IndexColumn::asc).collect();
        columns.push(IndexColumn::asc(TypeId::RowLocation));
        Self {
            name: name.to_string(),
            base_container_id,
            columns,
            unique: false,
            allow_duplicates: false,
            maintain_parent_links: true,
        }
    }

    /// Makes the index unique.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// Immutable descriptor of one B-tree index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BTree {
    name: String,
    container_id: u32,
    base_container_id: u32,
    columns: Vec<IndexColumn>,
    n_key_fields: usize,
    n_unique_columns: usize,
    allow_duplicates: bool,
    maintain_parent_links: bool,
}

impl BTree {
    /// Creates a new index in a fresh container and writes an empty root
    /// leaf to it under `txn`.
    pub fn create(
        txn: &Arc<Transaction>,
        params: CreateIndex,
        container_config: &ContainerConfig,
    ) -> Result<Arc<BTree>> {
        validate_columns(&params.columns)?;

        let manager = txn.manager();
        let container_id = manager.allocate_container_id();
        let container = Container::new(container_id, container_config.page_size)?;
        manager.register_container(Arc::clone(&container));

        let n_key_fields = params.columns.len();
        let n_unique_columns = if params.unique && !params.allow_duplicates {
            n_key_fields - 1
        } else {
            n_key_fields
        };
        let btree = Arc::new(BTree {
            name: params.name,
            container_id,
            base_container_id: params.base_container_id,
            columns: params.columns,
            n_key_fields,
            n_unique_columns,
            allow_duplicates: params.allow_duplicates,
            maintain_parent_links: params.maintain_parent_links,
        });

        let page = container.add_page(txn.log())?;
        if page.page_num() != FIRST_PAGE_NUM {
            return Err(ArborError::Internal(format!(
                "new index container {} did not start at page {}",
                container_id, FIRST_PAGE_NUM
            )));
        }
        ControlRow::initialize(txn.log(), page, ControlInfo::root_leaf(), Some(&btree))?;

        info!(
            index = %btree.name,
            container = container_id,
            base = btree.base_container_id,
            columns = n_key_fields,
            unique = btree.is_unique(),
            "index created"
        );
        Ok(btree)
    }

    /// Opens an index from the descriptor stored in its root page.
    pub fn open(manager: &Arc<TransactionManager>, container_id: u32) -> Result<Arc<BTree>> {
        let container = manager.container(container_id)?;
        let root = container
            .get_page(FIRST_PAGE_NUM)
            .ok_or(ArborError::PageNotFound {
                container_id,
                page_num: FIRST_PAGE_NUM,
            })?;
        let field = root.fetch_field_from_slot(CONTROL_SLOT, COLUMN_DESCRIPTOR)?;
        drop(root);

        let bytes = field.as_bytes().ok_or_else(|| ArborError::BTreeCorrupted {
            container_id,
            page_num: FIRST_PAGE_NUM,
            reason: "root control row carries no index descriptor".to_string(),
        })?;
        let btree = BTree::decode(bytes)?;
        if btree.container_id != container_id {
            return Err(ArborError::BTreeCorrupted {
                container_id,
                page_num: FIRST_PAGE_NUM,
                reason: format!("descriptor names container {}", btree.container_id),
            });
        }
        Ok(Arc::new(btree))
    }

    /// Reloads an index container from disk, registers it, and opens the
    /// index stored in it.
    pub fn reopen(
        manager: &Arc<TransactionManager>,
        disk: &DiskManager,
        container_id: u32,
    ) -> Result<Arc<BTree>> {
        let container = Container::open(container_id, disk)?;
        manager.register_container(container);
        BTree::open(manager, container_id)
    }

    /// Writes every page of the index to disk.
    pub fn checkpoint(&self, manager: &TransactionManager, disk: &DiskManager) -> Result<usize> {
        manager.container(self.container_id)?.checkpoint(disk)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn container_id(&self) -> u32 {
        self.container_id
    }

    #[inline]
    pub fn base_container_id(&self) -> u32 {
        self.base_container_id
    }

    #[inline]
    pub fn columns(&self) -> &[IndexColumn] {
        &self.columns
    }

    /// Number of columns in a leaf row, row location included.
    #[inline]
    pub fn n_key_fields(&self) -> usize {
        self.n_key_fields
    }

    /// Number of leading columns that identify a row.
    #[inline]
    pub fn n_unique_columns(&self) -> usize {
        self.n_unique_columns
    }

    /// Column holding the base-table row location.
    #[inline]
    pub fn row_location_column(&self) -> usize {
        self.n_key_fields - 1
    }

    /// True if rows are identified without their row location.
    #[inline]
    pub fn is_unique(&self) -> bool {
        self.n_unique_columns != self.n_key_fields
    }

    #[inline]
    pub fn allow_duplicates(&self) -> bool {
        self.allow_duplicates
    }

    #[inline]
    pub fn maintain_parent_links(&self) -> bool {
        self.maintain_parent_links
    }

    /// Checks that a row has the shape of a leaf row of this index.
    pub fn validate_row(&self, row: &[Value]) -> Result<()> {
        if row.len() != self.n_key_fields {
            return Err(ArborError::InvalidParameter {
                name: "row".to_string(),
                value: format!("{} columns, index has {}", row.len(), self.n_key_fields),
            });
        }
        for (value, column) in row.iter().zip(&self.columns) {
            if !value.conforms_to(column.type_id) {
                return Err(ArborError::TypeMismatch {
                    expected: column.type_id.to_string(),
                    actual: value.type_id().to_string(),
                });
            }
        }
        if row[self.row_location_column()].is_null() {
            return Err(ArborError::InvalidParameter {
                name: "row_location".to_string(),
                value: "NULL".to_string(),
            });
        }
        Ok(())
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Opens a controller for inserts and bulk load.
    pub fn open_controller(
        self: &Arc<Self>,
        txn: &Arc<Transaction>,
        policy: LockingPolicy,
        config: &IndexConfig,
    ) -> Result<BTreeController> {
        let open = OpenBTree::open(Arc::clone(self), Arc::clone(txn), policy, config, true)?;
        Ok(BTreeController::new(open))
    }

    /// Opens a scan.
    pub fn open_scan(
        self: &Arc<Self>,
        txn: &Arc<Transaction>,
        policy: LockingPolicy,
        config: &IndexConfig,
        params: ScanParams,
    ) -> Result<Arc<BTreeScan>> {
        BTreeScan::open(Arc::clone(self), txn, policy, config, params)
    }

    /// Opens a cost controller. It takes no locks.
    pub fn open_cost_controller(
        self: &Arc<Self>,
        txn: &Arc<Transaction>,
    ) -> Result<BTreeCostController> {
        let open = OpenBTree::open_unlocked(Arc::clone(self), Arc::clone(txn), &IndexConfig::default())?;
        BTreeCostController::new(open)
    }

    /// Returns the greatest non-deleted row whose first column is not NULL.
    pub fn fetch_max(
        self: &Arc<Self>,
        txn: &Arc<Transaction>,
        policy: LockingPolicy,
        config: &IndexConfig,
        fetch_columns: Option<&[usize]>,
    ) -> Result<Option<Row>> {
        max_scan::fetch_max(self, txn, policy, config, fetch_columns)
    }

    /// Number of levels, 1 for a tree that is a single leaf.
    pub fn height(self: &Arc<Self>, txn: &Arc<Transaction>) -> Result<u32> {
        let open = OpenBTree::open_unlocked(Arc::clone(self), Arc::clone(txn), &IndexConfig::default())?;
        let root = open.root()?;
        Ok(root.level() + 1)
    }

    /// Walks the whole tree checking page, sibling, parent and ordering
    /// invariants. Returns the number of pages checked.
    pub fn check_consistency(self: &Arc<Self>, txn: &Arc<Transaction>) -> Result<usize> {
        let open = OpenBTree::open_unlocked(Arc::clone(self), Arc::clone(txn), &IndexConfig::default())?;
        let root = open.root()?;
        root.check_consistency(&open, None)
    }

    /// Returns the number of rows on each level, leaf level first.
    pub fn level_row_counts(self: &Arc<Self>, txn: &Arc<Transaction>) -> Result<Vec<usize>> {
        let open = OpenBTree::open_unlocked(Arc::clone(self), Arc::clone(txn), &IndexConfig::default())?;
        let root = open.root()?;
        let height = root.level() as usize + 1;
        let mut first_on_level = Vec::with_capacity(height);
        let mut node = root;
        loop {
            first_on_level.push(node.page_num());
            match node.left_child() {
                Some(child) => {
                    let next = ControlRow::get(&open, child)?;
                    drop(node);
                    node = next;
                }
                None => break,
            }
        }
        drop(node);

        let mut counts = Vec::with_capacity(height);
        for &first in first_on_level.iter().rev() {
            let mut rows = 0;
            let mut next = first;
            while next != arbor_common::INVALID_PAGE_NUM {
                let node = ControlRow::get(&open, next)?;
                rows += node.row_count();
                next = node.right_sibling();
            }
            counts.push(rows);
        }
        Ok(counts)
    }

    // ========================================================================
    // Serialization
    // ========================================================================

    /// Serializes the descriptor for the root control row.
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(32 + self.name.len() + 2 * self.columns.len());
        buf.put_u8(DESCRIPTOR_VERSION);
        buf.put_u16_le(self.name.len() as u16);
        buf.put_slice(self.name.as_bytes());
        buf.put_u32_le(self.container_id);
        buf.put_u32_le(self.base_container_id);
        buf.put_u16_le(self.n_key_fields as u16);
        buf.put_u16_le(self.n_unique_columns as u16);
        let mut flags = 0u8;
        if self.allow_duplicates {
            flags |= FLAG_ALLOW_DUPLICATES;
        }
        if self.maintain_parent_links {
            flags |= FLAG_MAINTAIN_PARENT_LINKS;
        }
        buf.put_u8(flags);
        for column in &self.columns {
            buf.put_u8(column.type_id as u8);
            buf.put_u8(column.ascending as u8);
        }
        buf.to_vec()
    }

    /// Parses a descriptor written by `encode`.
    pub(crate) fn decode(mut data: &[u8]) -> Result<BTree> {
        let corrupted = |reason: &str| ArborError::PageCorrupted {
            page_num: FIRST_PAGE_NUM,
            reason: format!("index descriptor: {}", reason),
        };

        if data.remaining() < 3 {
            return Err(corrupted("truncated header"));
        }
        let version = data.get_u8();
        if version != DESCRIPTOR_VERSION {
            return Err(corrupted(&format!("unknown version {}", version)));
        }
        let name_len = data.get_u16_le() as usize;
        if data.remaining() < name_len + 13 {
            return Err(corrupted("truncated header"));
        }
        let name = String::from_utf8(data[..name_len].to_vec())
            .map_err(|_| corrupted("name is not UTF-8"))?;
        data.advance(name_len);

        let container_id = data.get_u32_le();
        let base_container_id = data.get_u32_le();
        let n_key_fields = data.get_u16_le() as usize;
        let n_unique_columns = data.get_u16_le() as usize;
        let flags = data.get_u8();

        if data.remaining() != n_key_fields * 2 {
            return Err(corrupted("column list length mismatch"));
        }
        let mut columns = Vec::with_capacity(n_key_fields);
        for _ in 0..n_key_fields {
            let type_id = TypeId::try_from(data.get_u8())?;
            let ascending = data.get_u8() != 0;
            columns.push(IndexColumn { type_id, ascending });
        }
        validate_columns(&columns)?;
        if n_unique_columns + 1 < n_key_fields || n_unique_columns > n_key_fields {
            return Err(corrupted("unique column count out of range"));
        }

        Ok(BTree {
            name,
            container_id,
            base_container_id,
            columns,
            n_key_fields,
            n_unique_columns,
            allow_duplicates: flags & FLAG_ALLOW_DUPLICATES != 0,
            maintain_parent_links: flags & FLAG_MAINTAIN_PARENT_LINKS != 0,
        })
    }
}

fn validate_columns(columns: &[IndexColumn]) -> Result<()> {
    let invalid = |value: String| ArborError::InvalidParameter {
        name: "columns".to_string(),
        value,
    };
    match columns.last() {
        None => return Err(invalid("no columns".to_string())),
        Some(last) if last.type_id != TypeId::RowLocation => {
            return Err(invalid(format!("last column is {}, not a row location", last.type_id)))
        }
        Some(_) => {}
    }
    if columns.len() < 2 {
        return Err(invalid("no key column before the row location".to_string()));
    }
    if let Some(column) = columns[..columns.len() - 1]
        .iter()
        .find(|c| matches!(c.type_id, TypeId::Null | TypeId::RowLocation))
    {
        return Err(invalid(format!("key column of type {}", column.type_id)));
    }
    Ok(())
}
