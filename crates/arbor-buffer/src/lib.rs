//! Page containers for Arbor.
//!
//! This crate provides the paged storage that access methods build on:
//! - Slotted record pages with stable record ids and delete marks
//! - Exclusive page latches with blocking and no-wait acquisition
//! - Undo-logged page mutations and rollback
//! - Checkpointing containers to checksummed files

pub mod container;
pub mod disk;
mod frame;
pub mod page;

pub use container::{Container, PageLatch};
pub use disk::DiskManager;
pub use frame::{FrameGuard, FrameState, PageFrame};
pub use page::{FetchDescriptor, RecordPage, RecordSlot};
