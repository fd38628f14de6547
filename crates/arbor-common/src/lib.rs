//! Arbor common types, errors, and utilities.
//!
//! This crate provides shared definitions used across all Arbor components.

pub mod config;
pub mod error;
pub mod page;
pub mod types;
pub mod value;

pub use config::{ArborConfig, ContainerConfig, IndexConfig, LockConfig};
pub use error::{ArborError, Result};
pub use page::{PageHeader, PageId, FIRST_PAGE_NUM, INVALID_PAGE_NUM, PAGE_SIZE};
pub use types::TypeId;
pub use value::{Row, RowLocation, Value};
