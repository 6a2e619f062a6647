//! In-memory entity datastore core for testing and local development.
//!
//! The crate provides an ordered byte-keyed substrate with O(1)
//! copy-on-write snapshots, secondary index maintenance driven by entity
//! mutations, a query planner that reduces declarative queries to index
//! range scans, optimistic per-entity-group transactions, and a
//! read-through cache fetch planner.

pub mod cache;
pub mod config;
pub mod data;
pub mod error;
pub mod index;
pub mod key;
pub mod property;
pub mod query;
pub mod serialize;
pub mod store;

pub use crate::cache::{CacheItem, FetchFacts, FetchPlan, FlagValue, make_fetch_plan};
pub use crate::config::Config;
pub use crate::data::{Datastore, Transaction, TransactionOptions};
pub use crate::error::{Error, Result};
pub use crate::index::{IndexColumn, IndexDefinition, KEY_PROP};
pub use crate::key::{ElemId, Key, KeyElem};
pub use crate::property::{Property, PropertyMap, PropertyValue};
pub use crate::query::{Cursor, FinalizedQuery, IndexCursor, Query, QueryRow, ReducedQuery, reduce};
pub use crate::store::{MemCollection, MemStore, Snapshot};
