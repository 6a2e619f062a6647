//! Query pipeline: builder and finalization (`plan`), reduction to an
//! index-range scan (`reduce`), opaque resumption cursors (`cursor`), and
//! execution over store snapshots (`executor`).

pub mod cursor;
pub mod executor;
pub mod plan;
pub mod reduce;

pub use cursor::{Cursor, IndexCursor};
pub use executor::QueryRow;
pub use plan::{FinalizedQuery, Query};
pub use reduce::{ReducedQuery, reduce};
