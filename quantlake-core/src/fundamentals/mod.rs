//! Financial statements: schema discovery, flattening, merging and
//! derived metrics.
//!
//! Pipeline shape:
//!
//! ```text
//! records ─▶ Flattener(bs) ─┐
//! records ─▶ Flattener(is) ─┼─▶ merge_statements ─▶ derive_metrics ─▶ wide table
//! records ─▶ Flattener(cf) ─┘
//! ```

pub mod derive;
pub mod flatten;
pub mod merge;
pub mod record;
pub mod schema;

pub use derive::{derive_metrics, DeriveError, DERIVED_COLUMNS};
pub use flatten::{FlatTable, FlattenError, FlattenStats, Flattener, SchemaError};
pub use merge::{merge_statements, MergeError};
pub use record::{NaturalKey, RawStatementRecord, StatementKind, NATURAL_KEY_COLUMNS};
pub use schema::{
    ColumnSchema, SchemaAccumulator, SchemaDiscoverer, StatementSchema, UnifiedSchema,
    DEFAULT_COMMON_THRESHOLD,
};
