use crate::index::IndexDefinition;
use compact_str::CompactString;
use thiserror::Error;

/// Which cursor of a query a cursor-shaped error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorKind {
    Start,
    End,
}

impl std::fmt::Display for CursorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CursorKind::Start => write!(f, "start"),
            CursorKind::End => write!(f, "end"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum Error {
    #[error("datastore: no such entity")]
    NoSuchEntity,

    #[error("datastore: invalid key")]
    InvalidKey,

    /// The query's filters or cursors are provably unsatisfiable.
    #[error("datastore: the query is provably empty")]
    NullQuery,

    /// No registered index can serve the reduced query shape. Carries the
    /// definition that would make the query executable.
    #[error("insufficient indexes in namespace {ns:?}, you need:\n  {missing}")]
    MissingIndex {
        ns: CompactString,
        missing: Box<IndexDefinition>,
    },

    #[error("datastore: invalid cursor")]
    InvalidCursor,

    /// The cursor value was not produced by this engine.
    #[error("datastore: bad cursor type")]
    BadCursorType,

    /// The cursor's column set does not line up with the query's effective
    /// sort order.
    #[error("datastore: {0} cursor is invalid")]
    CursorMismatch(CursorKind),

    #[error("queries within a transaction must include an Ancestor filter")]
    NoAncestor,

    #[error("query is too large: ({components} components)")]
    QueryTooLarge { components: usize },

    #[error("inequality filters on multiple properties: {first:?} and {second:?}")]
    MultipleInequality {
        first: CompactString,
        second: CompactString,
    },

    #[error("inequality filters on {prop:?} must also have {prop:?} as the first sort order")]
    IneqNotFirstSort { prop: CompactString },

    /// Free-form query validation failure. Tests match on stable message
    /// fragments, so wording here is load-bearing.
    #[error("{0}")]
    Query(String),

    /// Transient commit conflict; `run_in_transaction` retries these.
    #[error("datastore: concurrent transaction beat you to it")]
    Conflict,

    #[error("datastore: transaction context has expired")]
    TxnClosed,

    #[error("{}", too_many_groups_message(.xg))]
    TooManyEntityGroups { xg: bool },

    #[error("disable_special_entities is true so {op} is disabled")]
    SpecialEntitiesDisabled { op: &'static str },

    #[error("decode error: {0}")]
    Decode(String),
}

fn too_many_groups_message(xg: &bool) -> &'static str {
    if *xg {
        "operating on too many entity groups in a single transaction"
    } else {
        "cross-group transaction need to be explicitly specified (xg=True)"
    }
}

impl Error {
    pub fn query(msg: impl Into<String>) -> Self {
        Error::Query(msg.into())
    }

    /// True for errors that a transaction harness should retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Conflict)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Invariant breaches inside the store are programmer errors, not user
/// errors; they panic with a diagnostic instead of surfacing a `Result`.
macro_rules! corruption {
    ($($arg:tt)*) => {
        panic!("entstore memory corruption: {}", format!($($arg)*))
    };
}
pub(crate) use corruption;
