//! Error type shared by every stage of the expression tree: construction,
//! parameter substitution, discretisation, differentiation and evaluation.
//!
//! Nothing here is retried internally. Numeric singularities (division by zero,
//! log of a negative number) are not errors: they propagate as IEEE inf/NaN.

use crate::expression_tree::shape::{Domain, Shape, fmt_domain};

/// Error type for expression tree operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExprError {
    /// operands of an operator have incompatible shapes (construction time)
    #[error("shape mismatch in {op}: {left} and {right}")]
    ShapeMismatch {
        op: String,
        left: Shape,
        right: Shape,
    },

    /// a parameter, variable or spatial operator reached evaluation
    #[error("unresolved symbol reached evaluation: {0}")]
    UnresolvedSymbol(String),

    /// the state vector is shorter than a slice in the tree
    #[error("state vector slice y[{start}:{end}] out of range for y of length {len}")]
    IndexOutOfRange { start: usize, end: usize, len: usize },

    #[error("unknown parameter: {0}")]
    UnknownParameter(String),

    #[error("variable {0} has no state vector slice")]
    UnmappedVariable(String),

    #[error("no {operator} operator for domain {}", fmt_domain(.domain))]
    NoSpatialOperatorForDomain { operator: String, domain: Domain },

    #[error("invalid state vector slice y[{start}:{end}]")]
    InvalidSlice { start: usize, end: usize },

    #[error("domain error: {0}")]
    DomainError(String),

    #[error("tree depth {depth} exceeds limit {limit}")]
    DepthLimitExceeded { depth: usize, limit: usize },

    #[error("cannot differentiate with respect to non-leaf node {0}")]
    InvalidTarget(String),

    #[error("pass order violated: {0}")]
    PassOrder(String),

    #[error("jacobian not supported: {0}")]
    JacobianNotSupported(String),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ExprError>;
