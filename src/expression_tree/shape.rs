//! Shapes of expression tree nodes and the rules that combine them.
//!
//! A node is either resolved (`Scalar`, `Vector`, `Matrix`) or lives on a set of
//! spatial domains and has no size until it is discretised (`Field`).

use crate::expression_tree::errors::{ExprError, Result};
use itertools::Itertools;
use std::collections::BTreeSet;
use std::fmt;

/// set of domain names a variable lives on (ordered so that it can be hashed and printed)
pub type Domain = BTreeSet<String>;

/// build a domain from anything iterable over string-like items
pub fn domain<I, S>(names: I) -> Domain
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    names.into_iter().map(Into::into).collect()
}

pub fn fmt_domain(domain: &Domain) -> String {
    format!("{{{}}}", domain.iter().join(", "))
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Shape {
    Scalar,
    Vector(usize),
    Matrix(usize, usize),
    /// undiscretised quantity on a non-empty set of domains
    Field(Domain),
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Shape::Scalar => write!(f, "scalar"),
            Shape::Vector(n) => write!(f, "vector({})", n),
            Shape::Matrix(r, c) => write!(f, "matrix({}x{})", r, c),
            Shape::Field(domain) => write!(f, "field{}", fmt_domain(domain)),
        }
    }
}

impl Shape {
    /// number of entries of a resolved shape, `None` for fields
    pub fn size(&self) -> Option<usize> {
        match self {
            Shape::Scalar => Some(1),
            Shape::Vector(n) => Some(*n),
            Shape::Matrix(r, c) => Some(r * c),
            Shape::Field(_) => None,
        }
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self, Shape::Scalar)
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self, Shape::Field(_))
    }

    pub fn domain(&self) -> Option<&Domain> {
        match self {
            Shape::Field(domain) => Some(domain),
            _ => None,
        }
    }

    /// Output shape of an elementwise operator.
    ///
    /// A scalar combines with anything; two arrays must have exactly the same shape,
    /// two fields must live on the same domain. Single-entry state vector slices and domainless
    /// variables are scalar-shaped, so they broadcast too.
    pub fn elementwise(op: &str, left: &Shape, right: &Shape) -> Result<Shape> {
        match (left, right) {
            (Shape::Scalar, other) | (other, Shape::Scalar) => Ok(other.clone()),
            (l, r) if l == r => Ok(l.clone()),
            _ => Err(Self::mismatch(op, left, right)),
        }
    }

    /// Output shape of a matrix product `left @ right`.
    pub fn matmul(left: &Shape, right: &Shape) -> Result<Shape> {
        match (left, right) {
            (Shape::Matrix(r, k), Shape::Vector(n)) if k == n => Ok(Shape::Vector(*r)),
            (Shape::Matrix(r, k), Shape::Matrix(n, c)) if k == n => Ok(Shape::Matrix(*r, *c)),
            // a single entry stands for a vector of length one
            (Shape::Matrix(r, 1), Shape::Scalar) => Ok(Shape::Vector(*r)),
            _ => Err(Self::mismatch("matmul", left, right)),
        }
    }

    /// Output shape of a vertical concatenation.
    ///
    /// Scalars and vectors stack into a vector, matrices with the same number of columns
    /// stack row-wise, fields on disjoint domains merge into a field on the union.
    pub fn concatenation(shapes: &[Shape]) -> Result<Shape> {
        if shapes.is_empty() {
            return Ok(Shape::Vector(0));
        }
        if shapes.iter().all(|s| matches!(s, Shape::Field(_))) {
            let mut union = Domain::new();
            for shape in shapes {
                if let Shape::Field(d) = shape {
                    if !union.is_disjoint(d) {
                        return Err(ExprError::DomainError(format!(
                            "domain of children must be disjoint, {} overlaps {}",
                            fmt_domain(d),
                            fmt_domain(&union)
                        )));
                    }
                    union.extend(d.iter().cloned());
                }
            }
            return Ok(Shape::Field(union));
        }
        if shapes
            .iter()
            .all(|s| matches!(s, Shape::Scalar | Shape::Vector(_)))
        {
            let total = shapes.iter().filter_map(Shape::size).sum();
            return Ok(Shape::Vector(total));
        }
        if let Shape::Matrix(_, cols) = shapes[0] {
            let mut rows = 0;
            for shape in shapes {
                match shape {
                    Shape::Matrix(r, c) if *c == cols => rows += r,
                    other => return Err(Self::mismatch("concatenation", &shapes[0], other)),
                }
            }
            return Ok(Shape::Matrix(rows, cols));
        }
        let odd = shapes
            .iter()
            .find(|s| std::mem::discriminant(*s) != std::mem::discriminant(&shapes[0]))
            .unwrap_or(&shapes[0]);
        Err(Self::mismatch("concatenation", &shapes[0], odd))
    }

    pub(crate) fn mismatch(op: &str, left: &Shape, right: &Shape) -> ExprError {
        ExprError::ShapeMismatch {
            op: op.to_string(),
            left: left.clone(),
            right: right.clone(),
        }
    }
}
