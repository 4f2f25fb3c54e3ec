//! # Evaluation
//!
//! Numeric evaluation of a fully lowered tree for a time `t` and a state vector `y`.
//!
//! - `Node::evaluate(t, &y)` - plain bottom-up evaluation
//! - `KnownEvals` - evaluation that memoises subtrees by structural id for one `(t, y)`,
//!   so that the rhs and its jacobian share common work
//! - `evaluate_many` - independent trees evaluated in parallel with rayon
//!
//! Children are always evaluated left to right before their parent, so repeated calls are
//! bit-identical. Division by zero and friends follow IEEE semantics and are not errors.

use crate::expression_tree::errors::{ExprError, Result};
use crate::expression_tree::node::{
    BinaryKind, Node, PostOrder, StateVectorSlice, UnaryKind, take_children,
};
use crate::expression_tree::shape::Shape;
use log::debug;
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use std::collections::HashMap;

/// numeric result of an evaluation
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Scalar(f64),
    Vector(DVector<f64>),
    Matrix(DMatrix<f64>),
}

impl Value {
    pub fn shape(&self) -> Shape {
        self.view().shape()
    }

    /// the single entry of a scalar or of a one-element vector/matrix
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Value::Scalar(v) => Some(*v),
            Value::Vector(v) if v.len() == 1 => Some(v[0]),
            Value::Matrix(m) if m.len() == 1 => Some(m[(0, 0)]),
            _ => None,
        }
    }

    /// entries as a column vector (a scalar becomes a vector of length one, a matrix is read column-major)
    pub fn to_dvector(&self) -> DVector<f64> {
        match self {
            Value::Scalar(v) => DVector::from_element(1, *v),
            Value::Vector(v) => v.clone(),
            Value::Matrix(m) => DVector::from_column_slice(m.as_slice()),
        }
    }

    /// the value as a matrix; scalars are 1x1 and vectors are single columns
    pub fn to_dmatrix(&self) -> DMatrix<f64> {
        match self {
            Value::Scalar(v) => DMatrix::from_element(1, 1, *v),
            Value::Vector(v) => DMatrix::from_column_slice(v.len(), 1, v.as_slice()),
            Value::Matrix(m) => m.clone(),
        }
    }

    pub fn map(&self, f: impl Fn(f64) -> f64) -> Value {
        self.view().map(f)
    }

    /// largest absolute entry
    pub fn max_abs(&self) -> f64 {
        match self {
            Value::Scalar(v) => v.abs(),
            Value::Vector(v) => v.iter().fold(0.0, |acc: f64, x| acc.max(x.abs())),
            Value::Matrix(m) => m.iter().fold(0.0, |acc: f64, x| acc.max(x.abs())),
        }
    }
}

/// Borrowed view of a value, the input of every kernel. Constant leaves are viewed in place,
/// so evaluation never copies the matrices and vectors stored in a tree.
#[derive(Clone, Copy, Debug)]
pub(crate) enum ValueRef<'a> {
    Scalar(f64),
    Vector(&'a DVector<f64>),
    Matrix(&'a DMatrix<f64>),
}

impl ValueRef<'_> {
    pub(crate) fn shape(&self) -> Shape {
        match self {
            ValueRef::Scalar(_) => Shape::Scalar,
            ValueRef::Vector(v) => Shape::Vector(v.len()),
            ValueRef::Matrix(m) => Shape::Matrix(m.nrows(), m.ncols()),
        }
    }

    fn map(&self, f: impl Fn(f64) -> f64) -> Value {
        match self {
            ValueRef::Scalar(v) => Value::Scalar(f(*v)),
            ValueRef::Vector(v) => Value::Vector(v.map(f)),
            ValueRef::Matrix(m) => Value::Matrix(m.map(f)),
        }
    }

    pub(crate) fn to_value(self) -> Value {
        match self {
            ValueRef::Scalar(v) => Value::Scalar(v),
            ValueRef::Vector(v) => Value::Vector(v.clone()),
            ValueRef::Matrix(m) => Value::Matrix(m.clone()),
        }
    }
}

impl Value {
    pub(crate) fn view(&self) -> ValueRef<'_> {
        match self {
            Value::Scalar(v) => ValueRef::Scalar(*v),
            Value::Vector(v) => ValueRef::Vector(v),
            Value::Matrix(m) => ValueRef::Matrix(m),
        }
    }
}

/// result for one subtree: constants stay borrowed from the tree
#[derive(Debug)]
enum Operand<'n> {
    Borrowed(ValueRef<'n>),
    Owned(Value),
}

impl Operand<'_> {
    fn view(&self) -> ValueRef<'_> {
        match self {
            Operand::Borrowed(v) => *v,
            Operand::Owned(v) => v.view(),
        }
    }

    fn into_value(self) -> Value {
        match self {
            Operand::Borrowed(v) => v.to_value(),
            Operand::Owned(v) => v,
        }
    }
}

impl Node {
    /// Node holding a constant value: the inverse of evaluating a constant leaf.
    pub fn from_value(value: Value) -> Node {
        match value {
            Value::Scalar(v) => Node::Scalar(v),
            Value::Vector(v) => Node::Vector(v),
            Value::Matrix(m) => Node::Matrix(m),
        }
    }

    /// Evaluates a fully lowered tree.
    ///
    /// # Errors
    /// - `UnresolvedSymbol` if a parameter, variable or spatial operator is reached
    /// - `IndexOutOfRange` if `y` is shorter than a state vector slice
    ///
    /// # Examples
    /// ```rust, ignore
    /// let expr = Node::add(Node::state_vector(0, 1)?, Node::time())?;
    /// let value = expr.evaluate(1.0, &dvector![2.0])?; // Value::Scalar(3.0)
    /// ```
    pub fn evaluate(&self, t: f64, y: &DVector<f64>) -> Result<Value> {
        let mut evaluator = Evaluator { t, y, memo: None };
        self.fold(&mut evaluator).map(Operand::into_value)
    }
}

/// evaluates independent trees in parallel, results in input order
pub fn evaluate_many(nodes: &[Node], t: f64, y: &DVector<f64>) -> Result<Vec<Value>> {
    debug!("evaluating {} trees in parallel at t = {}", nodes.len(), t);
    nodes.par_iter().map(|node| node.evaluate(t, y)).collect()
}

/// Entries keep the node they were computed for: ids are hashes, and a colliding id of a
/// different subtree must never be served.
#[derive(Default)]
struct Memo {
    known: HashMap<u64, (Node, Value)>,
    hits: usize,
}

/// Memo of evaluated subtrees keyed by structural id, valid for one `(t, y)` pair.
pub struct KnownEvals<'a> {
    t: f64,
    y: &'a DVector<f64>,
    memo: Memo,
}

impl<'a> KnownEvals<'a> {
    pub fn new(t: f64, y: &'a DVector<f64>) -> Self {
        Self {
            t,
            y,
            memo: Memo::default(),
        }
    }

    pub fn evaluate(&mut self, node: &Node) -> Result<Value> {
        let mut evaluator = Evaluator {
            t: self.t,
            y: self.y,
            memo: Some(&mut self.memo),
        };
        node.fold(&mut evaluator).map(Operand::into_value)
    }

    /// number of subtrees served from the memo so far
    pub fn hits(&self) -> usize {
        self.memo.hits
    }

    pub fn len(&self) -> usize {
        self.memo.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memo.known.is_empty()
    }
}

struct Evaluator<'m, 'y> {
    t: f64,
    y: &'y DVector<f64>,
    memo: Option<&'m mut Memo>,
}

fn read_slice(slice: &StateVectorSlice, y: &DVector<f64>) -> Result<Value> {
    if slice.end() > y.len() {
        return Err(ExprError::IndexOutOfRange {
            start: slice.start(),
            end: slice.end(),
            len: y.len(),
        });
    }
    if slice.len() == 1 {
        return Ok(Value::Scalar(y[slice.start()]));
    }
    Ok(Value::Vector(y.rows(slice.start(), slice.len()).into_owned()))
}

impl<'n> PostOrder<'n> for Evaluator<'_, '_> {
    type Output = Operand<'n>;

    fn known(&mut self, node: &'n Node) -> Option<Operand<'n>> {
        if node.is_leaf() {
            return None;
        }
        let memo = self.memo.as_deref_mut()?;
        let (stored, value) = memo.known.get(&node.id())?;
        if stored != node {
            return None;
        }
        let value = value.clone();
        memo.hits += 1;
        Some(Operand::Owned(value))
    }

    fn visit(&mut self, node: &'n Node, children: Vec<Operand<'n>>) -> Result<Operand<'n>> {
        let value = match node {
            Node::Scalar(v) => return Ok(Operand::Borrowed(ValueRef::Scalar(*v))),
            Node::Vector(v) => return Ok(Operand::Borrowed(ValueRef::Vector(v))),
            Node::Matrix(m) => return Ok(Operand::Borrowed(ValueRef::Matrix(m))),
            Node::Time => return Ok(Operand::Borrowed(ValueRef::Scalar(self.t))),
            Node::StateVector(slice) => return read_slice(slice, self.y).map(Operand::Owned),
            Node::Parameter(name) => {
                return Err(ExprError::UnresolvedSymbol(format!("parameter {}", name)));
            }
            Node::Variable(var) => {
                return Err(ExprError::UnresolvedSymbol(format!("variable {}", var.name)));
            }
            Node::Unary(op) => {
                if op.kind().is_spatial() {
                    return Err(ExprError::UnresolvedSymbol(format!(
                        "{} operator on {}",
                        op.kind(),
                        op.child()
                    )));
                }
                let [child] = take_children(node, children)?;
                apply_unary(op.kind(), child.view())
            }
            Node::Binary(op) => {
                let [left, right] = take_children(node, children)?;
                apply_binary(op.kind(), left.view(), right.view())?
            }
            Node::Concatenation(_) => {
                let views: Vec<ValueRef> = children.iter().map(Operand::view).collect();
                concatenate_values(&views)?
            }
        };
        if let Some(memo) = self.memo.as_deref_mut() {
            memo.known.insert(node.id(), (node.clone(), value.clone()));
        }
        Ok(Operand::Owned(value))
    }
}

pub(crate) fn apply_unary(kind: UnaryKind, value: ValueRef) -> Value {
    match kind {
        UnaryKind::Diag => match value {
            ValueRef::Scalar(v) => Value::Matrix(DMatrix::from_element(1, 1, v)),
            ValueRef::Vector(v) => Value::Matrix(DMatrix::from_diagonal(v)),
            // rejected at construction
            ValueRef::Matrix(m) => Value::Matrix(m.clone()),
        },
        kind => value.map(|x| kind.apply(x)),
    }
}

pub(crate) fn apply_binary(kind: BinaryKind, left: ValueRef, right: ValueRef) -> Result<Value> {
    let mismatch = || ExprError::ShapeMismatch {
        op: kind.to_string(),
        left: left.shape(),
        right: right.shape(),
    };
    if kind == BinaryKind::MatMul {
        return match (left, right) {
            (ValueRef::Matrix(a), ValueRef::Vector(v)) if a.ncols() == v.len() => {
                Ok(Value::Vector(a * v))
            }
            (ValueRef::Matrix(a), ValueRef::Matrix(b)) if a.ncols() == b.nrows() => {
                Ok(Value::Matrix(a * b))
            }
            (ValueRef::Matrix(a), ValueRef::Scalar(s)) if a.ncols() == 1 => {
                Ok(Value::Vector(a.column(0) * s))
            }
            _ => Err(mismatch()),
        };
    }
    let f = |a: f64, b: f64| kind.apply(a, b);
    match (left, right) {
        (ValueRef::Scalar(a), ValueRef::Scalar(b)) => Ok(Value::Scalar(f(a, b))),
        (ValueRef::Scalar(a), other) => Ok(other.map(|b| f(a, b))),
        (other, ValueRef::Scalar(b)) => Ok(other.map(|a| f(a, b))),
        (ValueRef::Vector(a), ValueRef::Vector(b)) if a.len() == b.len() => {
            Ok(Value::Vector(a.zip_map(b, f)))
        }
        (ValueRef::Matrix(a), ValueRef::Matrix(b)) if a.shape() == b.shape() => {
            Ok(Value::Matrix(a.zip_map(b, f)))
        }
        _ => Err(mismatch()),
    }
}

pub(crate) fn concatenate_values(values: &[ValueRef]) -> Result<Value> {
    let blocks: Option<Vec<&DMatrix<f64>>> = values
        .iter()
        .map(|v| match v {
            ValueRef::Matrix(m) => Some(*m),
            _ => None,
        })
        .collect();
    if let Some(blocks) = blocks.filter(|b| !b.is_empty()) {
        let cols = blocks[0].ncols();
        let rows: usize = blocks.iter().map(|b| b.nrows()).sum();
        let mut out = DMatrix::zeros(rows, cols);
        let mut row = 0;
        for block in blocks {
            if block.ncols() != cols {
                return Err(ExprError::ShapeMismatch {
                    op: "concatenation".to_string(),
                    left: values[0].shape(),
                    right: Shape::Matrix(block.nrows(), block.ncols()),
                });
            }
            out.view_mut((row, 0), (block.nrows(), cols)).copy_from(block);
            row += block.nrows();
        }
        return Ok(Value::Matrix(out));
    }
    let mut entries = Vec::new();
    for value in values {
        match value {
            ValueRef::Scalar(v) => entries.push(*v),
            ValueRef::Vector(v) => entries.extend(v.iter().copied()),
            ValueRef::Matrix(_) => {
                return Err(ExprError::ShapeMismatch {
                    op: "concatenation".to_string(),
                    left: Shape::Vector(entries.len()),
                    right: value.shape(),
                });
            }
        }
    }
    Ok(Value::Vector(DVector::from_vec(entries)))
}
