//! # Node
//!
//! The tagged-variant representation of one vertex of the expression tree.
//!
//! ## Variants
//! - **Leaves**: `Scalar`, `Parameter`, `Variable`, `StateVector`, `Time`, `Matrix`, `Vector`
//! - **Operators**: `Unary`, `Binary`, `Concatenation`
//!
//! Operator nodes own their children through `Arc`, so a tree is cheap to clone and can be
//! shared between threads. Sharing is never observable: equality, hashing, evaluation and
//! differentiation only look at structural content.
//!
//! Every operator is built through a validating constructor (`Node::unary`, `Node::binary`,
//! `Node::concatenate` and the named shortcuts) which checks operand shapes, caches the output
//! shape, the depth and the structural id of the new node. The fields of `UnaryOp`, `BinaryOp`
//! and `Concatenation` are private so an unchecked operator cannot be assembled by hand.
//!
//! Passes (`substitute_parameters`, `discretize`, `differentiate`, `simplify`, `evaluate`)
//! live in sibling modules as further `impl Node` blocks. Each of them matches every variant
//! explicitly, so a new variant fails to compile until all of them handle it.

use crate::expression_tree::errors::{ExprError, Result};
use crate::expression_tree::shape::{Domain, Shape, domain, fmt_domain};
use itertools::Itertools;
use nalgebra::{DMatrix, DVector};
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::ops::Range;
use std::sync::Arc;
use strum_macros::{Display, EnumIter};

/// Maximum depth of a tree, checked by every constructor.
///
/// Passes walk trees with [`Node::fold`], an explicit work stack, so the call stack does not
/// grow with depth. The limit bounds the recursion left in `Drop`, `PartialEq` and `Display`,
/// and the size of derived trees.
pub const MAX_TREE_DEPTH: usize = 512;

/// Depth up to which `differentiate` and `jacobian` always succeed.
///
/// Every differentiation rule adds at most four levels on top of its operands, and every
/// jacobian rule at most three (plus a constant), so derivatives of trees this deep fit within
/// [`MAX_TREE_DEPTH`]. Deeper trees are still accepted; their derivative is built if it fits and
/// is `DepthLimitExceeded` otherwise.
pub const MAX_DIFFERENTIABLE_DEPTH: usize = MAX_TREE_DEPTH / 4;

/// spatial operators replaced by matrices during discretisation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum SpatialOperator {
    Gradient,
    Divergence,
    /// divergence of gradient
    Laplacian,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum UnaryKind {
    Negate,
    Sqrt,
    Exp,
    Ln,
    Sin,
    Cos,
    Tan,
    Arcsin,
    Arccos,
    Arctan,
    Sinh,
    Cosh,
    Tanh,
    /// vector to diagonal matrix
    Diag,
    Gradient,
    Divergence,
    Laplacian,
}

impl UnaryKind {
    pub fn spatial(self) -> Option<SpatialOperator> {
        match self {
            UnaryKind::Gradient => Some(SpatialOperator::Gradient),
            UnaryKind::Divergence => Some(SpatialOperator::Divergence),
            UnaryKind::Laplacian => Some(SpatialOperator::Laplacian),
            _ => None,
        }
    }

    pub fn is_spatial(self) -> bool {
        self.spatial().is_some()
    }

    /// true for the kinds applied entry by entry
    pub fn is_elementwise(self) -> bool {
        !self.is_spatial() && self != UnaryKind::Diag
    }

    /// Scalar function behind an elementwise kind. `Diag` and spatial kinds map to identity
    /// and are never dispatched here by the evaluator.
    pub fn apply(self, x: f64) -> f64 {
        match self {
            UnaryKind::Negate => -x,
            UnaryKind::Sqrt => x.sqrt(),
            UnaryKind::Exp => x.exp(),
            UnaryKind::Ln => x.ln(),
            UnaryKind::Sin => x.sin(),
            UnaryKind::Cos => x.cos(),
            UnaryKind::Tan => x.tan(),
            UnaryKind::Arcsin => x.asin(),
            UnaryKind::Arccos => x.acos(),
            UnaryKind::Arctan => x.atan(),
            UnaryKind::Sinh => x.sinh(),
            UnaryKind::Cosh => x.cosh(),
            UnaryKind::Tanh => x.tanh(),
            UnaryKind::Diag
            | UnaryKind::Gradient
            | UnaryKind::Divergence
            | UnaryKind::Laplacian => x,
        }
    }
}

impl From<SpatialOperator> for UnaryKind {
    fn from(op: SpatialOperator) -> Self {
        match op {
            SpatialOperator::Gradient => UnaryKind::Gradient,
            SpatialOperator::Divergence => UnaryKind::Divergence,
            SpatialOperator::Laplacian => UnaryKind::Laplacian,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum BinaryKind {
    Add,
    Subtract,
    Multiply,
    Divide,
    MatMul,
    Power,
}

impl BinaryKind {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryKind::Add => "+",
            BinaryKind::Subtract => "-",
            BinaryKind::Multiply => "*",
            BinaryKind::Divide => "/",
            BinaryKind::MatMul => "@",
            BinaryKind::Power => "^",
        }
    }

    /// Scalar arithmetic behind an elementwise kind (`MatMul` falls back to a product of scalars).
    pub fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            BinaryKind::Add => a + b,
            BinaryKind::Subtract => a - b,
            BinaryKind::Multiply | BinaryKind::MatMul => a * b,
            BinaryKind::Divide => a / b,
            BinaryKind::Power => a.powf(b),
        }
    }
}

/// window `y[start..end]` into the global state vector
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StateVectorSlice {
    start: usize,
    end: usize,
}

impl StateVectorSlice {
    pub fn new(start: usize, end: usize) -> Result<Self> {
        if start >= end {
            return Err(ExprError::InvalidSlice { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }

    /// indices shared by both slices, if any
    pub fn overlap(&self, other: &StateVectorSlice) -> Option<Range<usize>> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then_some(start..end)
    }
}

impl fmt::Display for StateVectorSlice {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "y[{}:{}]", self.start, self.end)
    }
}

/// symbolic unknown living on a set of domains, replaced by a state vector slice on discretisation
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Variable {
    pub name: String,
    pub domain: Domain,
}

#[derive(Clone, Debug)]
pub struct UnaryOp {
    kind: UnaryKind,
    child: Arc<Node>,
    shape: Shape,
    depth: usize,
    id: u64,
}

impl UnaryOp {
    pub fn kind(&self) -> UnaryKind {
        self.kind
    }
    pub fn child(&self) -> &Node {
        &self.child
    }
    pub fn shape(&self) -> &Shape {
        &self.shape
    }
}

impl PartialEq for UnaryOp {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.kind == other.kind
            && (Arc::ptr_eq(&self.child, &other.child) || self.child == other.child)
    }
}

#[derive(Clone, Debug)]
pub struct BinaryOp {
    kind: BinaryKind,
    left: Arc<Node>,
    right: Arc<Node>,
    shape: Shape,
    depth: usize,
    id: u64,
}

impl BinaryOp {
    pub fn kind(&self) -> BinaryKind {
        self.kind
    }
    pub fn left(&self) -> &Node {
        &self.left
    }
    pub fn right(&self) -> &Node {
        &self.right
    }
    pub fn shape(&self) -> &Shape {
        &self.shape
    }
}

impl PartialEq for BinaryOp {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.kind == other.kind
            && (Arc::ptr_eq(&self.left, &other.left) || self.left == other.left)
            && (Arc::ptr_eq(&self.right, &other.right) || self.right == other.right)
    }
}

#[derive(Clone, Debug)]
pub struct Concatenation {
    children: Vec<Node>,
    shape: Shape,
    depth: usize,
    id: u64,
}

impl Concatenation {
    pub fn children(&self) -> &[Node] {
        &self.children
    }
    pub fn shape(&self) -> &Shape {
        &self.shape
    }
}

impl PartialEq for Concatenation {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.children == other.children
    }
}

/// One vertex of the expression tree.
///
/// # Examples
/// ```rust, ignore
/// let y = Node::state_vector(0, 1)?;
/// let expr = Node::add(Node::mul(Node::scalar(2.0), y)?, Node::time())?;
/// ```
#[derive(Clone, Debug, PartialEq)]
pub enum Node {
    Scalar(f64),
    /// named constant, resolved by parameter substitution
    Parameter(String),
    /// named unknown, resolved by discretisation
    Variable(Variable),
    StateVector(StateVectorSlice),
    Time,
    Matrix(DMatrix<f64>),
    Vector(DVector<f64>),
    Unary(UnaryOp),
    Binary(BinaryOp),
    Concatenation(Concatenation),
}

// tags mixed into structural ids
const TAG_SCALAR: u8 = 0;
const TAG_PARAMETER: u8 = 1;
const TAG_VARIABLE: u8 = 2;
const TAG_STATE_VECTOR: u8 = 3;
const TAG_TIME: u8 = 4;
const TAG_MATRIX: u8 = 5;
const TAG_VECTOR: u8 = 6;
const TAG_UNARY: u8 = 7;
const TAG_BINARY: u8 = 8;
const TAG_CONCATENATION: u8 = 9;

/// +0.0 and -0.0 compare equal, so they must hash equal too
fn hash_f64<H: Hasher>(state: &mut H, value: f64) {
    let bits = if value == 0.0 { 0 } else { value.to_bits() };
    state.write_u64(bits);
}

fn structural_id(tag: u8, write: impl FnOnce(&mut DefaultHasher)) -> u64 {
    let mut hasher = DefaultHasher::new();
    hasher.write_u8(tag);
    write(&mut hasher);
    hasher.finish()
}

fn check_depth(depth: usize) -> Result<usize> {
    if depth > MAX_TREE_DEPTH {
        return Err(ExprError::DepthLimitExceeded {
            depth,
            limit: MAX_TREE_DEPTH,
        });
    }
    Ok(depth)
}

impl Node {
    //___________________________________LEAVES____________________________________

    pub fn scalar(value: f64) -> Node {
        Node::Scalar(value)
    }

    pub fn parameter(name: impl Into<String>) -> Node {
        Node::Parameter(name.into())
    }

    /// Variable on the given domains. An empty domain makes a scalar-shaped variable.
    pub fn variable<I, S>(name: impl Into<String>, domains: I) -> Node
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Node::Variable(Variable {
            name: name.into(),
            domain: domain(domains),
        })
    }

    pub fn time() -> Node {
        Node::Time
    }

    pub fn matrix(data: DMatrix<f64>) -> Node {
        Node::Matrix(data)
    }

    pub fn vector(data: DVector<f64>) -> Node {
        Node::Vector(data)
    }

    pub fn state_vector(start: usize, end: usize) -> Result<Node> {
        Ok(Node::StateVector(StateVectorSlice::new(start, end)?))
    }

    /// constant of the given resolved shape filled with `value`, `None` for fields
    pub fn filled(shape: &Shape, value: f64) -> Option<Node> {
        match shape {
            Shape::Scalar => Some(Node::Scalar(value)),
            Shape::Vector(n) => Some(Node::Vector(DVector::from_element(*n, value))),
            Shape::Matrix(r, c) => Some(Node::Matrix(DMatrix::from_element(*r, *c, value))),
            Shape::Field(_) => None,
        }
    }

    //___________________________________OPERATORS____________________________________

    pub fn unary(kind: UnaryKind, child: Node) -> Result<Node> {
        let child_shape = child.shape();
        let shape = if kind.is_spatial() {
            match &child_shape {
                Shape::Field(_) => child_shape.clone(),
                other => {
                    return Err(Shape::mismatch(
                        &kind.to_string(),
                        other,
                        &Shape::Field(Domain::new()),
                    ));
                }
            }
        } else if kind == UnaryKind::Diag {
            match child_shape {
                Shape::Scalar => Shape::Matrix(1, 1),
                Shape::Vector(n) => Shape::Matrix(n, n),
                ref other => return Err(Shape::mismatch("diag", other, &Shape::Vector(0))),
            }
        } else {
            child_shape
        };
        let depth = check_depth(child.depth() + 1)?;
        let id = structural_id(TAG_UNARY, |h| {
            kind.hash(h);
            h.write_u64(child.id());
        });
        Ok(Node::Unary(UnaryOp {
            kind,
            child: Arc::new(child),
            shape,
            depth,
            id,
        }))
    }

    pub fn binary(kind: BinaryKind, left: Node, right: Node) -> Result<Node> {
        let (ls, rs) = (left.shape(), right.shape());
        let shape = match kind {
            BinaryKind::MatMul => Shape::matmul(&ls, &rs)?,
            _ => Shape::elementwise(&kind.to_string(), &ls, &rs)?,
        };
        let depth = check_depth(left.depth().max(right.depth()) + 1)?;
        let id = structural_id(TAG_BINARY, |h| {
            kind.hash(h);
            h.write_u64(left.id());
            h.write_u64(right.id());
        });
        Ok(Node::Binary(BinaryOp {
            kind,
            left: Arc::new(left),
            right: Arc::new(right),
            shape,
            depth,
            id,
        }))
    }

    /// vertical concatenation of the children, in order
    pub fn concatenate(children: Vec<Node>) -> Result<Node> {
        let shapes: Vec<Shape> = children.iter().map(Node::shape).collect();
        let shape = Shape::concatenation(&shapes)?;
        let depth = check_depth(children.iter().map(Node::depth).max().unwrap_or(0) + 1)?;
        let id = structural_id(TAG_CONCATENATION, |h| {
            h.write_usize(children.len());
            for child in &children {
                h.write_u64(child.id());
            }
        });
        Ok(Node::Concatenation(Concatenation {
            children,
            shape,
            depth,
            id,
        }))
    }

    pub fn add(left: Node, right: Node) -> Result<Node> {
        Node::binary(BinaryKind::Add, left, right)
    }
    pub fn sub(left: Node, right: Node) -> Result<Node> {
        Node::binary(BinaryKind::Subtract, left, right)
    }
    pub fn mul(left: Node, right: Node) -> Result<Node> {
        Node::binary(BinaryKind::Multiply, left, right)
    }
    pub fn divide(left: Node, right: Node) -> Result<Node> {
        Node::binary(BinaryKind::Divide, left, right)
    }
    pub fn pow(base: Node, exponent: Node) -> Result<Node> {
        Node::binary(BinaryKind::Power, base, exponent)
    }
    pub fn matmul(left: Node, right: Node) -> Result<Node> {
        Node::binary(BinaryKind::MatMul, left, right)
    }
    pub fn negate(child: Node) -> Result<Node> {
        Node::unary(UnaryKind::Negate, child)
    }
    pub fn sqrt(child: Node) -> Result<Node> {
        Node::unary(UnaryKind::Sqrt, child)
    }
    pub fn exp(child: Node) -> Result<Node> {
        Node::unary(UnaryKind::Exp, child)
    }
    pub fn ln(child: Node) -> Result<Node> {
        Node::unary(UnaryKind::Ln, child)
    }
    pub fn sin(child: Node) -> Result<Node> {
        Node::unary(UnaryKind::Sin, child)
    }
    pub fn cos(child: Node) -> Result<Node> {
        Node::unary(UnaryKind::Cos, child)
    }
    pub fn diag(child: Node) -> Result<Node> {
        Node::unary(UnaryKind::Diag, child)
    }
    pub fn gradient(child: Node) -> Result<Node> {
        Node::unary(UnaryKind::Gradient, child)
    }
    pub fn divergence(child: Node) -> Result<Node> {
        Node::unary(UnaryKind::Divergence, child)
    }
    pub fn laplacian(child: Node) -> Result<Node> {
        Node::unary(UnaryKind::Laplacian, child)
    }

    /// Rebuilds an operator node of the same kind on top of new children, revalidating shapes.
    /// Leaves ignore `children` and are returned as they are.
    pub fn with_children(&self, mut children: Vec<Node>) -> Result<Node> {
        match self {
            Node::Unary(op) if children.len() == 1 => Node::unary(op.kind, children.remove(0)),
            Node::Binary(op) if children.len() == 2 => {
                let right = children.remove(1);
                let left = children.remove(0);
                Node::binary(op.kind, left, right)
            }
            Node::Concatenation(_) => Node::concatenate(children),
            Node::Unary(_) | Node::Binary(_) => Err(ExprError::DomainError(format!(
                "{} children supplied to rebuild {}",
                children.len(),
                self
            ))),
            Node::Scalar(_)
            | Node::Parameter(_)
            | Node::Variable(_)
            | Node::StateVector(_)
            | Node::Time
            | Node::Matrix(_)
            | Node::Vector(_) => Ok(self.clone()),
        }
    }

    //___________________________________PROPERTIES____________________________________

    pub fn shape(&self) -> Shape {
        match self {
            Node::Scalar(_) | Node::Parameter(_) | Node::Time => Shape::Scalar,
            Node::Variable(var) => {
                if var.domain.is_empty() {
                    Shape::Scalar
                } else {
                    Shape::Field(var.domain.clone())
                }
            }
            // a single entry behaves like a scalar and broadcasts against any array
            Node::StateVector(slice) if slice.len() == 1 => Shape::Scalar,
            Node::StateVector(slice) => Shape::Vector(slice.len()),
            Node::Matrix(m) => Shape::Matrix(m.nrows(), m.ncols()),
            Node::Vector(v) => Shape::Vector(v.len()),
            Node::Unary(op) => op.shape.clone(),
            Node::Binary(op) => op.shape.clone(),
            Node::Concatenation(c) => c.shape.clone(),
        }
    }

    pub fn depth(&self) -> usize {
        match self {
            Node::Unary(op) => op.depth,
            Node::Binary(op) => op.depth,
            Node::Concatenation(c) => c.depth,
            Node::Scalar(_)
            | Node::Parameter(_)
            | Node::Variable(_)
            | Node::StateVector(_)
            | Node::Time
            | Node::Matrix(_)
            | Node::Vector(_) => 1,
        }
    }

    /// Structural identity: a content hash of the kind and the children's ids.
    /// Independently built but structurally equal trees have equal ids.
    pub fn id(&self) -> u64 {
        match self {
            Node::Scalar(v) => structural_id(TAG_SCALAR, |h| hash_f64(h, *v)),
            Node::Parameter(name) => structural_id(TAG_PARAMETER, |h| name.hash(h)),
            Node::Variable(var) => structural_id(TAG_VARIABLE, |h| var.hash(h)),
            Node::StateVector(slice) => structural_id(TAG_STATE_VECTOR, |h| slice.hash(h)),
            Node::Time => structural_id(TAG_TIME, |_| {}),
            Node::Matrix(m) => structural_id(TAG_MATRIX, |h| {
                h.write_usize(m.nrows());
                h.write_usize(m.ncols());
                m.iter().for_each(|v| hash_f64(h, *v));
            }),
            Node::Vector(v) => structural_id(TAG_VECTOR, |h| {
                h.write_usize(v.len());
                v.iter().for_each(|x| hash_f64(h, *x));
            }),
            Node::Unary(op) => op.id,
            Node::Binary(op) => op.id,
            Node::Concatenation(c) => c.id,
        }
    }

    pub fn children(&self) -> Vec<&Node> {
        match self {
            Node::Unary(op) => vec![op.child()],
            Node::Binary(op) => vec![op.left(), op.right()],
            Node::Concatenation(c) => c.children.iter().collect(),
            Node::Scalar(_)
            | Node::Parameter(_)
            | Node::Variable(_)
            | Node::StateVector(_)
            | Node::Time
            | Node::Matrix(_)
            | Node::Vector(_) => Vec::new(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        !matches!(
            self,
            Node::Unary(_) | Node::Binary(_) | Node::Concatenation(_)
        )
    }

    /// numeric constant leaf (scalar, vector or matrix)
    pub fn is_constant(&self) -> bool {
        matches!(self, Node::Scalar(_) | Node::Vector(_) | Node::Matrix(_))
    }

    fn is_filled_with(&self, value: f64) -> bool {
        match self {
            Node::Scalar(v) => *v == value,
            Node::Vector(v) => v.iter().all(|x| *x == value),
            Node::Matrix(m) => m.iter().all(|x| *x == value),
            _ => false,
        }
    }

    /// constant whose every entry is zero
    pub fn is_zero(&self) -> bool {
        self.is_filled_with(0.0)
    }

    /// constant whose every entry is one
    pub fn is_one(&self) -> bool {
        self.is_filled_with(1.0)
    }

    /// Pre-order traversal with an explicit work stack, left children first.
    pub fn pre_order(&self) -> Vec<&Node> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            out.push(node);
            stack.extend(node.children().into_iter().rev());
        }
        out
    }

    pub fn node_count(&self) -> usize {
        self.pre_order().len()
    }

    pub fn parameter_names(&self) -> BTreeSet<String> {
        self.pre_order()
            .into_iter()
            .filter_map(|n| match n {
                Node::Parameter(name) => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn variable_names(&self) -> BTreeSet<String> {
        self.pre_order()
            .into_iter()
            .filter_map(|n| match n {
                Node::Variable(var) => Some(var.name.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn has_parameters(&self) -> bool {
        self.pre_order()
            .iter()
            .any(|n| matches!(n, Node::Parameter(_)))
    }

    /// true while a variable or spatial operator is still reachable
    pub fn has_undiscretised(&self) -> bool {
        self.pre_order().iter().any(|n| match n {
            Node::Variable(_) => true,
            Node::Unary(op) => op.kind.is_spatial(),
            _ => false,
        })
    }

    /// true if the tree cannot be evaluated yet
    pub fn has_unresolved(&self) -> bool {
        self.has_parameters() || self.has_undiscretised()
    }

    /// first node that blocks evaluation, if any
    pub(crate) fn first_unresolved(&self) -> Option<&Node> {
        self.pre_order().into_iter().find(|n| match n {
            Node::Parameter(_) | Node::Variable(_) => true,
            Node::Unary(op) => op.kind.is_spatial(),
            _ => false,
        })
    }
}

/// Pass driven by [`Node::fold`]: children are visited before their parent, left to right.
pub(crate) trait PostOrder<'n> {
    type Output;

    /// Result of a subtree known without visiting it, e.g. a cached evaluation.
    fn known(&mut self, _node: &'n Node) -> Option<Self::Output> {
        None
    }

    /// `children` holds the results of the node's children, in order.
    fn visit(&mut self, node: &'n Node, children: Vec<Self::Output>) -> Result<Self::Output>;
}

struct VisitWith<F, T>(F, std::marker::PhantomData<fn() -> T>);

impl<'n, T, F> PostOrder<'n> for VisitWith<F, T>
where
    F: FnMut(&'n Node, Vec<T>) -> Result<T>,
{
    type Output = T;

    fn visit(&mut self, node: &'n Node, children: Vec<T>) -> Result<T> {
        (self.0)(node, children)
    }
}

impl Node {
    /// Bottom-up pass over the tree with an explicit work stack. Stops at the first error.
    pub(crate) fn fold<'n, P: PostOrder<'n>>(&'n self, pass: &mut P) -> Result<P::Output> {
        // `Some(n)` marks a node whose n children have already been pushed
        let mut work: Vec<(&'n Node, Option<usize>)> = vec![(self, None)];
        let mut done: Vec<P::Output> = Vec::new();
        while let Some((node, expanded)) = work.pop() {
            match expanded {
                Some(count) => {
                    let children = done.split_off(done.len() - count);
                    done.push(pass.visit(node, children)?);
                }
                None => {
                    if let Some(output) = pass.known(node) {
                        done.push(output);
                        continue;
                    }
                    let children = node.children();
                    work.push((node, Some(children.len())));
                    work.extend(children.into_iter().rev().map(|c| (c, None)));
                }
            }
        }
        done.pop()
            .ok_or_else(|| ExprError::DomainError(format!("no result for {}", self)))
    }

    /// [`Node::fold`] with a closure as the pass
    pub(crate) fn fold_with<'n, T>(
        &'n self,
        visit: impl FnMut(&'n Node, Vec<T>) -> Result<T>,
    ) -> Result<T> {
        self.fold(&mut VisitWith(visit, std::marker::PhantomData))
    }
}

/// Results of the children of a unary (`N = 1`) or binary (`N = 2`) node.
pub(crate) fn take_children<T, const N: usize>(node: &Node, children: Vec<T>) -> Result<[T; N]> {
    children.try_into().map_err(|rest: Vec<T>| {
        ExprError::DomainError(format!("{} results for the children of {}", rest.len(), node))
    })
}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.id());
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Node::Scalar(v) => write!(f, "{}", v),
            Node::Parameter(name) => write!(f, "{}", name),
            Node::Variable(var) => {
                if var.domain.is_empty() {
                    write!(f, "{}", var.name)
                } else {
                    write!(f, "{}{}", var.name, fmt_domain(&var.domain))
                }
            }
            Node::StateVector(slice) => write!(f, "{}", slice),
            Node::Time => write!(f, "t"),
            Node::Matrix(m) => write!(f, "Matrix({}x{})", m.nrows(), m.ncols()),
            Node::Vector(v) => write!(f, "Vector({})", v.len()),
            Node::Unary(op) => match op.kind {
                UnaryKind::Negate => write!(f, "-({})", op.child),
                kind => write!(f, "{}({})", kind, op.child),
            },
            Node::Binary(op) => write!(f, "({} {} {})", op.left, op.kind.symbol(), op.right),
            Node::Concatenation(c) => {
                write!(f, "concat({})", c.children.iter().map(|n| n.to_string()).join(", "))
            }
        }
    }
}
