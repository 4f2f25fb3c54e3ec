//! # Jacobian
//!
//! Builds a tree that evaluates to the matrix of partial derivatives of a discretised tree
//! with respect to a state vector slice: row `i` is entry `i` of the expression, column `j` is
//! entry `j` of the slice. This is what an implicit time stepper needs, where `differentiate`
//! only gives the derivative along a uniform perturbation.
//!
//! Rules, with `J(u)` the jacobian of a subtree:
//! - `J(y[s:e])` is the 0/1 matrix matching its entries to the entries of the target slice
//! - `J(u ± v) = J(u) ± J(v)`
//! - `J(u * v) = diag(v) @ J(u) + diag(u) @ J(v)`, quotient and power alike
//! - `J(f(u)) = diag(f'(u)) @ J(u)`
//! - `J(A @ u) = A @ J(u)` for a constant matrix `A`
//! - `J(concat(u, v))` stacks `J(u)` over `J(v)`
//!
//! A scalar factor multiplies instead of going through `diag`, a scalar-shaped operand of a
//! vector expression is lifted with a column of ones. Subtrees independent of the state
//! contribute nothing and are skipped, so the result holds no zero matrices except in
//! concatenations. State-dependent matrices (`diag(y)`, the left operand of a matmul) are not
//! supported.

use crate::expression_tree::differentiate::pointwise_derivative;
use crate::expression_tree::errors::{ExprError, Result};
use crate::expression_tree::node::{BinaryKind, Node, StateVectorSlice, UnaryKind, take_children};
use crate::expression_tree::shape::Shape;
use log::{debug, warn};
use nalgebra::DMatrix;

fn rows_of(node: &Node) -> Result<usize> {
    match node.shape() {
        Shape::Scalar => Ok(1),
        Shape::Vector(n) => Ok(n),
        other => Err(ExprError::JacobianNotSupported(format!(
            "{} has shape {}, only scalars and vectors have a jacobian",
            node, other
        ))),
    }
}

/// lifts the jacobian of a scalar to `rows` identical rows
fn lift(jacobian: Node, from_rows: usize, rows: usize) -> Result<Node> {
    if from_rows == rows {
        return Ok(jacobian);
    }
    Node::matmul(Node::matrix(DMatrix::from_element(rows, 1, 1.0)), jacobian)
}

/// row scaling of a jacobian by the entries of `factor`
fn scale(factor: Node, jacobian: Node) -> Result<Node> {
    if factor.shape().is_scalar() {
        Node::mul(factor, jacobian)
    } else {
        Node::matmul(Node::diag(factor)?, jacobian)
    }
}

fn combine(kind: BinaryKind, left: Option<Node>, right: Option<Node>) -> Result<Option<Node>> {
    Ok(match (left, right) {
        (Some(a), Some(b)) => Some(Node::binary(kind, a, b)?),
        (Some(a), None) => Some(a),
        (None, Some(b)) if kind == BinaryKind::Subtract => Some(Node::negate(b)?),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    })
}

impl Node {
    /// Jacobian of a discretised scalar- or vector-valued tree with respect to `wrt`, as a
    /// tree of shape `matrix(size x wrt.len())`. Built in one bottom-up pass; trees up to
    /// `MAX_DIFFERENTIABLE_DEPTH` deep always fit within `MAX_TREE_DEPTH`.
    ///
    /// # Errors
    /// - `UnresolvedSymbol` if the tree still holds parameters, variables or spatial operators
    /// - `JacobianNotSupported` for matrix-valued trees and state-dependent matrices
    ///
    /// # Examples
    /// ```rust, ignore
    /// let y = Node::state_vector(0, 3)?;
    /// let f = Node::mul(y.clone(), y.clone())?;
    /// let slice = StateVectorSlice::new(0, 3)?;
    /// let j = f.jacobian(&slice)?; // diag(y) @ I + diag(y) @ I
    /// ```
    pub fn jacobian(&self, wrt: &StateVectorSlice) -> Result<Node> {
        if let Some(node) = self.first_unresolved() {
            return Err(ExprError::UnresolvedSymbol(node.to_string()));
        }
        let rows = rows_of(self)?;
        debug!("building {}x{} jacobian with respect to {}", rows, wrt.len(), wrt);
        match self.fold_with(|node: &Node, children| jacobian_rule(node, wrt, children))? {
            Some(jacobian) => Ok(jacobian),
            None => {
                warn!("expression does not depend on {}, jacobian is zero", wrt);
                Ok(Node::matrix(DMatrix::zeros(rows, wrt.len())))
            }
        }
    }
}

fn overlap_matrix(slice: &StateVectorSlice, wrt: &StateVectorSlice) -> Node {
    Node::matrix(DMatrix::from_fn(slice.len(), wrt.len(), |i, j| {
        if slice.start() + i == wrt.start() + j {
            1.0
        } else {
            0.0
        }
    }))
}

/// Jacobian of `node` given those of its children; `None` stands for a zero jacobian.
fn jacobian_rule(
    node: &Node,
    wrt: &StateVectorSlice,
    children: Vec<Option<Node>>,
) -> Result<Option<Node>> {
    match node {
        Node::StateVector(slice) => Ok(slice.overlap(wrt).map(|_| overlap_matrix(slice, wrt))),
        Node::Scalar(_) | Node::Time | Node::Matrix(_) | Node::Vector(_) => Ok(None),
        Node::Parameter(_) | Node::Variable(_) => {
            Err(ExprError::UnresolvedSymbol(node.to_string()))
        }
        Node::Unary(op) => {
            let u = op.child();
            let [ju] = take_children(node, children)?;
            let Some(ju) = ju else {
                return Ok(None);
            };
            match op.kind() {
                UnaryKind::Negate => Ok(Some(Node::negate(ju)?)),
                UnaryKind::Diag => Err(ExprError::JacobianNotSupported(format!(
                    "diag of state-dependent {}",
                    u
                ))),
                kind if kind.is_spatial() => Err(ExprError::UnresolvedSymbol(node.to_string())),
                kind => Ok(Some(scale(pointwise_derivative(kind, u)?, ju)?)),
            }
        }
        Node::Binary(op) => {
            let (u, v) = (op.left(), op.right());
            let [ju, jv] = take_children(node, children)?;
            if ju.is_none() && jv.is_none() {
                return Ok(None);
            }
            if op.kind() == BinaryKind::MatMul {
                if ju.is_some() {
                    return Err(ExprError::JacobianNotSupported(format!(
                        "state-dependent matrix {}",
                        u
                    )));
                }
                return jv.map(|jv| Node::matmul(u.clone(), jv)).transpose();
            }
            let rows = rows_of(node)?;
            let ju = ju.map(|j| lift(j, rows_of(u)?, rows)).transpose()?;
            let jv = jv.map(|j| lift(j, rows_of(v)?, rows)).transpose()?;
            match op.kind() {
                BinaryKind::Add => combine(BinaryKind::Add, ju, jv),
                BinaryKind::Subtract => combine(BinaryKind::Subtract, ju, jv),
                BinaryKind::Multiply => {
                    let left = ju.map(|j| scale(v.clone(), j)).transpose()?;
                    let right = jv.map(|j| scale(u.clone(), j)).transpose()?;
                    combine(BinaryKind::Add, left, right)
                }
                BinaryKind::Divide => {
                    let left = ju
                        .map(|j| scale(Node::divide(Node::scalar(1.0), v.clone())?, j))
                        .transpose()?;
                    let right = jv
                        .map(|j| {
                            let factor =
                                Node::divide(u.clone(), Node::pow(v.clone(), Node::scalar(2.0))?)?;
                            scale(factor, j)
                        })
                        .transpose()?;
                    combine(BinaryKind::Subtract, left, right)
                }
                BinaryKind::Power => {
                    let left = ju
                        .map(|j| {
                            let reduced = Node::sub(v.clone(), Node::scalar(1.0))?;
                            let factor = Node::mul(v.clone(), Node::pow(u.clone(), reduced)?)?;
                            scale(factor, j)
                        })
                        .transpose()?;
                    let right = jv
                        .map(|j| scale(Node::mul(Node::ln(u.clone())?, node.clone())?, j))
                        .transpose()?;
                    combine(BinaryKind::Add, left, right)
                }
                BinaryKind::MatMul => Ok(None),
            }
        }
        Node::Concatenation(c) => {
            if children.iter().all(Option::is_none) {
                return Ok(None);
            }
            let blocks = c
                .children()
                .iter()
                .zip(children)
                .map(|(child, j)| match j {
                    Some(j) => Ok(j),
                    None => Ok(Node::matrix(DMatrix::zeros(rows_of(child)?, wrt.len()))),
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(Some(Node::concatenate(blocks)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression_tree::evaluate::Value;
    use crate::expression_tree::node::{MAX_DIFFERENTIABLE_DEPTH, MAX_TREE_DEPTH};
    use approx::assert_relative_eq;
    use nalgebra::{DVector, dmatrix, dvector};

    fn y(start: usize, end: usize) -> Node {
        Node::state_vector(start, end).unwrap()
    }

    /// central differences, one column per entry of the state vector
    fn numerical_jacobian(expr: &Node, t: f64, state: &DVector<f64>) -> DMatrix<f64> {
        let h = 1e-6;
        let rows = expr.evaluate(t, state).unwrap().to_dvector().len();
        let mut out = DMatrix::zeros(rows, state.len());
        for j in 0..state.len() {
            let (mut plus, mut minus) = (state.clone(), state.clone());
            plus[j] += h;
            minus[j] -= h;
            let f_plus = expr.evaluate(t, &plus).unwrap().to_dvector();
            let f_minus = expr.evaluate(t, &minus).unwrap().to_dvector();
            out.set_column(j, &((f_plus - f_minus) / (2.0 * h)));
        }
        out
    }

    fn check(expr: &Node, state: DVector<f64>) {
        let full = StateVectorSlice::new(0, state.len()).unwrap();
        let jacobian = expr.jacobian(&full).unwrap();
        let analytical = jacobian.evaluate(0.3, &state).unwrap().to_dmatrix();
        let numerical = numerical_jacobian(expr, 0.3, &state);
        assert_eq!(analytical.shape(), numerical.shape());
        for (a, n) in analytical.iter().zip(numerical.iter()) {
            assert_relative_eq!(*a, *n, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_elementwise_expression() {
        let x = y(0, 3);
        let expr = Node::sub(
            Node::add(
                Node::mul(Node::sin(x.clone()).unwrap(), x.clone()).unwrap(),
                Node::divide(Node::exp(Node::time()).unwrap(), x.clone()).unwrap(),
            )
            .unwrap(),
            Node::pow(x.clone(), Node::scalar(2.0)).unwrap(),
        )
        .unwrap();
        check(&expr, dvector![0.5, 1.5, 2.5]);
    }

    #[test]
    fn test_state_dependent_exponent_and_quotient() {
        let expr = Node::divide(
            Node::pow(y(0, 2), y(2, 4)).unwrap(),
            Node::add(y(2, 4), Node::scalar(1.0)).unwrap(),
        )
        .unwrap();
        check(&expr, dvector![1.2, 0.7, 2.0, 0.5]);
    }

    #[test]
    fn test_matmul_and_concatenation() {
        let m = Node::matrix(dmatrix![2.0, -1.0, 0.0; -1.0, 2.0, -1.0; 0.0, -1.0, 2.0]);
        let diffusion = Node::matmul(m, Node::mul(y(0, 3), y(0, 3)).unwrap()).unwrap();
        let expr = Node::concatenate(vec![
            diffusion,
            Node::mul(Node::time(), Node::sqrt(y(3, 4)).unwrap()).unwrap(),
            Node::scalar(1.0),
        ])
        .unwrap();
        check(&expr, dvector![0.1, 0.2, 0.3, 0.4]);
    }

    #[test]
    fn test_single_entry_slice_scales_vector() {
        // one scalar unknown times a field of four
        let expr = Node::mul(y(4, 5), y(0, 4)).unwrap();
        check(&expr, dvector![0.5, -1.0, 2.0, 0.25, 3.0]);
        let wrt = StateVectorSlice::new(4, 5).unwrap();
        let column = expr.jacobian(&wrt).unwrap();
        assert_eq!(
            column.evaluate(0.0, &dvector![0.5, -1.0, 2.0, 0.25, 3.0]).unwrap(),
            Value::Matrix(dmatrix![0.5; -1.0; 2.0; 0.25])
        );
    }

    #[test]
    fn test_deep_trees() {
        let full = StateVectorSlice::new(0, 1).unwrap();
        let mut chain = y(0, 1);
        for _ in 1..MAX_DIFFERENTIABLE_DEPTH {
            chain = Node::mul(chain, y(0, 1)).unwrap();
        }
        let jacobian = chain.jacobian(&full).unwrap();
        assert!(jacobian.depth() <= MAX_TREE_DEPTH);
        let value = jacobian.evaluate(0.0, &dvector![1.0]).unwrap();
        assert_eq!(value, Value::Matrix(dmatrix![MAX_DIFFERENTIABLE_DEPTH as f64]));

        while chain.depth() < MAX_TREE_DEPTH {
            chain = Node::mul(chain, y(0, 1)).unwrap();
        }
        assert!(matches!(
            chain.jacobian(&full),
            Err(ExprError::DepthLimitExceeded { .. })
        ));

        let mut negated = y(0, 3);
        for _ in 1..MAX_TREE_DEPTH {
            negated = Node::negate(negated).unwrap();
        }
        let jacobian = negated.jacobian(&StateVectorSlice::new(0, 3).unwrap()).unwrap();
        assert_eq!(
            jacobian.evaluate(0.0, &dvector![1.0, 2.0, 3.0]).unwrap(),
            Value::Matrix(-DMatrix::identity(3, 3))
        );
    }

    #[test]
    fn test_overlap_matrix() {
        let wrt = StateVectorSlice::new(1, 3).unwrap();
        let jacobian = y(0, 4).jacobian(&wrt).unwrap();
        assert_eq!(
            jacobian,
            Node::matrix(dmatrix![0.0, 0.0; 1.0, 0.0; 0.0, 1.0; 0.0, 0.0])
        );
    }

    #[test]
    fn test_independent_expression_is_zero() {
        let wrt = StateVectorSlice::new(0, 2).unwrap();
        let expr = Node::mul(Node::time(), Node::vector(dvector![1.0, 2.0, 3.0])).unwrap();
        assert_eq!(
            expr.jacobian(&wrt).unwrap(),
            Node::matrix(DMatrix::zeros(3, 2))
        );
    }

    #[test]
    fn test_unsupported_and_unresolved() {
        let wrt = StateVectorSlice::new(0, 2).unwrap();
        let state_matrix = Node::matmul(
            Node::diag(y(0, 2)).unwrap(),
            Node::vector(dvector![1.0, 1.0]),
        )
        .unwrap();
        assert!(matches!(
            state_matrix.jacobian(&wrt),
            Err(ExprError::JacobianNotSupported(_))
        ));
        let pending = Node::mul(Node::parameter("k"), y(0, 2)).unwrap();
        assert!(matches!(
            pending.jacobian(&wrt),
            Err(ExprError::UnresolvedSymbol(_))
        ));
    }
}
