//! # Differentiation
//!
//! Symbolic differentiation of a tree with respect to one of its leaves: time, a state vector
//! slice, a parameter or a variable. The result is a new tree built with the usual rules:
//! - sum and difference: d(u ± v) = du ± dv
//! - product rule: d(u*v) = du*v + u*dv
//! - quotient rule: d(u/v) = (du*v - u*dv) / v^2
//! - power rule, with the general form when the exponent depends on the target
//! - chain rule: d(f(u)) = f'(u) * du, with f' taken from `pointwise_derivative`
//!
//! The derivative is the directional derivative along a uniform perturbation of the target:
//! every entry of a state vector slice moves together. A slice that only partially overlaps
//! the target differentiates to a 0/1 mask vector. For full matrices of partial derivatives
//! see `Node::jacobian`.
//!
//! Leaves are matched by structural identity, never by address. A subtree that does not
//! depend on the target differentiates to `Scalar(0)`; dependence is found in the same
//! bottom-up pass that builds the derivative. Spatial operators are linear and
//! commute with differentiation; a spatially uniform derivative under a spatial operator is
//! zero. The output is not minimal: run `simplify` on it.
//!
//! `d(u/v)` is built unconditionally; if `v` evaluates to zero the derivative evaluates to
//! inf/NaN, it is never rejected at build time.

use crate::expression_tree::errors::{ExprError, Result};
use crate::expression_tree::evaluate::{Value, apply_binary};
use crate::expression_tree::node::{BinaryKind, Node, UnaryKind, take_children};
use crate::expression_tree::shape::Shape;
use log::debug;
use nalgebra::DVector;

/// does `node` reference (part of) the leaf `target`
fn references(node: &Node, target: &Node) -> bool {
    match (node, target) {
        (Node::StateVector(a), Node::StateVector(b)) => a.overlap(b).is_some(),
        (Node::Time, Node::Time) => true,
        (Node::Parameter(a), Node::Parameter(b)) => a == b,
        (Node::Variable(a), Node::Variable(b)) => a == b,
        _ => false,
    }
}

/// Derivative f'(u) of an elementwise function, as a tree in `u`.
pub(crate) fn pointwise_derivative(kind: UnaryKind, u: &Node) -> Result<Node> {
    let one = || Node::scalar(1.0);
    let u_squared = || Node::pow(u.clone(), Node::scalar(2.0));
    match kind {
        UnaryKind::Negate => Ok(Node::scalar(-1.0)),
        UnaryKind::Sqrt => Node::divide(Node::scalar(0.5), Node::sqrt(u.clone())?),
        UnaryKind::Exp => Node::exp(u.clone()),
        UnaryKind::Ln => Node::divide(one(), u.clone()),
        UnaryKind::Sin => Node::cos(u.clone()),
        UnaryKind::Cos => Node::negate(Node::sin(u.clone())?),
        UnaryKind::Tan => Node::divide(one(), Node::pow(Node::cos(u.clone())?, Node::scalar(2.0))?),
        UnaryKind::Arcsin => Node::divide(one(), Node::sqrt(Node::sub(one(), u_squared()?)?)?),
        UnaryKind::Arccos => Node::negate(Node::divide(
            one(),
            Node::sqrt(Node::sub(one(), u_squared()?)?)?,
        )?),
        UnaryKind::Arctan => Node::divide(one(), Node::add(one(), u_squared()?)?),
        UnaryKind::Sinh => Node::unary(UnaryKind::Cosh, u.clone()),
        UnaryKind::Cosh => Node::unary(UnaryKind::Sinh, u.clone()),
        UnaryKind::Tanh => Node::sub(
            one(),
            Node::pow(Node::unary(UnaryKind::Tanh, u.clone())?, Node::scalar(2.0))?,
        ),
        UnaryKind::Diag
        | UnaryKind::Gradient
        | UnaryKind::Divergence
        | UnaryKind::Laplacian => Err(ExprError::JacobianNotSupported(format!(
            "{} has no pointwise derivative",
            kind
        ))),
    }
}

/// Expands a scalar-shaped derivative to `shape` (a column of ones times the scalar).
pub(crate) fn broadcast_to(derivative: Node, shape: &Shape) -> Result<Node> {
    let own = derivative.shape();
    if own == *shape {
        return Ok(derivative);
    }
    match (&own, Node::filled(shape, 1.0)) {
        (Shape::Scalar, Some(ones)) => Node::mul(derivative, ones),
        _ => Err(Shape::mismatch("broadcast", &own, shape)),
    }
}

fn zero_or(derivative: Option<Node>) -> Node {
    derivative.unwrap_or_else(|| Node::scalar(0.0))
}

/// Derivative of `node` given the derivatives of its children; `None` for a subtree that does
/// not depend on the target.
fn derivative_rule(node: &Node, wrt: &Node, children: Vec<Option<Node>>) -> Result<Option<Node>> {
    if !node.is_leaf() && children.iter().all(Option::is_none) {
        return Ok(None);
    }
    let derivative = match node {
        Node::Scalar(_) | Node::Matrix(_) | Node::Vector(_) => return Ok(None),
        Node::Time | Node::Parameter(_) | Node::Variable(_) => {
            return Ok(references(node, wrt).then(|| Node::scalar(1.0)));
        }
        Node::StateVector(slice) => match wrt {
            Node::StateVector(target) if slice.overlap(target).is_none() => return Ok(None),
            Node::StateVector(target) if target == slice || slice.len() == 1 => Node::scalar(1.0),
            Node::StateVector(target) => {
                let mask = DVector::from_fn(slice.len(), |i, _| {
                    if target.range().contains(&(slice.start() + i)) {
                        1.0
                    } else {
                        0.0
                    }
                });
                Node::vector(mask)
            }
            _ => return Ok(None),
        },
        Node::Unary(op) => {
            let u = op.child();
            let [du] = take_children(node, children)?;
            let du = zero_or(du);
            match op.kind() {
                UnaryKind::Negate => Node::negate(du)?,
                UnaryKind::Diag => Node::diag(broadcast_to(du, &u.shape())?)?,
                kind if kind.is_spatial() => {
                    if matches!(du.shape(), Shape::Field(_)) {
                        Node::unary(kind, du)?
                    } else {
                        Node::scalar(0.0)
                    }
                }
                kind => Node::mul(pointwise_derivative(kind, u)?, du)?,
            }
        }
        Node::Binary(op) => {
            let (u, v) = (op.left(), op.right());
            let [du, dv] = take_children(node, children)?;
            match op.kind() {
                BinaryKind::Add => Node::add(zero_or(du), zero_or(dv))?,
                BinaryKind::Subtract => Node::sub(zero_or(du), zero_or(dv))?,
                BinaryKind::Multiply => Node::add(
                    Node::mul(zero_or(du), v.clone())?,
                    Node::mul(u.clone(), zero_or(dv))?,
                )?,
                BinaryKind::Divide => Node::divide(
                    Node::sub(
                        Node::mul(zero_or(du), v.clone())?,
                        Node::mul(u.clone(), zero_or(dv))?,
                    )?,
                    Node::pow(v.clone(), Node::scalar(2.0))?,
                )?,
                BinaryKind::Power => match dv {
                    None => {
                        // v * u^(v-1) * du
                        let reduced = Node::sub(v.clone(), Node::scalar(1.0))?;
                        Node::mul(
                            Node::mul(v.clone(), Node::pow(u.clone(), reduced)?)?,
                            zero_or(du),
                        )?
                    }
                    Some(dv) => {
                        // u^v * (dv * ln(u) + v * du / u)
                        Node::mul(
                            node.clone(),
                            Node::add(
                                Node::mul(dv, Node::ln(u.clone())?)?,
                                Node::divide(Node::mul(v.clone(), zero_or(du))?, u.clone())?,
                            )?,
                        )?
                    }
                },
                BinaryKind::MatMul => {
                    let left = du
                        .map(|du| Node::matmul(broadcast_to(du, &u.shape())?, v.clone()))
                        .transpose()?;
                    let right = dv
                        .map(|dv| Node::matmul(u.clone(), broadcast_to(dv, &v.shape())?))
                        .transpose()?;
                    match (left, right) {
                        (Some(a), Some(b)) => Node::add(a, b)?,
                        (Some(a), None) | (None, Some(a)) => a,
                        (None, None) => return Ok(None),
                    }
                }
            }
        }
        Node::Concatenation(c) => {
            let parts = c
                .children()
                .iter()
                .zip(children)
                .map(|(child, d)| {
                    let shape = child.shape();
                    if shape.is_scalar() {
                        Ok(zero_or(d))
                    } else {
                        broadcast_to(zero_or(d), &shape)
                    }
                })
                .collect::<Result<Vec<_>>>()?;
            Node::concatenate(parts)?
        }
    };
    Ok(Some(derivative))
}

impl Node {
    /// true if any leaf of the tree references `target`
    pub fn depends_on(&self, target: &Node) -> bool {
        self.pre_order().into_iter().any(|n| references(n, target))
    }

    /// Derivative of the tree with respect to the leaf `wrt`.
    ///
    /// The tree is walked once, bottom-up, with an explicit work stack. Trees up to
    /// `MAX_DIFFERENTIABLE_DEPTH` deep always differentiate; for deeper trees the derivative
    /// may outgrow `MAX_TREE_DEPTH`, which is reported as `DepthLimitExceeded`.
    ///
    /// # Errors
    /// `InvalidTarget` if `wrt` is an operator or a numeric constant; shape errors only for
    /// concatenations of undiscretised fields, whose uniform derivative cannot be expanded.
    ///
    /// # Examples
    /// ```rust, ignore
    /// let y = Node::state_vector(0, 1)?;
    /// let f = Node::mul(y.clone(), y.clone())?;
    /// let df = f.differentiate(&y)?.simplify()?; // (y + y)
    /// ```
    pub fn differentiate(&self, wrt: &Node) -> Result<Node> {
        if !wrt.is_leaf() || wrt.is_constant() {
            return Err(ExprError::InvalidTarget(wrt.to_string()));
        }
        debug!("differentiating {} nodes with respect to {}", self.node_count(), wrt);
        let derivative = self.fold_with(|node: &Node, children| derivative_rule(node, wrt, children))?;
        Ok(zero_or(derivative))
    }

    /// Compares the analytical derivative with a central finite difference.
    ///
    /// `wrt` must be `Time` or a state vector slice (every entry of the slice is perturbed by
    /// `step`). Returns the largest absolute deviation and whether it is within `tolerance`.
    pub fn compare_with_finite_difference(
        &self,
        wrt: &Node,
        t: f64,
        y: &DVector<f64>,
        step: f64,
        tolerance: f64,
    ) -> Result<(f64, bool)> {
        let analytical = self.differentiate(wrt)?.evaluate(t, y)?;
        let (plus, minus) = match wrt {
            Node::Time => (self.evaluate(t + step, y)?, self.evaluate(t - step, y)?),
            Node::StateVector(slice) => {
                let (mut y_plus, mut y_minus) = (y.clone(), y.clone());
                for i in slice.range() {
                    if i < y.len() {
                        y_plus[i] += step;
                        y_minus[i] -= step;
                    }
                }
                (self.evaluate(t, &y_plus)?, self.evaluate(t, &y_minus)?)
            }
            other => {
                return Err(ExprError::InvalidTarget(format!(
                    "finite differences need time or a state vector slice, got {}",
                    other
                )));
            }
        };
        let numerical =
            apply_binary(BinaryKind::Subtract, plus.view(), minus.view())?.map(|d| d / (2.0 * step));
        let deviation: Value =
            apply_binary(BinaryKind::Subtract, analytical.view(), numerical.view())?;
        let max_error = deviation.max_abs();
        debug!("finite difference check against {}: max error {:e}", wrt, max_error);
        Ok((max_error, max_error <= tolerance))
    }
}
