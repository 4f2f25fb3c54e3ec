//! # Simplification
//!
//! Semantics-preserving rewriting that reduces the size of a tree. The rules:
//!
//! 1. **Constant folding**: an operator whose children are all numeric constants is replaced
//!    by the computed constant (spatial operators are never folded, they need a mesh)
//! 2. **Identities**: `x + 0`, `0 + x`, `x - 0`, `x * 1`, `1 * x`, `x / 1`, `x ^ 1` become `x`;
//!    `0 - x` becomes `-x`
//! 3. **Annihilators**: `x * 0`, `0 * x`, `A @ 0`, `0 @ x` become a zero constant of the
//!    result shape, `x ^ 0` a constant of ones
//! 4. **Double negation**: `-(-x)` becomes `x`
//! 5. **Concatenation**: constant children fold into one constant, neighbouring contiguous
//!    state vector slices merge into one slice
//!
//! An identity is only applied when the kept operand already has the shape of the whole node
//! (`0 + y[0:3]` collapses, `Vector(3) of zeros + t` does not), so simplification never changes
//! a shape. Annihilators are skipped on fields, whose size is unknown before discretisation.
//! Operands are never reordered or reassociated.
//!
//! Rules are applied bottom-up in one `fold` over the tree; the pass repeats while the node count keeps shrinking. Every
//! rule strictly removes nodes, so the loop terminates and the result is a fixed point:
//! `simplify(simplify(t)) == simplify(t)`.

use crate::expression_tree::errors::Result;
use crate::expression_tree::evaluate::{ValueRef, apply_binary, apply_unary, concatenate_values};
use crate::expression_tree::node::{BinaryKind, Node, StateVectorSlice, UnaryKind, take_children};
use crate::expression_tree::shape::Shape;
use log::debug;

fn constant_value(node: &Node) -> Option<ValueRef<'_>> {
    match node {
        Node::Scalar(v) => Some(ValueRef::Scalar(*v)),
        Node::Vector(v) => Some(ValueRef::Vector(v)),
        Node::Matrix(m) => Some(ValueRef::Matrix(m)),
        _ => None,
    }
}

impl Node {
    /// Simplified copy of the tree. See the module docs for the rules.
    pub fn simplify(&self) -> Result<Node> {
        let before = self.node_count();
        let mut current = self.simplify_once()?;
        let mut count = current.node_count();
        loop {
            let next = current.simplify_once()?;
            let next_count = next.node_count();
            if next_count >= count {
                break;
            }
            current = next;
            count = next_count;
        }
        debug!("simplified {} nodes to {}", before, count);
        Ok(current)
    }

    fn simplify_once(&self) -> Result<Node> {
        self.fold_with(|node: &Node, children: Vec<Node>| match node {
            Node::Scalar(_)
            | Node::Parameter(_)
            | Node::Variable(_)
            | Node::StateVector(_)
            | Node::Time
            | Node::Matrix(_)
            | Node::Vector(_) => Ok(node.clone()),
            Node::Unary(op) => {
                let [child] = take_children(node, children)?;
                simplify_unary(op.kind(), child)
            }
            Node::Binary(op) => {
                let [left, right] = take_children(node, children)?;
                simplify_binary(op.kind(), left, right, op.shape())
            }
            Node::Concatenation(c) => simplify_concatenation(children, c.shape()),
        })
    }
}

fn simplify_unary(kind: UnaryKind, child: Node) -> Result<Node> {
    if !kind.is_spatial() {
        if let Some(value) = constant_value(&child) {
            return Ok(Node::from_value(apply_unary(kind, value)));
        }
    }
    if kind == UnaryKind::Negate {
        if let Node::Unary(inner) = &child {
            if inner.kind() == UnaryKind::Negate {
                return Ok(inner.child().clone());
            }
        }
    }
    Node::unary(kind, child)
}

fn simplify_binary(kind: BinaryKind, left: Node, right: Node, shape: &Shape) -> Result<Node> {
    if let (Some(l), Some(r)) = (constant_value(&left), constant_value(&right)) {
        return Ok(Node::from_value(apply_binary(kind, l, r)?));
    }
    // operand kept as the whole result
    let keeps = |node: &Node| node.shape() == *shape;
    match kind {
        BinaryKind::Add => {
            if left.is_zero() && keeps(&right) {
                return Ok(right);
            }
            if right.is_zero() && keeps(&left) {
                return Ok(left);
            }
        }
        BinaryKind::Subtract => {
            if right.is_zero() && keeps(&left) {
                return Ok(left);
            }
            if left.is_zero() && keeps(&right) {
                return Node::negate(right);
            }
        }
        BinaryKind::Multiply => {
            if left.is_zero() || right.is_zero() {
                if let Some(zeros) = Node::filled(shape, 0.0) {
                    return Ok(zeros);
                }
            }
            if left.is_one() && keeps(&right) {
                return Ok(right);
            }
            if right.is_one() && keeps(&left) {
                return Ok(left);
            }
        }
        BinaryKind::Divide => {
            if right.is_one() && keeps(&left) {
                return Ok(left);
            }
        }
        BinaryKind::Power => {
            if right.is_zero() {
                if let Some(ones) = Node::filled(shape, 1.0) {
                    return Ok(ones);
                }
            }
            if right.is_one() && keeps(&left) {
                return Ok(left);
            }
        }
        BinaryKind::MatMul => {
            if left.is_zero() || right.is_zero() {
                if let Some(zeros) = Node::filled(shape, 0.0) {
                    return Ok(zeros);
                }
            }
        }
    }
    Node::binary(kind, left, right)
}

fn simplify_concatenation(children: Vec<Node>, shape: &Shape) -> Result<Node> {
    if !children.is_empty() {
        let values: Option<Vec<ValueRef>> = children.iter().map(constant_value).collect();
        if let Some(values) = values {
            return Ok(Node::from_value(concatenate_values(&values)?));
        }
    }
    let mut merged: Vec<Node> = Vec::with_capacity(children.len());
    for child in children {
        let prev = match merged.last() {
            Some(Node::StateVector(slice)) => Some(*slice),
            _ => None,
        };
        if let (Some(prev), Node::StateVector(next)) = (prev, &child) {
            if prev.end() == next.start() {
                let joined = StateVectorSlice::new(prev.start(), next.end())?;
                if let Some(last) = merged.last_mut() {
                    *last = Node::StateVector(joined);
                }
                continue;
            }
        }
        merged.push(child);
    }
    if merged.len() == 1 && merged[0].shape() == *shape {
        return Ok(merged.remove(0));
    }
    Node::concatenate(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression_tree::node::MAX_TREE_DEPTH;
    use approx::assert_relative_eq;
    use nalgebra::{DVector, dmatrix, dvector};

    fn y(start: usize, end: usize) -> Node {
        Node::state_vector(start, end).unwrap()
    }

    #[test]
    fn test_constant_folding() {
        let expr = Node::mul(
            Node::add(Node::scalar(2.0), Node::scalar(3.0)).unwrap(),
            y(0, 1),
        )
        .unwrap();
        assert_eq!(
            expr.simplify().unwrap(),
            Node::mul(Node::scalar(5.0), y(0, 1)).unwrap()
        );
        let folded = Node::matmul(
            Node::matrix(dmatrix![1.0, 2.0; 3.0, 4.0]),
            Node::vector(dvector![1.0, 1.0]),
        )
        .unwrap()
        .simplify()
        .unwrap();
        assert_eq!(folded, Node::vector(dvector![3.0, 7.0]));
        assert_eq!(
            Node::exp(Node::scalar(0.0)).unwrap().simplify().unwrap(),
            Node::scalar(1.0)
        );
    }

    #[test]
    fn test_identities() {
        let x = y(0, 3);
        let cases = vec![
            Node::add(x.clone(), Node::scalar(0.0)).unwrap(),
            Node::add(Node::scalar(0.0), x.clone()).unwrap(),
            Node::sub(x.clone(), Node::scalar(0.0)).unwrap(),
            Node::mul(x.clone(), Node::scalar(1.0)).unwrap(),
            Node::mul(Node::scalar(1.0), x.clone()).unwrap(),
            Node::divide(x.clone(), Node::scalar(1.0)).unwrap(),
            Node::pow(x.clone(), Node::scalar(1.0)).unwrap(),
            Node::negate(Node::negate(x.clone()).unwrap()).unwrap(),
        ];
        for case in cases {
            assert_eq!(case.simplify().unwrap(), x, "{}", case);
        }
        assert_eq!(
            Node::sub(Node::scalar(0.0), x.clone()).unwrap().simplify().unwrap(),
            Node::negate(x.clone()).unwrap()
        );
    }

    #[test]
    fn test_annihilators_keep_shape() {
        let x = y(0, 3);
        let zero = Node::mul(x.clone(), Node::scalar(0.0)).unwrap().simplify().unwrap();
        assert_eq!(zero, Node::vector(DVector::zeros(3)));
        let ones = Node::pow(x.clone(), Node::scalar(0.0)).unwrap().simplify().unwrap();
        assert_eq!(ones, Node::vector(DVector::from_element(3, 1.0)));
        // scalar operand cannot stand in for a vector result
        let broadcast = Node::add(Node::vector(DVector::zeros(3)), Node::time()).unwrap();
        let simplified = broadcast.simplify().unwrap();
        assert_eq!(simplified.shape(), Shape::Vector(3));
        assert_eq!(simplified, broadcast);
        // unknown size before discretisation
        let field = Node::mul(Node::variable("c", ["neg"]), Node::scalar(0.0)).unwrap();
        assert_eq!(field.simplify().unwrap(), field);
    }

    #[test]
    fn test_idempotent_and_semantics_preserving() {
        let a = y(0, 2);
        let expr = Node::add(
            Node::mul(
                Node::sub(Node::scalar(0.0), Node::negate(Node::sin(a.clone()).unwrap()).unwrap())
                    .unwrap(),
                Node::pow(Node::time(), Node::scalar(1.0)).unwrap(),
            )
            .unwrap(),
            Node::mul(Node::exp(a.clone()).unwrap(), Node::scalar(0.0)).unwrap(),
        )
        .unwrap();
        let once = expr.simplify().unwrap();
        let twice = once.simplify().unwrap();
        assert_eq!(once, twice);
        assert_eq!(once.shape(), expr.shape());
        assert!(once.node_count() < expr.node_count());
        let state = dvector![0.3, -1.1];
        let expected = expr.evaluate(0.7, &state).unwrap().to_dvector();
        let actual = once.evaluate(0.7, &state).unwrap().to_dvector();
        for (e, a) in expected.iter().zip(actual.iter()) {
            assert_relative_eq!(*e, *a, epsilon = 1e-14);
        }
    }

    #[test]
    fn test_concatenation_rules() {
        let merged = Node::concatenate(vec![y(0, 2), y(2, 5)]).unwrap().simplify().unwrap();
        assert_eq!(merged, y(0, 5));
        let gap = Node::concatenate(vec![y(0, 2), Node::time(), y(2, 3)]).unwrap();
        assert_eq!(gap.simplify().unwrap(), gap);
        let constants = Node::concatenate(vec![Node::scalar(1.0), Node::vector(dvector![2.0, 3.0])])
            .unwrap()
            .simplify()
            .unwrap();
        assert_eq!(constants, Node::vector(dvector![1.0, 2.0, 3.0]));
        let entries = Node::concatenate(vec![y(0, 1), y(1, 2)]).unwrap().simplify().unwrap();
        assert_eq!(entries, y(0, 2));
        let single = Node::concatenate(vec![y(3, 4)]).unwrap();
        assert_eq!(single.simplify().unwrap(), single);
    }

    #[test]
    fn test_simplify_at_depth_limit() {
        let mut expr = y(0, 3);
        for _ in 1..MAX_TREE_DEPTH {
            expr = Node::negate(expr).unwrap();
        }
        assert_eq!(expr.depth(), MAX_TREE_DEPTH);
        let simplified = expr.simplify().unwrap();
        assert_eq!(simplified, Node::negate(y(0, 3)).unwrap());

        let mut sum = y(0, 3);
        for _ in 1..MAX_TREE_DEPTH {
            sum = Node::add(sum, Node::scalar(0.0)).unwrap();
        }
        assert_eq!(sum.simplify().unwrap(), y(0, 3));
    }

    #[test]
    fn test_nan_terminates() {
        let expr = Node::mul(
            Node::add(Node::scalar(f64::NAN), Node::scalar(1.0)).unwrap(),
            y(0, 1),
        )
        .unwrap();
        let simplified = expr.simplify().unwrap();
        assert_eq!(simplified.node_count(), 3);
    }
}
