//! # Discretisation
//!
//! The second lowering pass. It turns the continuous part of a tree into linear algebra:
//! - `Variable(name, domain)` becomes the state vector slice allocated to `name`
//! - `gradient(x)`, `divergence(x)` become `M @ x` with the matrix registered for the operator
//!   and the domain of `x`
//! - `divergence(gradient(x))` and `laplacian(x)` use a laplacian matrix for the domain when
//!   one is registered, otherwise the composition `D @ (G @ x)`
//!
//! Both tables are supplied by the mesh driver and passed in explicitly, nothing is held
//! globally, so independent models can be discretised concurrently.
//!
//! Parameters must be substituted first: a tree that still holds a `Parameter` is rejected
//! with `PassOrder`.

use crate::expression_tree::errors::{ExprError, Result};
use crate::expression_tree::node::{Node, SpatialOperator, StateVectorSlice, take_children};
use crate::expression_tree::shape::{Domain, fmt_domain};
use log::{debug, info};
use nalgebra::DMatrix;
use std::collections::HashMap;

/// state vector slice allocated to each variable, by variable name
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SliceTable {
    slices: HashMap<String, StateVectorSlice>,
}

impl SliceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates contiguous slices in the given order, starting at 0.
    ///
    /// # Examples
    /// ```rust, ignore
    /// let slices = SliceTable::from_sizes([("c_n", 20), ("c_p", 30)])?;
    /// // c_n -> y[0:20], c_p -> y[20:50]
    /// ```
    pub fn from_sizes<I, S>(sizes: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, usize)>,
        S: Into<String>,
    {
        let mut table = Self::new();
        let mut offset = 0;
        for (name, size) in sizes {
            table.insert(name, offset, offset + size)?;
            offset += size;
        }
        info!("allocated {} variables over a state vector of length {}", table.len(), offset);
        Ok(table)
    }

    /// Maps `name` to `y[start..end]`. A name can be allocated only once.
    pub fn insert(&mut self, name: impl Into<String>, start: usize, end: usize) -> Result<()> {
        let name = name.into();
        let slice = StateVectorSlice::new(start, end)?;
        if self.slices.contains_key(&name) {
            return Err(ExprError::DomainError(format!(
                "variable {} already has a state vector slice",
                name
            )));
        }
        self.slices.insert(name, slice);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&StateVectorSlice> {
        self.slices.get(name)
    }

    /// length of a state vector covering every slice
    pub fn total_len(&self) -> usize {
        self.slices.values().map(StateVectorSlice::end).max().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }
}

/// discretisation matrices by spatial operator and domain
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SpatialOperatorTable {
    matrices: HashMap<(SpatialOperator, Domain), DMatrix<f64>>,
}

impl SpatialOperatorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// registers (or replaces) the matrix of `operator` on `domain`
    pub fn insert(&mut self, operator: SpatialOperator, domain: Domain, matrix: DMatrix<f64>) {
        self.matrices.insert((operator, domain), matrix);
    }

    pub fn get(&self, operator: SpatialOperator, domain: &Domain) -> Option<&DMatrix<f64>> {
        self.matrices.get(&(operator, domain.clone()))
    }

    pub fn len(&self) -> usize {
        self.matrices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matrices.is_empty()
    }

    fn require(&self, operator: SpatialOperator, domain: &Domain) -> Result<&DMatrix<f64>> {
        self.get(operator, domain)
            .ok_or_else(|| ExprError::NoSpatialOperatorForDomain {
                operator: operator.to_string(),
                domain: domain.clone(),
            })
    }
}

impl Node {
    /// Replaces variables and spatial operators with state vector slices and matrices.
    ///
    /// # Errors
    /// - `PassOrder` if a parameter is still present
    /// - `UnmappedVariable` if a variable has no slice
    /// - `NoSpatialOperatorForDomain` if a spatial operator has no matrix for its domain
    /// - `ShapeMismatch` if a matrix does not fit the slice it multiplies
    pub fn discretize(
        &self,
        slices: &SliceTable,
        operators: &SpatialOperatorTable,
    ) -> Result<Node> {
        if let Some(name) = self.parameter_names().into_iter().next() {
            return Err(ExprError::PassOrder(format!(
                "parameter {} must be substituted before discretisation",
                name
            )));
        }
        debug!(
            "discretising {} nodes, variables {:?}",
            self.node_count(),
            self.variable_names()
        );
        self.fold_with(|node: &Node, children| discretize_rule(node, children, slices, operators))?
            .resolve(operators)
    }
}

/// A discretised subtree. A gradient stays pending until its parent is seen, so that
/// `divergence(gradient(x))` can still use a laplacian matrix.
enum Lowered {
    Done(Node),
    Gradient { operand: Node, domain: Domain },
}

impl Lowered {
    fn resolve(self, operators: &SpatialOperatorTable) -> Result<Node> {
        match self {
            Lowered::Done(node) => Ok(node),
            Lowered::Gradient { operand, domain } => {
                apply_matrix(operators.require(SpatialOperator::Gradient, &domain)?, operand)
            }
        }
    }
}

fn discretize_rule(
    node: &Node,
    children: Vec<Lowered>,
    slices: &SliceTable,
    operators: &SpatialOperatorTable,
) -> Result<Lowered> {
    let lowered = match node {
        Node::Variable(var) => slices
            .get(&var.name)
            .map(|slice| Node::StateVector(*slice))
            .ok_or_else(|| ExprError::UnmappedVariable(var.name.clone()))?,
        Node::Parameter(name) => {
            return Err(ExprError::PassOrder(format!(
                "parameter {} reached discretisation",
                name
            )));
        }
        Node::Scalar(_) | Node::StateVector(_) | Node::Time | Node::Matrix(_) | Node::Vector(_) => {
            node.clone()
        }
        Node::Unary(op) => {
            let [child] = take_children(node, children)?;
            match op.kind().spatial() {
                Some(operator) => {
                    return discretize_spatial(operator, field_domain(op.child())?, child, operators);
                }
                None => node.with_children(vec![child.resolve(operators)?])?,
            }
        }
        Node::Binary(_) | Node::Concatenation(_) => {
            let children = children
                .into_iter()
                .map(|child| child.resolve(operators))
                .collect::<Result<Vec<_>>>()?;
            node.with_children(children)?
        }
    };
    Ok(Lowered::Done(lowered))
}

fn field_domain(node: &Node) -> Result<Domain> {
    node.shape()
        .domain()
        .cloned()
        .ok_or_else(|| ExprError::DomainError(format!("{} does not live on a domain", node)))
}

fn apply_matrix(matrix: &DMatrix<f64>, operand: Node) -> Result<Node> {
    Node::matmul(Node::matrix(matrix.clone()), operand)
}

fn discretize_spatial(
    operator: SpatialOperator,
    domain: Domain,
    child: Lowered,
    operators: &SpatialOperatorTable,
) -> Result<Lowered> {
    let lowered = match operator {
        SpatialOperator::Gradient => {
            return Ok(Lowered::Gradient {
                operand: child.resolve(operators)?,
                domain,
            });
        }
        SpatialOperator::Divergence => {
            // divergence(gradient(x)) is a laplacian of x
            if let Lowered::Gradient { operand, .. } = &child {
                if let Some(laplacian) = operators.get(SpatialOperator::Laplacian, &domain) {
                    debug!("fusing divergence(gradient) on {}", fmt_domain(&domain));
                    return Ok(Lowered::Done(apply_matrix(laplacian, operand.clone())?));
                }
            }
            let operand = child.resolve(operators)?;
            apply_matrix(operators.require(operator, &domain)?, operand)?
        }
        SpatialOperator::Laplacian => {
            let operand = child.resolve(operators)?;
            match operators.get(SpatialOperator::Laplacian, &domain) {
                Some(laplacian) => apply_matrix(laplacian, operand)?,
                None => {
                    let (Some(gradient), Some(divergence)) = (
                        operators.get(SpatialOperator::Gradient, &domain),
                        operators.get(SpatialOperator::Divergence, &domain),
                    ) else {
                        return Err(ExprError::NoSpatialOperatorForDomain {
                            operator: operator.to_string(),
                            domain,
                        });
                    };
                    apply_matrix(divergence, apply_matrix(gradient, operand)?)?
                }
            }
        }
    };
    Ok(Lowered::Done(lowered))
}
