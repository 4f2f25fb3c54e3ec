/// # Expression tree
/// immutable trees of scalar/array operators over time, a state vector, named parameters and
/// variables living on spatial domains. A model is written with parameters, variables and
/// spatial operators, then lowered (parameters substituted, variables and spatial operators
/// discretised) into a tree a time stepper evaluates again and again.
///# Example
/// ```
/// use RustedExprTree::expression_tree::node::Node;
/// use nalgebra::dvector;
/// let y = Node::state_vector(0, 1).unwrap();
/// let one_minus_y = Node::sub(Node::scalar(1.0), y.clone()).unwrap();
/// let logistic = Node::mul(Node::mul(Node::scalar(2.0), y).unwrap(), one_minus_y).unwrap();
/// let expr = Node::add(logistic, Node::time()).unwrap();
/// let value = expr.evaluate(1.0, &dvector![2.0]).unwrap();
/// assert_eq!(value.as_scalar(), Some(-3.0));
/// ```
/// ________________________________________________________________________________________________
/// node variants, validating constructors, structural identity and queries
pub mod node;
/// shapes and the rules that combine them
pub mod shape;
/// error type shared by all passes
pub mod errors;
/// evaluation against (t, y), evaluation cache, parallel evaluation
pub mod evaluate;
/// symbolic differentiation and finite difference checks
pub mod differentiate;
/// jacobian matrices with respect to a state vector slice
pub mod jacobian;
/// semantics-preserving rewriting
pub mod simplify;
/// parameter substitution pass
pub mod parameters;
/// discretisation pass: slice and spatial operator tables
pub mod discretisation;
/// the whole lowering pipeline with its TOML configuration
pub mod lowering;
///____________________________________________________________________________________________________________________________
/// end-to-end scenarios and properties across passes
#[cfg(test)]
mod expression_tree_tests;

pub use discretisation::{SliceTable, SpatialOperatorTable};
pub use errors::{ExprError, Result};
pub use evaluate::{KnownEvals, Value, evaluate_many};
pub use lowering::{LoweredModel, Lowering, LoweringConfig};
pub use node::{
    BinaryKind, MAX_DIFFERENTIABLE_DEPTH, MAX_TREE_DEPTH, Node, SpatialOperator, StateVectorSlice,
    UnaryKind,
};
pub use shape::{Domain, Shape, domain};
