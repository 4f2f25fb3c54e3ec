//! Parameter substitution: the first lowering pass, replacing every named constant with its value.

use crate::expression_tree::errors::{ExprError, Result};
use crate::expression_tree::node::Node;
use log::debug;
use std::collections::HashMap;

impl Node {
    /// Replaces every `Parameter(name)` leaf with `Scalar(parameters[name])`.
    /// Variables, state vector slices and spatial operators are left as they are.
    ///
    /// # Errors
    /// `UnknownParameter` for the first name (leaves read left to right) missing from
    /// `parameters`.
    ///
    /// # Examples
    /// ```rust, ignore
    /// let expr = Node::mul(Node::parameter("D"), Node::variable("c", ["neg"]))?;
    /// let values = HashMap::from([("D".to_string(), 2.0)]);
    /// let substituted = expr.substitute_parameters(&values)?; // (2 * c{neg})
    /// ```
    pub fn substitute_parameters(&self, parameters: &HashMap<String, f64>) -> Result<Node> {
        debug!(
            "substituting parameters {:?} into {} nodes",
            self.parameter_names(),
            self.node_count()
        );
        self.fold_with(|node: &Node, children: Vec<Node>| match node {
            Node::Parameter(name) => parameters
                .get(name)
                .map(|value| Node::scalar(*value))
                .ok_or_else(|| ExprError::UnknownParameter(name.clone())),
            Node::Scalar(_)
            | Node::Variable(_)
            | Node::StateVector(_)
            | Node::Time
            | Node::Matrix(_)
            | Node::Vector(_) => Ok(node.clone()),
            Node::Unary(_) | Node::Binary(_) | Node::Concatenation(_) => node.with_children(children),
        })
    }
}
