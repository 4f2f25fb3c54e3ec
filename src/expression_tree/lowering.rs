//! # Lowering
//!
//! Turns a set of model equations written with parameters, variables and spatial operators into
//! trees a time stepper can evaluate. The passes always run in the same order:
//! 1. parameter substitution
//! 2. discretisation
//! 3. concatenation of the equations into one right-hand side
//! 4. simplification (optional)
//! 5. jacobian with respect to the whole state vector (optional), simplified as well
//!
//! What runs is controlled by `LoweringConfig`, which can be read from TOML:
//! ```toml
//! simplify = true
//! jacobian = true
//! max_depth = 256
//! log_level = "info"
//! log_file = false
//! ```

use crate::Utils::logger::init_logger;
use crate::expression_tree::discretisation::{SliceTable, SpatialOperatorTable};
use crate::expression_tree::errors::{ExprError, Result};
use crate::expression_tree::evaluate::KnownEvals;
use crate::expression_tree::node::{MAX_TREE_DEPTH, Node, StateVectorSlice};
use log::{info, warn};
use nalgebra::{DMatrix, DVector};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Instant;

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoweringConfig {
    /// simplify the right-hand side and the jacobian
    pub simplify: bool,
    /// build the jacobian tree
    pub jacobian: bool,
    /// lowered trees deeper than this are rejected
    pub max_depth: usize,
    /// "debug", "info", "warn", "error" or "off"; no logger is installed when absent
    pub log_level: Option<String>,
    /// also log to a timestamped file
    pub log_file: bool,
}

impl Default for LoweringConfig {
    fn default() -> Self {
        Self {
            simplify: true,
            jacobian: false,
            max_depth: MAX_TREE_DEPTH,
            log_level: None,
            log_file: false,
        }
    }
}

impl LoweringConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: LoweringConfig =
            toml::from_str(text).map_err(|e| ExprError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ExprError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_depth == 0 || self.max_depth > MAX_TREE_DEPTH {
            return Err(ExprError::Config(format!(
                "max_depth must be between 1 and {}, got {}",
                MAX_TREE_DEPTH, self.max_depth
            )));
        }
        Ok(())
    }
}

/// Lowered model: the right-hand side and, if requested, its jacobian.
#[derive(Clone, Debug, PartialEq)]
pub struct LoweredModel {
    pub rhs: Node,
    pub jacobian: Option<Node>,
    /// length of the state vector the trees index into
    pub state_len: usize,
}

impl LoweredModel {
    pub fn evaluate_rhs(&self, t: f64, y: &DVector<f64>) -> Result<DVector<f64>> {
        Ok(self.rhs.evaluate(t, y)?.to_dvector())
    }

    pub fn evaluate_jacobian(&self, t: f64, y: &DVector<f64>) -> Result<DMatrix<f64>> {
        match &self.jacobian {
            Some(jacobian) => Ok(jacobian.evaluate(t, y)?.to_dmatrix()),
            None => Err(ExprError::Config(
                "jacobian was not requested when lowering".to_string(),
            )),
        }
    }

    /// Right-hand side and jacobian from one pass, evaluating shared subtrees once.
    pub fn evaluate_all(
        &self,
        t: f64,
        y: &DVector<f64>,
    ) -> Result<(DVector<f64>, Option<DMatrix<f64>>)> {
        let mut known = KnownEvals::new(t, y);
        let rhs = known.evaluate(&self.rhs)?.to_dvector();
        let jacobian = match &self.jacobian {
            Some(jacobian) => Some(known.evaluate(jacobian)?.to_dmatrix()),
            None => None,
        };
        Ok((rhs, jacobian))
    }
}

pub struct Lowering {
    pub config: LoweringConfig,
}

impl Lowering {
    pub fn new(config: LoweringConfig) -> Self {
        Self { config }
    }

    /// Runs the lowering passes over `equations`, in order.
    ///
    /// # Examples
    /// ```rust, ignore
    /// let c = Node::variable("c", ["neg"]);
    /// let rhs = Node::mul(Node::parameter("D"), Node::laplacian(c)?)?;
    /// let model = Lowering::new(LoweringConfig::default())
    ///     .lower(&[rhs], &parameters, &SliceTable::from_sizes([("c", 40)])?, &operators)?;
    /// let dydt = model.evaluate_rhs(0.0, &y)?;
    /// ```
    pub fn lower(
        &self,
        equations: &[Node],
        parameters: &HashMap<String, f64>,
        slices: &SliceTable,
        operators: &SpatialOperatorTable,
    ) -> Result<LoweredModel> {
        self.config.validate()?;
        if let Some(level) = &self.config.log_level {
            init_logger(Some(level.as_str()), self.config.log_file)?;
        }
        let begin = Instant::now();
        let size_before: usize = equations.iter().map(Node::node_count).sum();

        let lowered = equations
            .iter()
            .map(|eq| eq.substitute_parameters(parameters)?.discretize(slices, operators))
            .collect::<Result<Vec<_>>>()?;
        let mut rhs = Node::concatenate(lowered)?;
        if self.config.simplify {
            rhs = rhs.simplify()?;
        }
        self.check_depth(&rhs)?;

        let state_len = slices.total_len();
        let rows = rhs.shape().size().unwrap_or(0);
        if rows != state_len {
            warn!(
                "right-hand side has {} entries for a state vector of length {}",
                rows, state_len
            );
        }

        let jacobian = if self.config.jacobian {
            let whole = StateVectorSlice::new(0, state_len)?;
            let mut jacobian = rhs.jacobian(&whole)?;
            if self.config.simplify {
                jacobian = jacobian.simplify()?;
            }
            self.check_depth(&jacobian)?;
            Some(jacobian)
        } else {
            None
        };

        info!(
            "lowered {} equations ({} nodes) to {} nodes{} in {:?}",
            equations.len(),
            size_before,
            rhs.node_count(),
            jacobian
                .as_ref()
                .map(|j| format!(", jacobian {} nodes", j.node_count()))
                .unwrap_or_default(),
            begin.elapsed()
        );
        Ok(LoweredModel {
            rhs,
            jacobian,
            state_len,
        })
    }

    fn check_depth(&self, node: &Node) -> Result<()> {
        if node.depth() > self.config.max_depth {
            return Err(ExprError::DepthLimitExceeded {
                depth: node.depth(),
                limit: self.config.max_depth,
            });
        }
        Ok(())
    }
}
