#[cfg(test)]
mod tests {
    use crate::expression_tree::discretisation::{SliceTable, SpatialOperatorTable};
    use crate::expression_tree::errors::ExprError;
    use crate::expression_tree::evaluate::{KnownEvals, Value, evaluate_many};
    use crate::expression_tree::lowering::{Lowering, LoweringConfig};
    use crate::expression_tree::node::{
        MAX_DIFFERENTIABLE_DEPTH, MAX_TREE_DEPTH, Node, SpatialOperator, StateVectorSlice, UnaryKind,
    };
    use crate::expression_tree::shape::domain;
    use approx::assert_relative_eq;
    use nalgebra::{DMatrix, DVector, dmatrix, dvector};
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::thread;
    use strum::IntoEnumIterator;

    /// 2 * y * (1 - y) + t
    fn logistic() -> Node {
        let y = Node::state_vector(0, 1).unwrap();
        Node::add(
            Node::mul(
                Node::mul(Node::scalar(2.0), y.clone()).unwrap(),
                Node::sub(Node::scalar(1.0), y).unwrap(),
            )
            .unwrap(),
            Node::time(),
        )
        .unwrap()
    }

    /// D * divergence(gradient(c))
    fn diffusion() -> Node {
        Node::mul(
            Node::parameter("D"),
            Node::divergence(Node::gradient(Node::variable("c", ["neg"])).unwrap()).unwrap(),
        )
        .unwrap()
    }

    /// second difference matrix with Neumann ends
    fn laplacian(n: usize) -> DMatrix<f64> {
        DMatrix::from_fn(n, n, |i, j| {
            let ends = i == 0 || i == n - 1;
            if i == j {
                if ends { -1.0 } else { -2.0 }
            } else if i.abs_diff(j) == 1 {
                1.0
            } else {
                0.0
            }
        })
    }

    fn table(entries: &[(&str, f64)]) -> HashMap<String, f64> {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    /// trees covering every operator kind, over a 3-entry state vector
    fn sample_trees() -> Vec<Node> {
        let a = Node::state_vector(0, 2).unwrap();
        let b = Node::state_vector(2, 3).unwrap();
        let m = Node::matrix(dmatrix![1.0, 2.0; -1.0, 0.5]);
        let mut trees = vec![
            logistic(),
            Node::divide(
                Node::add(a.clone(), Node::scalar(0.0)).unwrap(),
                Node::add(Node::time(), Node::scalar(2.0)).unwrap(),
            )
            .unwrap(),
            Node::matmul(m, Node::mul(a.clone(), Node::scalar(1.0)).unwrap()).unwrap(),
            Node::pow(b.clone(), Node::time()).unwrap(),
            Node::concatenate(vec![
                a.clone(),
                Node::negate(Node::negate(b.clone()).unwrap()).unwrap(),
                Node::sub(Node::time(), Node::scalar(0.0)).unwrap(),
            ])
            .unwrap(),
            Node::diag(Node::mul(a.clone(), Node::scalar(0.0)).unwrap()).unwrap(),
        ];
        for kind in UnaryKind::iter().filter(|k| k.is_elementwise()) {
            let inner = Node::mul(Node::scalar(0.25), b.clone()).unwrap();
            trees.push(Node::unary(kind, inner).unwrap());
        }
        trees
    }

    fn state() -> DVector<f64> {
        dvector![0.6, -0.3, 1.4]
    }

    fn assert_values_close(a: &Value, b: &Value) {
        assert_eq!(a.shape(), b.shape());
        let (a, b) = (a.to_dmatrix(), b.to_dmatrix());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_relative_eq!(*x, *y, epsilon = 1e-12, max_relative = 1e-12);
        }
    }

    //___________________________________SCENARIOS____________________________________

    #[test]
    fn scenario_evaluate_logistic() {
        let value = logistic().evaluate(1.0, &dvector![2.0]).unwrap();
        assert_eq!(value, Value::Scalar(-3.0));
    }

    #[test]
    fn scenario_time_derivative() {
        let derivative = logistic()
            .differentiate(&Node::time())
            .unwrap()
            .simplify()
            .unwrap();
        assert_eq!(derivative, Node::scalar(1.0));
        let value = derivative.evaluate(1.0, &dvector![2.0]).unwrap();
        assert_eq!(value.as_scalar(), Some(1.0));
    }

    #[test]
    fn scenario_parameter_substitution() {
        let substituted = diffusion().substitute_parameters(&table(&[("D", 2.0)])).unwrap();
        let expected = Node::mul(
            Node::scalar(2.0),
            Node::divergence(Node::gradient(Node::variable("c", ["neg"])).unwrap()).unwrap(),
        )
        .unwrap();
        assert_eq!(substituted, expected);
        assert!(!substituted.has_parameters());
        assert_eq!(
            substituted.variable_names().into_iter().collect::<Vec<_>>(),
            vec!["c"]
        );
    }

    #[test]
    fn scenario_discretise_diffusion() {
        let n = 40;
        let m = laplacian(n);
        let slices = SliceTable::from_sizes([("c", n)]).unwrap();
        let mut operators = SpatialOperatorTable::new();
        operators.insert(SpatialOperator::Laplacian, domain(["neg"]), m.clone());

        let lowered = diffusion()
            .substitute_parameters(&table(&[("D", 2.0)]))
            .unwrap()
            .discretize(&slices, &operators)
            .unwrap();
        let expected = Node::mul(
            Node::scalar(2.0),
            Node::matmul(Node::matrix(m.clone()), Node::state_vector(0, n).unwrap()).unwrap(),
        )
        .unwrap();
        assert_eq!(lowered, expected);

        let y = DVector::from_fn(n, |i, _| (0.3 * i as f64).sin());
        let value = lowered.evaluate(0.0, &y).unwrap().to_dvector();
        let independent = 2.0 * (&m * &y);
        for (a, b) in value.iter().zip(independent.iter()) {
            assert_relative_eq!(*a, *b, epsilon = 1e-12);
        }
    }

    #[test]
    fn unresolved_parameter_never_evaluates() {
        let expr = Node::add(Node::parameter("k"), Node::time()).unwrap();
        assert!(matches!(
            expr.evaluate(0.0, &dvector![]),
            Err(ExprError::UnresolvedSymbol(_))
        ));
        assert!(matches!(
            diffusion().evaluate(0.0, &DVector::zeros(40)),
            Err(ExprError::UnresolvedSymbol(_))
        ));
    }

    #[test]
    fn short_state_vector_is_rejected() {
        let expr = Node::state_vector(2, 5).unwrap();
        assert_eq!(
            expr.evaluate(0.0, &dvector![1.0, 2.0, 3.0]).unwrap_err(),
            ExprError::IndexOutOfRange {
                start: 2,
                end: 5,
                len: 3
            }
        );
    }

    //___________________________________PROPERTIES____________________________________

    #[test]
    fn evaluation_is_deterministic() {
        let y = state();
        let bits = |v: &Value| v.to_dmatrix().iter().map(|x| x.to_bits()).collect::<Vec<_>>();
        for tree in sample_trees() {
            let first = tree.evaluate(0.8, &y).unwrap();
            for _ in 0..3 {
                let again = tree.evaluate(0.8, &y).unwrap();
                assert_eq!(bits(&first), bits(&again), "{}", tree);
            }
        }
    }

    #[test]
    fn simplify_is_idempotent_and_keeps_shape() {
        for tree in sample_trees() {
            let once = tree.simplify().unwrap();
            assert_eq!(once.simplify().unwrap(), once, "{}", tree);
            assert_eq!(once.shape(), tree.shape(), "{}", tree);
            assert!(once.node_count() <= tree.node_count());
        }
    }

    #[test]
    fn simplify_preserves_semantics() {
        let y = state();
        for tree in sample_trees() {
            let before = tree.evaluate(0.8, &y).unwrap();
            let after = tree.simplify().unwrap().evaluate(0.8, &y).unwrap();
            assert_values_close(&before, &after);
        }
    }

    #[test]
    fn derivatives_match_finite_differences() {
        let y = state();
        let targets = [
            Node::time(),
            Node::state_vector(0, 2).unwrap(),
            Node::state_vector(2, 3).unwrap(),
        ];
        for tree in sample_trees() {
            for target in &targets {
                let (err, ok) = tree
                    .compare_with_finite_difference(target, 0.8, &y, 1e-6, 1e-5)
                    .unwrap();
                assert!(ok, "d/d{} of {} off by {}", target, tree, err);
            }
        }
    }

    #[test]
    fn lowering_removes_every_symbol() {
        let n = 8;
        let slices = SliceTable::from_sizes([("c", n), ("T", 1)]).unwrap();
        let mut operators = SpatialOperatorTable::new();
        let g = DMatrix::from_fn(n - 1, n, |i, j| {
            if j == i + 1 {
                1.0
            } else if j == i {
                -1.0
            } else {
                0.0
            }
        });
        operators.insert(SpatialOperator::Divergence, domain(["neg"]), -g.transpose());
        operators.insert(SpatialOperator::Gradient, domain(["neg"]), g);
        let heat = Node::mul(
            Node::parameter("h"),
            Node::sub(Node::variable("T", Vec::<String>::new()), Node::parameter("T_amb")).unwrap(),
        )
        .unwrap();
        let trees = vec![
            diffusion(),
            Node::add(
                Node::mul(Node::exp(Node::parameter("E")).unwrap(), Node::variable("c", ["neg"]))
                    .unwrap(),
                Node::laplacian(Node::variable("c", ["neg"])).unwrap(),
            )
            .unwrap(),
            heat,
        ];
        let parameters = table(&[("D", 1.5), ("E", -0.2), ("h", 10.0), ("T_amb", 300.0)]);
        for tree in trees {
            let lowered = tree
                .substitute_parameters(&parameters)
                .unwrap()
                .discretize(&slices, &operators)
                .unwrap();
            let symbols = lowered
                .pre_order()
                .into_iter()
                .filter(|n| matches!(n, Node::Parameter(_) | Node::Variable(_)))
                .count();
            assert_eq!(symbols, 0, "{}", lowered);
            assert!(!lowered.has_unresolved());
            assert!(lowered.evaluate(0.0, &DVector::from_element(n + 1, 1.0)).is_ok());
        }
    }

    #[test]
    fn domainless_variable_scales_a_field() {
        // dc/dt = T * c, dT/dt = h * (T_amb - T)
        let n = 4;
        let temperature = || Node::variable("T", Vec::<String>::new());
        let equations = vec![
            Node::mul(temperature(), Node::variable("c", ["neg"])).unwrap(),
            Node::mul(
                Node::parameter("h"),
                Node::sub(Node::parameter("T_amb"), temperature()).unwrap(),
            )
            .unwrap(),
        ];
        let slices = SliceTable::from_sizes([("c", n), ("T", 1)]).unwrap();
        let config = LoweringConfig {
            jacobian: true,
            ..LoweringConfig::default()
        };
        let model = Lowering::new(config)
            .lower(
                &equations,
                &table(&[("h", 0.5), ("T_amb", 3.0)]),
                &slices,
                &SpatialOperatorTable::new(),
            )
            .unwrap();
        assert_eq!(model.state_len, n + 1);

        let y = dvector![1.0, 2.0, 3.0, 4.0, 2.0];
        let rhs = model.evaluate_rhs(0.0, &y).unwrap();
        assert_eq!(rhs, dvector![2.0, 4.0, 6.0, 8.0, 0.5]);
        let jacobian = model.evaluate_jacobian(0.0, &y).unwrap();
        let expected = dmatrix![
            2.0, 0.0, 0.0, 0.0, 1.0;
            0.0, 2.0, 0.0, 0.0, 2.0;
            0.0, 0.0, 2.0, 0.0, 3.0;
            0.0, 0.0, 0.0, 2.0, 4.0;
            0.0, 0.0, 0.0, 0.0, -0.5
        ];
        for (a, b) in jacobian.iter().zip(expected.iter()) {
            assert_relative_eq!(*a, *b, epsilon = 1e-12);
        }
    }

    #[test]
    fn deep_model_lowers_and_differentiates() {
        // a long chain of relaxations, as generated by a model assembler
        let mut rhs = Node::variable("c", ["neg"]);
        while rhs.depth() + 2 <= MAX_DIFFERENTIABLE_DEPTH {
            rhs = Node::mul(Node::parameter("k"), Node::sin(rhs).unwrap()).unwrap();
        }
        let n = 3;
        let slices = SliceTable::from_sizes([("c", n)]).unwrap();
        let lowered = rhs
            .substitute_parameters(&table(&[("k", 0.9)]))
            .unwrap()
            .discretize(&slices, &SpatialOperatorTable::new())
            .unwrap();
        let simplified = lowered.simplify().unwrap();
        assert_eq!(simplified, lowered);
        let whole = Node::state_vector(0, n).unwrap();
        let y = dvector![0.2, -0.4, 0.9];
        let (err, ok) = lowered
            .compare_with_finite_difference(&whole, 0.0, &y, 1e-6, 1e-6)
            .unwrap();
        assert!(ok, "deep chain derivative off by {}", err);
        let jacobian = lowered
            .jacobian(&StateVectorSlice::new(0, n).unwrap())
            .unwrap();
        assert!(jacobian.depth() <= MAX_TREE_DEPTH);
        let diagonal = jacobian.evaluate(0.0, &y).unwrap().to_dmatrix();
        let along_ones = lowered
            .differentiate(&whole)
            .unwrap()
            .evaluate(0.0, &y)
            .unwrap()
            .to_dvector();
        for i in 0..n {
            assert_relative_eq!(diagonal.row(i).sum(), along_ones[i], epsilon = 1e-12);
        }
    }

    #[test]
    fn discretising_before_substitution_is_rejected() {
        let slices = SliceTable::from_sizes([("c", 4)]).unwrap();
        assert!(matches!(
            diffusion().discretize(&slices, &SpatialOperatorTable::new()),
            Err(ExprError::PassOrder(_))
        ));
    }

    //___________________________________CONCURRENCY____________________________________

    #[test]
    fn shared_tree_evaluates_on_many_threads() {
        let tree = Arc::new(
            Node::add(
                Node::sin(Node::state_vector(0, 3).unwrap()).unwrap(),
                Node::mul(Node::time(), Node::state_vector(0, 3).unwrap()).unwrap(),
            )
            .unwrap(),
        );
        let y = Arc::new(state());
        let expected = tree.evaluate(0.5, &y).unwrap();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let (tree, y) = (Arc::clone(&tree), Arc::clone(&y));
                thread::spawn(move || tree.evaluate(0.5, &y).unwrap())
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), expected);
        }
    }

    #[test]
    fn parallel_and_cached_evaluation_agree() {
        let y = state();
        let trees = sample_trees();
        let parallel = evaluate_many(&trees, 0.8, &y).unwrap();
        let mut known = KnownEvals::new(0.8, &y);
        for (tree, value) in trees.iter().zip(parallel.iter()) {
            assert_eq!(&tree.evaluate(0.8, &y).unwrap(), value);
            assert_eq!(&known.evaluate(tree).unwrap(), value);
        }
        // every elementwise tree shares 0.25 * y[2:3]
        assert!(known.hits() > 0);
    }
}
