//! Forêt aléatoire d'arbres CART (critère de Gini)

use super::metrics::CLASS_COUNT;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct ForestParams {
    pub n_trees: usize,
    pub max_depth: usize,
    pub min_samples_split: usize,
}

/// Meilleure coupure trouvée sur un nœud
struct Split {
    feature: usize,
    threshold: f64,
    impurity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TreeNode {
    Leaf {
        probabilities: [f64; CLASS_COUNT],
    },
    Internal {
        feature: usize,
        threshold: f64,
        left: Box<TreeNode>,
        right: Box<TreeNode>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTree {
    root: TreeNode,
}

fn class_counts(y: &[usize], indices: &[usize]) -> [usize; CLASS_COUNT] {
    let mut counts = [0usize; CLASS_COUNT];
    for &i in indices {
        counts[y[i]] += 1;
    }
    counts
}

fn gini(counts: &[usize; CLASS_COUNT], total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    1.0 - counts
        .iter()
        .map(|&c| {
            let p = c as f64 / total as f64;
            p * p
        })
        .sum::<f64>()
}

impl DecisionTree {
    pub fn fit(x: &[Vec<f64>], y: &[usize], indices: &[usize], params: &ForestParams, rng: &mut StdRng) -> Self {
        let n_features = x.first().map(Vec::len).unwrap_or(0);
        let max_features = ((n_features as f64).sqrt().floor() as usize).max(1);
        Self {
            root: Self::build(x, y, indices, 0, max_features, params, rng),
        }
    }

    fn leaf(counts: &[usize; CLASS_COUNT], total: usize) -> TreeNode {
        let mut probabilities = [0.0; CLASS_COUNT];
        if total > 0 {
            for (p, &c) in probabilities.iter_mut().zip(counts) {
                *p = c as f64 / total as f64;
            }
        }
        TreeNode::Leaf { probabilities }
    }

    fn build(
        x: &[Vec<f64>],
        y: &[usize],
        indices: &[usize],
        depth: usize,
        max_features: usize,
        params: &ForestParams,
        rng: &mut StdRng,
    ) -> TreeNode {
        let counts = class_counts(y, indices);
        let pure = counts.iter().filter(|&&c| c > 0).count() <= 1;
        if pure || depth >= params.max_depth || indices.len() < params.min_samples_split.max(2) {
            return Self::leaf(&counts, indices.len());
        }

        let n_features = x[indices[0]].len();
        let mut order: Vec<usize> = (0..n_features).collect();
        order.shuffle(rng);

        // Au-delà du sous-ensemble tiré, on continue tant qu'aucune coupure n'est valide
        let mut best: Option<Split> = None;
        for (rank, &feature) in order.iter().enumerate() {
            if rank >= max_features && best.is_some() {
                break;
            }
            if let Some(split) = Self::best_split(x, y, indices, feature) {
                if best.as_ref().map_or(true, |b| split.impurity < b.impurity) {
                    best = Some(split);
                }
            }
        }

        let split = match best {
            Some(split) => split,
            None => return Self::leaf(&counts, indices.len()),
        };

        let (left, right): (Vec<usize>, Vec<usize>) =
            indices.iter().copied().partition(|&i| x[i][split.feature] <= split.threshold);

        TreeNode::Internal {
            feature: split.feature,
            threshold: split.threshold,
            left: Box::new(Self::build(x, y, &left, depth + 1, max_features, params, rng)),
            right: Box::new(Self::build(x, y, &right, depth + 1, max_features, params, rng)),
        }
    }

    /// Coupure de Gini minimale sur une caractéristique, seuils aux milieux
    fn best_split(x: &[Vec<f64>], y: &[usize], indices: &[usize], feature: usize) -> Option<Split> {
        let mut sorted: Vec<usize> = indices.to_vec();
        sorted.sort_by(|&a, &b| x[a][feature].total_cmp(&x[b][feature]));

        let total = sorted.len();
        let mut right_counts = class_counts(y, &sorted);
        let mut left_counts = [0usize; CLASS_COUNT];
        let mut best: Option<Split> = None;

        for pos in 0..total - 1 {
            let class = y[sorted[pos]];
            left_counts[class] += 1;
            right_counts[class] -= 1;

            let current = x[sorted[pos]][feature];
            let next = x[sorted[pos + 1]][feature];
            if next <= current {
                continue;
            }

            let left_n = pos + 1;
            let right_n = total - left_n;
            let impurity = (left_n as f64 * gini(&left_counts, left_n)
                + right_n as f64 * gini(&right_counts, right_n))
                / total as f64;

            if best.as_ref().map_or(true, |b| impurity < b.impurity) {
                best = Some(Split {
                    feature,
                    threshold: current + (next - current) / 2.0,
                    impurity,
                });
            }
        }
        best
    }

    pub fn predict_proba(&self, sample: &[f64]) -> [f64; CLASS_COUNT] {
        let mut node = &self.root;
        loop {
            match node {
                TreeNode::Leaf { probabilities } => return *probabilities,
                TreeNode::Internal {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    let value = sample.get(*feature).copied().unwrap_or(0.0);
                    node = if value <= *threshold { left } else { right };
                }
            }
        }
    }

    pub fn depth(&self) -> usize {
        fn walk(node: &TreeNode) -> usize {
            match node {
                TreeNode::Leaf { .. } => 0,
                TreeNode::Internal { left, right, .. } => 1 + walk(left).max(walk(right)),
            }
        }
        walk(&self.root)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForest {
    pub feature_names: Vec<String>,
    trees: Vec<DecisionTree>,
}

impl RandomForest {
    /// Ajuste la forêt ; chaque arbre voit un échantillon bootstrap
    pub fn fit(
        feature_names: Vec<String>,
        x: &[Vec<f64>],
        y: &[usize],
        params: &ForestParams,
        rng: &mut StdRng,
    ) -> Self {
        let n = x.len();
        let mut trees = Vec::with_capacity(params.n_trees);
        if n > 0 {
            for _ in 0..params.n_trees.max(1) {
                let bootstrap: Vec<usize> = (0..n).map(|_| rng.random_range(0..n)).collect();
                trees.push(DecisionTree::fit(x, y, &bootstrap, params, rng));
            }
        }
        Self { feature_names, trees }
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    /// Moyenne des probabilités des arbres
    pub fn predict_proba(&self, sample: &[f64]) -> [f64; CLASS_COUNT] {
        let mut sum = [0.0; CLASS_COUNT];
        if self.trees.is_empty() {
            return sum;
        }
        for tree in &self.trees {
            for (s, p) in sum.iter_mut().zip(tree.predict_proba(sample)) {
                *s += p;
            }
        }
        sum.map(|s| s / self.trees.len() as f64)
    }

    /// Classe la plus probable, égalité en faveur de la classe 0
    pub fn predict(&self, sample: &[f64]) -> usize {
        let proba = self.predict_proba(sample);
        let mut best = 0;
        for class in 1..CLASS_COUNT {
            if proba[class] > proba[best] {
                best = class;
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn params() -> ForestParams {
        ForestParams {
            n_trees: 25,
            max_depth: 8,
            min_samples_split: 2,
        }
    }

    fn dataset() -> (Vec<Vec<f64>>, Vec<usize>) {
        // Caractéristiques 0 et 2 informatives, 1 constante
        let x = vec![
            vec![0.1, 1.0, 3.0],
            vec![0.2, 1.0, 3.5],
            vec![0.3, 1.0, 4.0],
            vec![5.0, 1.0, 8.0],
            vec![6.0, 1.0, 9.0],
            vec![7.0, 1.0, 10.0],
        ];
        (x, vec![0, 0, 0, 1, 1, 1])
    }

    #[test]
    fn test_tree_separates_classes() {
        let (x, y) = dataset();
        let indices: Vec<usize> = (0..x.len()).collect();
        let mut rng = StdRng::seed_from_u64(1);
        let tree = DecisionTree::fit(&x, &y, &indices, &params(), &mut rng);

        for (sample, &class) in x.iter().zip(&y) {
            assert_eq!(tree.predict_proba(sample)[class], 1.0);
        }
        assert!(tree.depth() >= 1);
    }

    #[test]
    fn test_constant_features_give_a_leaf() {
        let x = vec![vec![1.0], vec![1.0]];
        let y = vec![0, 1];
        let mut rng = StdRng::seed_from_u64(1);
        let tree = DecisionTree::fit(&x, &y, &[0, 1], &params(), &mut rng);
        assert_eq!(tree.depth(), 0);
        assert_eq!(tree.predict_proba(&[1.0]), [0.5, 0.5]);
    }

    #[test]
    fn test_forest_is_deterministic_for_a_seed() {
        let (x, y) = dataset();
        let names = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let first = RandomForest::fit(names.clone(), &x, &y, &params(), &mut StdRng::seed_from_u64(42));
        let second = RandomForest::fit(names, &x, &y, &params(), &mut StdRng::seed_from_u64(42));

        assert_eq!(first, second);
        assert_eq!(first.n_trees(), 25);
        assert_eq!(first.predict(&[0.15, 1.0, 3.2]), 0);
        assert_eq!(first.predict(&[6.5, 1.0, 9.5]), 1);
    }
}
