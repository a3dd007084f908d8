//! Isolation Forest
//!
//! Les anomalies sont isolées en moins de coupures aléatoires : leur chemin
//! moyen dans les arbres est plus court. Le score suit `2^(-E[h(x)] / c(ψ))`.

use rand::rngs::StdRng;
use rand::seq::index;
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct IsolationParams {
    pub n_trees: usize,
    pub sample_size: usize,
    /// Proportion attendue d'anomalies
    pub contamination: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum IsolationNode {
    Leaf {
        size: usize,
    },
    Internal {
        feature: usize,
        split_value: f64,
        left: Box<IsolationNode>,
        right: Box<IsolationNode>,
    },
}

/// Longueur moyenne d'un chemin infructueux dans un arbre binaire de n points, c(n)
fn average_path_length(n: usize) -> f64 {
    if n <= 1 {
        return 0.0;
    }
    let n = n as f64;
    2.0 * ((n - 1.0).ln() + 0.5772156649) - 2.0 * (n - 1.0) / n
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct IsolationTree {
    root: IsolationNode,
}

impl IsolationTree {
    fn build(samples: &[&[f64]], max_depth: usize, rng: &mut StdRng) -> Self {
        Self {
            root: Self::build_node(samples, 0, max_depth, rng),
        }
    }

    fn build_node(samples: &[&[f64]], depth: usize, max_depth: usize, rng: &mut StdRng) -> IsolationNode {
        let n_features = samples.first().map(|s| s.len()).unwrap_or(0);
        if depth >= max_depth || samples.len() <= 1 || n_features == 0 {
            return IsolationNode::Leaf { size: samples.len() };
        }

        let feature = rng.random_range(0..n_features);
        let (min_val, max_val) = samples.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), s| {
            (lo.min(s[feature]), hi.max(s[feature]))
        });

        // Toutes les valeurs identiques : rien à isoler sur cette caractéristique
        if max_val <= min_val {
            return IsolationNode::Leaf { size: samples.len() };
        }

        let split_value = rng.random_range(min_val..max_val);
        let (left, right): (Vec<&[f64]>, Vec<&[f64]>) = samples.iter().copied().partition(|s| s[feature] < split_value);

        IsolationNode::Internal {
            feature,
            split_value,
            left: Box::new(Self::build_node(&left, depth + 1, max_depth, rng)),
            right: Box::new(Self::build_node(&right, depth + 1, max_depth, rng)),
        }
    }

    fn path_length(&self, sample: &[f64]) -> f64 {
        let mut node = &self.root;
        let mut depth = 0usize;
        loop {
            match node {
                IsolationNode::Leaf { size } => return depth as f64 + average_path_length(*size),
                IsolationNode::Internal {
                    feature,
                    split_value,
                    left,
                    right,
                } => {
                    let value = sample.get(*feature).copied().unwrap_or(0.0);
                    node = if value < *split_value { left } else { right };
                    depth += 1;
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationForest {
    pub feature_names: Vec<String>,
    trees: Vec<IsolationTree>,
    /// Taille effective du sous-échantillon (ψ)
    sample_size: usize,
    normalizer: f64,
    pub contamination: f64,
    /// Plus petit score considéré anomal sur les données d'ajustement
    pub threshold: f64,
}

impl IsolationForest {
    pub fn fit(feature_names: Vec<String>, x: &[Vec<f64>], params: &IsolationParams, rng: &mut StdRng) -> Self {
        let n = x.len();
        let sample_size = params.sample_size.clamp(1, n.max(1));
        let max_depth = (sample_size as f64).log2().ceil().max(1.0) as usize;

        let mut trees = Vec::with_capacity(params.n_trees);
        if n > 0 {
            for _ in 0..params.n_trees.max(1) {
                let sample: Vec<&[f64]> = index::sample(rng, n, sample_size)
                    .into_iter()
                    .map(|i| x[i].as_slice())
                    .collect();
                trees.push(IsolationTree::build(&sample, max_depth, rng));
            }
        }

        let mut forest = Self {
            feature_names,
            trees,
            sample_size,
            normalizer: average_path_length(sample_size),
            contamination: params.contamination.clamp(0.0, 0.5),
            threshold: 1.0,
        };

        let scores: Vec<f64> = x.iter().map(|sample| forest.score(sample)).collect();
        let flagged = forest.flag_top(&scores);
        forest.threshold = scores
            .iter()
            .zip(&flagged)
            .filter(|(_, f)| **f)
            .map(|(&s, _)| s)
            .fold(1.0, f64::min);
        forest
    }

    /// Score d'anomalie dans [0, 1], plus élevé = plus anomal
    pub fn score(&self, sample: &[f64]) -> f64 {
        if self.trees.is_empty() || self.normalizer == 0.0 {
            return 0.5;
        }
        let total: f64 = self.trees.iter().map(|t| t.path_length(sample)).sum();
        let avg_path = total / self.trees.len() as f64;
        2.0_f64.powf(-avg_path / self.normalizer)
    }

    /// Marque exactement round(contamination·n) points, les scores les plus hauts d'abord
    pub fn flag_top(&self, scores: &[f64]) -> Vec<bool> {
        let k = ((self.contamination * scores.len() as f64).round() as usize).min(scores.len());
        let mut order: Vec<usize> = (0..scores.len()).collect();
        // Tri stable : à score égal, l'ordre de la table est conservé
        order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

        let mut flagged = vec![false; scores.len()];
        for &i in order.iter().take(k) {
            flagged[i] = true;
        }
        flagged
    }

    pub fn predict(&self, sample: &[f64]) -> bool {
        self.score(sample) >= self.threshold
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn sample_size(&self) -> usize {
        self.sample_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn data() -> Vec<Vec<f64>> {
        let mut x: Vec<Vec<f64>> = (0..40)
            .map(|i| vec![10.0 + (i % 5) as f64 * 0.1, 20.0 + (i % 7) as f64 * 0.1])
            .collect();
        x.push(vec![95.0, -40.0]);
        x
    }

    fn params(contamination: f64) -> IsolationParams {
        IsolationParams {
            n_trees: 50,
            sample_size: 32,
            contamination,
        }
    }

    #[test]
    fn test_average_path_length() {
        assert_eq!(average_path_length(1), 0.0);
        assert!((average_path_length(2) - (2.0 * 0.5772156649 - 1.0)).abs() < 1e-12);
        assert!(average_path_length(256) > average_path_length(16));
    }

    #[test]
    fn test_outlier_scores_highest() {
        let x = data();
        let forest = IsolationForest::fit(vec![], &x, &params(0.05), &mut StdRng::seed_from_u64(3));
        let outlier = forest.score(&x[40]);
        for sample in &x[..40] {
            assert!(forest.score(sample) < outlier);
        }
        assert!(forest.predict(&x[40]));
    }

    #[test]
    fn test_contamination_sets_flag_count() {
        let x = data();
        let forest = IsolationForest::fit(vec![], &x, &params(0.1), &mut StdRng::seed_from_u64(3));
        let scores: Vec<f64> = x.iter().map(|s| forest.score(s)).collect();
        let flagged = forest.flag_top(&scores);
        // round(0.1 × 41) = 4
        assert_eq!(flagged.iter().filter(|&&f| f).count(), 4);
        assert!(flagged[40]);
    }

    #[test]
    fn test_seeded_fit_is_reproducible() {
        let x = data();
        let a = IsolationForest::fit(vec![], &x, &params(0.1), &mut StdRng::seed_from_u64(9));
        let b = IsolationForest::fit(vec![], &x, &params(0.1), &mut StdRng::seed_from_u64(9));
        assert_eq!(a, b);
    }

    #[test]
    fn test_zero_contamination_flags_nothing() {
        let x = data();
        let forest = IsolationForest::fit(vec![], &x, &params(0.0), &mut StdRng::seed_from_u64(1));
        let scores: Vec<f64> = x.iter().map(|s| forest.score(s)).collect();
        assert!(forest.flag_top(&scores).iter().all(|f| !f));
        assert_eq!(forest.threshold, 1.0);
    }
}
