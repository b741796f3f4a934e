use crate::cpa_metrics::tensor_to_array2;
use candle_core::{DType, Tensor};
use log::{debug, warn};
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

const MAX_FOLDS: usize = 5;

/// Per-label balanced accuracies of linear classifiers on the basal and
/// the combined latent codes. Lower basal scores mean better
/// disentanglement.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DisentanglementScores {
    pub basal: BTreeMap<String, f32>,
    pub combined: BTreeMap<String, f32>,
    pub basal_mean: f32,
    pub combined_mean: f32,
}

/// Zero mean, unit variance columns; constant columns are only centred
pub fn standardize(x_nd: &Array2<f32>) -> Array2<f32> {
    let nn = x_nd.nrows().max(1) as f32;
    let mean = x_nd.sum_axis(Axis(0)) / nn;
    let centred = x_nd - &mean;
    let std = centred
        .mapv(|v| v * v)
        .sum_axis(Axis(0))
        .mapv(|s| {
            let sd = (s / nn).sqrt();
            if sd > 0. {
                sd
            } else {
                1.
            }
        });
    centred / &std
}

/// Stratified folds: indices of each class are shuffled and dealt out
/// round-robin, so every fold gets a share of every class.
///
/// # Returns `(train, test)` index sets
pub fn stratified_folds(
    labels: &[usize],
    n_folds: usize,
    rng: &mut StdRng,
) -> Vec<(Vec<usize>, Vec<usize>)> {
    let mut by_class: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (i, &y) in labels.iter().enumerate() {
        by_class.entry(y).or_default().push(i);
    }

    let mut fold_of = vec![0; labels.len()];
    let mut next = 0;
    for members in by_class.values_mut() {
        members.shuffle(rng);
        for &i in members.iter() {
            fold_of[i] = next % n_folds;
            next += 1;
        }
    }

    (0..n_folds)
        .map(|k| {
            let (test, train): (Vec<usize>, Vec<usize>) =
                (0..labels.len()).partition(|&i| fold_of[i] == k);
            (train, test)
        })
        .filter(|(train, test)| !train.is_empty() && !test.is_empty())
        .collect()
}

/// Mean recall over the classes present in `y_true`
pub fn balanced_accuracy(y_true: &[usize], y_pred: &[usize]) -> f32 {
    let mut hits: BTreeMap<usize, (usize, usize)> = BTreeMap::new();
    for (&t, &p) in y_true.iter().zip(y_pred.iter()) {
        let entry = hits.entry(t).or_default();
        entry.1 += 1;
        if t == p {
            entry.0 += 1;
        }
    }
    if hits.is_empty() {
        return 0.;
    }
    let recall_sum: f32 = hits.values().map(|&(hit, total)| hit as f32 / total as f32).sum();
    recall_sum / hits.len() as f32
}

/// Multinomial logistic regression fitted by full-batch gradient descent
/// with a small ridge penalty
pub struct SoftmaxRegression {
    weights_dk: Array2<f32>,
    bias_k: Array1<f32>,
}

impl SoftmaxRegression {
    pub fn fit(
        x_nd: &Array2<f32>,
        y_n: &[usize],
        n_classes: usize,
        learning_rate: f32,
        l2: f32,
        max_iter: usize,
    ) -> Self {
        let (nn, dd) = x_nd.dim();
        let mut model = Self {
            weights_dk: Array2::zeros((dd, n_classes)),
            bias_k: Array1::zeros(n_classes),
        };

        let mut onehot_nk = Array2::<f32>::zeros((nn, n_classes));
        for (i, &y) in y_n.iter().enumerate() {
            onehot_nk[(i, y)] = 1.;
        }
        let scale = 1. / nn.max(1) as f32;

        for _ in 0..max_iter {
            let resid_nk = model.predict_proba(x_nd) - &onehot_nk;
            let grad_w = x_nd.t().dot(&resid_nk) * scale + &model.weights_dk * l2;
            let grad_b = resid_nk.sum_axis(Axis(0)) * scale;
            model.weights_dk.scaled_add(-learning_rate, &grad_w);
            model.bias_k.scaled_add(-learning_rate, &grad_b);
        }
        model
    }

    pub fn predict_proba(&self, x_nd: &Array2<f32>) -> Array2<f32> {
        let mut prob_nk = x_nd.dot(&self.weights_dk) + &self.bias_k;
        for mut row in prob_nk.rows_mut() {
            let max = row.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
            row.mapv_inplace(|v| (v - max).exp());
            let denom = row.sum();
            row /= denom;
        }
        prob_nk
    }

    pub fn predict(&self, x_nd: &Array2<f32>) -> Vec<usize> {
        self.predict_proba(x_nd)
            .rows()
            .into_iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .fold((0, f32::NEG_INFINITY), |(k_max, v_max), (k, &v)| {
                        if v > v_max {
                            (k, v)
                        } else {
                            (k_max, v_max)
                        }
                    })
                    .0
            })
            .collect()
    }
}

/// Cross-validated linear classifiers on latent codes
pub struct DisentanglementEvaluator {
    seed: u64,
    learning_rate: f32,
    l2: f32,
    max_iter: usize,
}

impl DisentanglementEvaluator {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            learning_rate: 0.5,
            l2: 1e-3,
            max_iter: 300,
        }
    }

    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    /// Mean balanced accuracy over stratified folds, `None` if fewer
    /// than two classes are present
    ///
    /// * `x_nd` - standardized features
    /// * `labels` - arbitrary integer labels
    pub fn cross_validate(&self, x_nd: &Array2<f32>, labels: &[u32]) -> Option<f32> {
        let classes: BTreeSet<u32> = labels.iter().copied().collect();
        if classes.len() < 2 {
            return None;
        }
        let class_index: BTreeMap<u32, usize> =
            classes.iter().enumerate().map(|(k, &c)| (c, k)).collect();
        let y_n: Vec<usize> = labels.iter().map(|c| class_index[c]).collect();
        let n_classes = classes.len();

        let n_folds = MAX_FOLDS.min(n_classes);
        let mut rng = StdRng::seed_from_u64(self.seed);
        let folds = stratified_folds(&y_n, n_folds, &mut rng);
        if folds.is_empty() {
            return None;
        }

        let scores: Vec<f32> = folds
            .par_iter()
            .map(|(train, test)| {
                let x_train = x_nd.select(Axis(0), train);
                let y_train: Vec<usize> = train.iter().map(|&i| y_n[i]).collect();
                let model = SoftmaxRegression::fit(
                    &x_train,
                    &y_train,
                    n_classes,
                    self.learning_rate,
                    self.l2,
                    self.max_iter,
                );
                let y_pred = model.predict(&x_nd.select(Axis(0), test));
                let y_test: Vec<usize> = test.iter().map(|&i| y_n[i]).collect();
                balanced_accuracy(&y_test, &y_pred)
            })
            .collect();

        debug!("{} folds, {} classes, scores {:?}", scores.len(), n_classes, scores);
        Some(scores.iter().sum::<f32>() / scores.len() as f32)
    }

    /// Score every label on both latent codes
    ///
    /// * `latent_basal` - basal codes (n x k)
    /// * `latent` - combined codes (n x k)
    /// * `labels` - `(name, n labels)`
    pub fn evaluate(
        &self,
        latent_basal: &Tensor,
        latent: &Tensor,
        labels: &[(String, Tensor)],
    ) -> anyhow::Result<DisentanglementScores> {
        let basal_nk = standardize(&tensor_to_array2(latent_basal)?);
        let combined_nk = standardize(&tensor_to_array2(latent)?);
        if basal_nk.dim() != combined_nk.dim() {
            anyhow::bail!(
                "basal {:?} and combined {:?} codes differ in shape",
                basal_nk.dim(),
                combined_nk.dim()
            );
        }

        let mut scores = DisentanglementScores::default();
        for (name, y) in labels.iter() {
            let y: Vec<u32> = y.flatten_all()?.to_dtype(DType::U32)?.to_vec1()?;
            if y.len() != basal_nk.nrows() {
                anyhow::bail!("{} labels of '{}' for {} cells", y.len(), name, basal_nk.nrows());
            }
            match (self.cross_validate(&basal_nk, &y), self.cross_validate(&combined_nk, &y)) {
                (Some(basal), Some(combined)) => {
                    scores.basal.insert(name.clone(), basal);
                    scores.combined.insert(name.clone(), combined);
                }
                _ => debug!("skip '{}': fewer than two distinct labels", name),
            }
        }

        if scores.basal.is_empty() {
            warn!("no label had two or more distinct values");
        } else {
            let n = scores.basal.len() as f32;
            scores.basal_mean = scores.basal.values().sum::<f32>() / n;
            scores.combined_mean = scores.combined.values().sum::<f32>() / n;
        }
        Ok(scores)
    }
}
