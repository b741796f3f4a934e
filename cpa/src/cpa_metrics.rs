use crate::deg_mask::DegMasks;
use candle_core::{DType, Tensor};
use log::{debug, warn};
use ndarray::{Array1, Array2, Axis};
use std::collections::BTreeMap;

const NAN_FILL: f32 = 1e2;
const NEG_INF_FILL: f32 = -1e3;
const POS_INF_FILL: f32 = 1e3;

/// R² of the per-gene mean and the per-gene variance
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct R2Scores {
    pub r2_mean: f32,
    pub r2_var: f32,
}

/// R² averaged over cell categories, on every gene and on each
/// category's DEGs
#[derive(Clone, Debug, PartialEq)]
pub struct DegR2Scores {
    pub all: R2Scores,
    pub deg: R2Scores,
    pub top_deg: R2Scores,
    /// categories that contributed to the averages
    pub categories: Vec<String>,
}

/// Coefficient of determination
///
/// `1 - sum (t - p)^2 / sum (t - mean(t))^2`; a constant target gives 1
/// for a perfect prediction and 0 otherwise.
pub fn r2_score(y_true: &Array1<f32>, y_pred: &Array1<f32>) -> f32 {
    debug_assert_eq!(y_true.len(), y_pred.len());
    let y_mean = y_true.mean().unwrap_or(0.);

    let ss_res: f32 = y_true
        .iter()
        .zip(y_pred.iter())
        .map(|(t, p)| (t - p).powi(2))
        .sum();
    let ss_tot: f32 = y_true.iter().map(|t| (t - y_mean).powi(2)).sum();

    if ss_tot == 0. {
        return if ss_res == 0. { 1. } else { 0. };
    }
    1. - ss_res / ss_tot
}

/// Replace NaN and infinite values by large finite ones
pub fn sanitize(x: &mut Array2<f32>) {
    x.mapv_inplace(|v| {
        if v.is_nan() {
            NAN_FILL
        } else if v == f32::NEG_INFINITY {
            NEG_INF_FILL
        } else if v == f32::INFINITY {
            POS_INF_FILL
        } else {
            v
        }
    });
}

pub(crate) fn tensor_to_array2(x: &Tensor) -> candle_core::Result<Array2<f32>> {
    let (nn, dd) = x.dims2()?;
    let data: Vec<f32> = x.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    Array2::from_shape_vec((nn, dd), data).map_err(|e| candle_core::Error::Msg(e.to_string()))
}

/// R² between observed and predicted per-gene statistics
///
/// * `x_nd` - observed expression
/// * `mean_nd` - predicted means
/// * `var_nd` - predicted variances
/// * `gene_mask` - restrict both scores to these genes (e.g. DEGs)
///
/// The observed variance is the population variance over cells; the
/// predicted statistics are averaged over cells.
pub fn r2_metric(
    x_nd: &Tensor,
    mean_nd: &Tensor,
    var_nd: &Tensor,
    gene_mask: Option<&[bool]>,
) -> anyhow::Result<R2Scores> {
    let x = tensor_to_array2(x_nd)?;
    let pred_mean = tensor_to_array2(mean_nd)?;
    let pred_var = tensor_to_array2(var_nd)?;
    check_dims(&x, &pred_mean, &pred_var)?;
    r2_of_arrays(&x, pred_mean, pred_var, gene_mask)
}

fn check_dims(
    x: &Array2<f32>,
    pred_mean: &Array2<f32>,
    pred_var: &Array2<f32>,
) -> anyhow::Result<()> {
    if x.dim() != pred_mean.dim() || x.dim() != pred_var.dim() {
        anyhow::bail!(
            "shape mismatch: observed {:?}, mean {:?}, variance {:?}",
            x.dim(),
            pred_mean.dim(),
            pred_var.dim()
        );
    }
    Ok(())
}

fn r2_of_arrays(
    x: &Array2<f32>,
    mut pred_mean: Array2<f32>,
    mut pred_var: Array2<f32>,
    gene_mask: Option<&[bool]>,
) -> anyhow::Result<R2Scores> {
    if x.nrows() == 0 {
        anyhow::bail!("no cells");
    }

    sanitize(&mut pred_mean);
    sanitize(&mut pred_var);

    let true_mean = x.mean_axis(Axis(0)).ok_or_else(|| anyhow::anyhow!("empty"))?;
    let true_var = x.var_axis(Axis(0), 0.);
    let pred_mean = pred_mean.mean_axis(Axis(0)).ok_or_else(|| anyhow::anyhow!("empty"))?;
    let pred_var = pred_var.mean_axis(Axis(0)).ok_or_else(|| anyhow::anyhow!("empty"))?;

    let select = |v: Array1<f32>| -> anyhow::Result<Array1<f32>> {
        match gene_mask {
            Some(mask) => {
                if mask.len() != v.len() {
                    anyhow::bail!("gene mask of length {} for {} genes", mask.len(), v.len());
                }
                Ok(v.iter()
                    .zip(mask.iter())
                    .filter_map(|(x, &keep)| keep.then_some(*x))
                    .collect())
            }
            None => Ok(v),
        }
    };

    let (true_mean, pred_mean) = (select(true_mean)?, select(pred_mean)?);
    let (true_var, pred_var) = (select(true_var)?, select(pred_var)?);
    if true_mean.is_empty() {
        anyhow::bail!("gene mask selects no genes");
    }

    Ok(R2Scores {
        r2_mean: r2_score(&true_mean, &pred_mean),
        r2_var: r2_score(&true_var, &pred_var),
    })
}

/// R² within each cell category, averaged over categories
///
/// * `x_nd`, `mean_nd`, `var_nd` - as in [`r2_metric`]
/// * `masks` - per-cell DEG masks, built for `cell_categories`
/// * `cell_categories` - one category per cell, e.g. `cell_type_condition`
///
/// Each category uses its own DEG row as the gene selection. A category
/// whose DEG list names no known gene is left out of the DEG averages.
pub fn r2_metric_by_category<S: AsRef<str>>(
    x_nd: &Tensor,
    mean_nd: &Tensor,
    var_nd: &Tensor,
    masks: &DegMasks,
    cell_categories: &[S],
) -> anyhow::Result<DegR2Scores> {
    let x = tensor_to_array2(x_nd)?;
    let pred_mean = tensor_to_array2(mean_nd)?;
    let pred_var = tensor_to_array2(var_nd)?;
    check_dims(&x, &pred_mean, &pred_var)?;

    if cell_categories.len() != x.nrows() {
        anyhow::bail!("{} categories for {} cells", cell_categories.len(), x.nrows());
    }
    if masks.full.dim() != x.dim() || masks.top.dim() != x.dim() {
        anyhow::bail!(
            "DEG masks {:?}/{:?} for expression {:?}",
            masks.full.dim(),
            masks.top.dim(),
            x.dim()
        );
    }

    let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (i, cat) in cell_categories.iter().enumerate() {
        groups.entry(cat.as_ref()).or_default().push(i);
    }

    let mut all = vec![];
    let mut deg = vec![];
    let mut top_deg = vec![];
    let mut categories = vec![];

    for (cat, cells) in groups.iter() {
        let x_g = x.select(Axis(0), cells);
        let mean_g = pred_mean.select(Axis(0), cells);
        let var_g = pred_var.select(Axis(0), cells);

        // every cell of a category shares the same mask row
        let first = cells[0];
        let full_mask: Vec<bool> = masks.full.row(first).iter().map(|&m| m > 0.).collect();
        let top_mask: Vec<bool> = masks.top.row(first).iter().map(|&m| m > 0.).collect();
        if !full_mask.iter().any(|&m| m) || !top_mask.iter().any(|&m| m) {
            warn!("category '{}' has no DEG among the genes", cat);
            continue;
        }

        all.push(r2_of_arrays(&x_g, mean_g.clone(), var_g.clone(), None)?);
        deg.push(r2_of_arrays(&x_g, mean_g.clone(), var_g.clone(), Some(full_mask.as_slice()))?);
        top_deg.push(r2_of_arrays(&x_g, mean_g, var_g, Some(top_mask.as_slice()))?);
        categories.push(cat.to_string());
    }

    if categories.is_empty() {
        anyhow::bail!("no category could be scored");
    }
    debug!("R² over {} categories", categories.len());

    Ok(DegR2Scores {
        all: average(&all),
        deg: average(&deg),
        top_deg: average(&top_deg),
        categories,
    })
}

fn average(scores: &[R2Scores]) -> R2Scores {
    let n = scores.len().max(1) as f32;
    R2Scores {
        r2_mean: scores.iter().map(|s| s.r2_mean).sum::<f32>() / n,
        r2_var: scores.iter().map(|s| s.r2_var).sum::<f32>() / n,
    }
}
