use log::debug;
use ndarray::{Array1, Array2};
use std::collections::HashMap;

/// Per-cell gene masks of differentially expressed genes
///
/// * `full` - every DEG listed for the cell's category
/// * `top` - only the first `n_top` DEGs of that list
///
/// Cells whose category has no DEG list keep every gene in both masks.
pub struct DegMasks {
    pub full: Array2<f32>,
    pub top: Array2<f32>,
}

/// Build DEG masks for `cell_categories`
///
/// * `gene_names` - column names of the expression matrix
/// * `deg_genes` - category -> DEGs ranked by significance
/// * `cell_categories` - one covariate/condition category per cell
/// * `n_top` - length of the restricted list
pub fn build_deg_masks<S: AsRef<str>>(
    gene_names: &[S],
    deg_genes: &HashMap<String, Vec<String>>,
    cell_categories: &[S],
    n_top: usize,
) -> DegMasks {
    let gene_index: HashMap<&str, usize> = gene_names
        .iter()
        .enumerate()
        .map(|(j, g)| (g.as_ref(), j))
        .collect();
    let n_genes = gene_names.len();

    let to_mask = |genes: &[String]| -> Array1<f32> {
        let mut mask = Array1::zeros(n_genes);
        for g in genes {
            if let Some(&j) = gene_index.get(g.as_str()) {
                mask[j] = 1.;
            }
        }
        mask
    };

    let full_table: HashMap<&str, Array1<f32>> = deg_genes
        .iter()
        .map(|(cat, genes)| (cat.as_str(), to_mask(genes)))
        .collect();

    let top_table: HashMap<&str, Array1<f32>> = deg_genes
        .iter()
        .map(|(cat, genes)| (cat.as_str(), to_mask(&genes[..genes.len().min(n_top)])))
        .collect();

    let n_cells = cell_categories.len();
    let mut full = Array2::ones((n_cells, n_genes));
    let mut top = Array2::ones((n_cells, n_genes));
    let mut missing = 0;

    for (i, cat) in cell_categories.iter().enumerate() {
        match (full_table.get(cat.as_ref()), top_table.get(cat.as_ref())) {
            (Some(f), Some(t)) => {
                full.row_mut(i).assign(f);
                top.row_mut(i).assign(t);
            }
            _ => missing += 1,
        }
    }

    debug!(
        "DEG masks: {} cells, {} genes, {} cells without a DEG list",
        n_cells, n_genes, missing
    );

    DegMasks { full, top }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_mask_is_restricted() {
        let genes = ["g0", "g1", "g2", "g3"];
        let mut deg = HashMap::new();
        deg.insert(
            "T_drugA".to_string(),
            vec!["g2".to_string(), "g0".to_string(), "g3".to_string()],
        );

        let cells = ["T_drugA", "B_ctrl"];
        let masks = build_deg_masks(&genes, &deg, &cells, 1);

        assert_eq!(masks.full.row(0).to_vec(), vec![1., 0., 1., 1.]);
        assert_eq!(masks.top.row(0).to_vec(), vec![0., 0., 1., 0.]);
        assert_eq!(masks.full.row(1).to_vec(), vec![1., 1., 1., 1.]);
        assert_eq!(masks.top.row(1).to_vec(), vec![1., 1., 1., 1.]);
        assert_ne!(masks.full, masks.top);
    }

    #[test]
    fn unknown_genes_are_ignored() {
        let genes = ["g0", "g1"];
        let mut deg = HashMap::new();
        deg.insert("x".to_string(), vec!["nope".to_string(), "g1".to_string()]);
        let masks = build_deg_masks(&genes, &deg, &["x"], 10);
        assert_eq!(masks.full.row(0).to_vec(), vec![0., 1.]);
        assert_eq!(masks.top.row(0).to_vec(), vec![0., 1.]);
    }
}
