use crate::cpa_vocab::{CpaVocabulary, EncodedCells};
use candle_core::{DType, Device, Tensor};
use std::collections::{BTreeMap, HashMap};

pub const X_KEY: &str = "X";
pub const PERTURBATIONS_KEY: &str = "perts";
pub const PERTURBATIONS_DOSAGES_KEY: &str = "perts_doses";
pub const CONDITION_KEY: &str = "condition";

/// One mini-batch of cells as consumed by [`crate::cpa_module::CpaModule`]
///
/// * `x_nd` - expression (n x genes), f32
/// * `perts_nc` - perturbation indices (n x max_comb_len), u32
/// * `doses_nc` - dosages (n x max_comb_len), f32
/// * `condition_n` - condition label per cell, u32
/// * `covariates` - covariate name -> label per cell, u32
#[derive(Clone, Debug)]
pub struct CpaBatch {
    pub x_nd: Tensor,
    pub perts_nc: Tensor,
    pub doses_nc: Tensor,
    pub condition_n: Tensor,
    pub covariates: BTreeMap<Box<str>, Tensor>,
}

impl CpaBatch {
    /// Take tensors out of a keyed map; every covariate of `vocab` must
    /// be present under its own name.
    pub fn from_tensor_map(
        tensors: &HashMap<String, Tensor>,
        vocab: &CpaVocabulary,
    ) -> anyhow::Result<Self> {
        let take = |key: &str| -> anyhow::Result<Tensor> {
            tensors
                .get(key)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("missing tensor '{}'", key))
        };

        let mut covariates = BTreeMap::new();
        for name in vocab.covariate_names() {
            let labels = take(name)?.flatten_all()?.to_dtype(DType::U32)?;
            covariates.insert(name.into(), labels);
        }

        let batch = Self {
            x_nd: take(X_KEY)?.to_dtype(DType::F32)?,
            perts_nc: take(PERTURBATIONS_KEY)?.to_dtype(DType::U32)?,
            doses_nc: take(PERTURBATIONS_DOSAGES_KEY)?.to_dtype(DType::F32)?,
            condition_n: take(CONDITION_KEY)?.flatten_all()?.to_dtype(DType::U32)?,
            covariates,
        };
        batch.check(vocab)?;
        Ok(batch)
    }

    /// Tensors on `device` from expression rows and encoded annotations
    pub fn from_encoded(
        x_nd: &Tensor,
        cells: &EncodedCells,
        device: &Device,
    ) -> anyhow::Result<Self> {
        let (nn, cc) = (cells.num_cells, cells.max_comb_len);

        let mut covariates = BTreeMap::new();
        for (name, labels) in cells.covariates.iter() {
            covariates.insert(name.clone(), Tensor::from_slice(labels, nn, device)?);
        }

        let batch = Self {
            x_nd: x_nd.to_dtype(DType::F32)?.to_device(device)?,
            perts_nc: Tensor::from_slice(&cells.perts, (nn, cc), device)?,
            doses_nc: Tensor::from_slice(&cells.doses, (nn, cc), device)?,
            condition_n: Tensor::from_slice(&cells.conditions, nn, device)?,
            covariates,
        };
        batch.check_shapes()?;
        Ok(batch)
    }

    pub fn num_cells(&self) -> candle_core::Result<usize> {
        self.x_nd.dim(0)
    }

    pub fn covariate(&self, name: &str) -> candle_core::Result<&Tensor> {
        self.covariates
            .get(name)
            .ok_or_else(|| candle_core::Error::Msg(format!("batch has no covariate '{}'", name)))
    }

    /// Same cells with other perturbations/dosages/covariates
    pub fn with_treatment(&self, perts_nc: Tensor, doses_nc: Tensor) -> Self {
        Self {
            perts_nc,
            doses_nc,
            ..self.clone()
        }
    }

    /// Shapes agree with each other and with the vocabulary
    pub fn check(&self, vocab: &CpaVocabulary) -> anyhow::Result<()> {
        let cc = self.check_shapes()?;
        if cc != vocab.max_comb_len() {
            anyhow::bail!("{} perturbation slots, expected {}", cc, vocab.max_comb_len());
        }
        for name in vocab.covariate_names() {
            self.covariate(name)?;
        }
        Ok(())
    }

    /// Every tensor covers the same cells
    ///
    /// # Returns the number of perturbation slots
    pub fn check_shapes(&self) -> anyhow::Result<usize> {
        let nn = self.x_nd.dim(0)?;
        let (n_p, cc) = self.perts_nc.dims2()?;
        if n_p != nn || self.doses_nc.dims2()? != (nn, cc) {
            anyhow::bail!(
                "perturbation tensors {:?}/{:?} do not match {} cells",
                self.perts_nc.dims(),
                self.doses_nc.dims(),
                nn
            );
        }
        if self.condition_n.dims() != [nn] {
            anyhow::bail!("condition labels {:?} for {} cells", self.condition_n.dims(), nn);
        }
        for (name, labels) in self.covariates.iter() {
            if labels.dims() != [nn] {
                anyhow::bail!("covariate '{}' labels {:?} for {} cells", name, labels.dims(), nn);
            }
        }
        Ok(cc)
    }
}
