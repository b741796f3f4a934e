use crate::cpa_vocab::CpaVocabulary;
use candle_core::{DType, Result, Tensor};
use candle_nn::{Embedding, Module, VarBuilder};
use std::collections::BTreeMap;

/// One embedding table per categorical covariate
pub struct CovariateEmbedding {
    n_latent: usize,
    tables: BTreeMap<Box<str>, Embedding>,
}

impl CovariateEmbedding {
    pub fn new(vocab: &CpaVocabulary, n_latent: usize, vb: VarBuilder) -> Result<Self> {
        let mut tables = BTreeMap::new();
        for (name, categories) in vocab.covariates().iter() {
            let emb = candle_nn::embedding(categories.len(), n_latent, vb.pp(&**name))?;
            tables.insert(name.clone(), emb);
        }
        Ok(Self { n_latent, tables })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(|k| &**k)
    }

    pub fn table(&self, name: &str) -> Result<&Embedding> {
        self.tables.get(name).ok_or_else(|| {
            candle_core::Error::Msg(format!("no embedding for covariate '{}'", name))
        })
    }

    /// Embedding of one covariate for each label
    pub fn embed(&self, name: &str, labels_n: &Tensor) -> Result<Tensor> {
        self.table(name)?.forward(&labels_n.to_dtype(DType::U32)?)
    }

    /// Elementwise sum of every covariate's embedding, shaped like
    /// `basal_nk`. Without covariates the contribution is zero.
    pub fn forward(
        &self,
        covariates: &BTreeMap<Box<str>, Tensor>,
        basal_nk: &Tensor,
    ) -> Result<Tensor> {
        let mut sum = basal_nk.zeros_like()?;
        for name in self.tables.keys() {
            let labels = covariates.get(name).ok_or_else(|| {
                candle_core::Error::Msg(format!("batch has no covariate '{}'", name))
            })?;
            sum = (sum + self.embed(name, labels)?)?;
        }
        Ok(sum)
    }

    pub fn n_latent(&self) -> usize {
        self.n_latent
    }
}
