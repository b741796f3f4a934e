use crate::cpa_batch::CpaBatch;
use crate::cpa_vocab::CpaVocabulary;
use candle_core::{DType, Result, Tensor};
use candle_nn::VarBuilder;
use candle_util::candle_aux_layers::{FcConfig, FcLayers, FcTrace};
use candle_util::candle_model_traits::InputGradientT;
use std::collections::BTreeMap;

pub const DRUGS_KEY: &str = "drugs";
pub const ADV_LOSS_KEY: &str = "adv_loss";
pub const PENALTY_ADV_KEY: &str = "penalty_adv";

/// Logits of one classifier and the trace of the pass that made them
#[derive(Clone, Debug)]
pub struct HeadOutput {
    pub logits: Tensor,
    pub trace: FcTrace,
}

/// Outputs of every adversarial classifier on the basal latent code
#[derive(Clone, Debug)]
pub struct AdversaryOutput {
    pub drugs: HeadOutput,
    pub covariates: BTreeMap<Box<str>, HeadOutput>,
}

/// Adversarial classification losses and gradient penalties
///
/// * `adv_<covar>`, `adv_drugs` - cross-entropy per head
/// * `adv_loss` - sum of the `adv_*` components
/// * `penalty_<covar>`, `penalty_drugs` - squared input gradient per head
/// * `penalty_adv` - sum of the `penalty_*` components
#[derive(Clone, Debug, Default)]
pub struct AdversarialLosses {
    terms: BTreeMap<String, Tensor>,
}

impl AdversarialLosses {
    pub fn get(&self, key: &str) -> Option<&Tensor> {
        self.terms.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.terms.keys().map(|k| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.terms.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    fn require(&self, key: &str) -> Result<&Tensor> {
        self.terms
            .get(key)
            .ok_or_else(|| candle_core::Error::Msg(format!("no adversarial term '{}'", key)))
    }

    /// Total classification loss
    pub fn adv_loss(&self) -> Result<&Tensor> {
        self.require(ADV_LOSS_KEY)
    }

    /// Total gradient penalty
    pub fn penalty_adv(&self) -> Result<&Tensor> {
        self.require(PENALTY_ADV_KEY)
    }

    /// Scalar values, e.g. for logging
    pub fn to_scalars(&self) -> Result<BTreeMap<String, f32>> {
        self.terms
            .iter()
            .map(|(k, v)| Ok((k.clone(), v.to_dtype(DType::F32)?.to_scalar::<f32>()?)))
            .collect()
    }
}

/// Classifiers that try to recover the condition and the covariates
/// from the basal latent code
pub struct AdversaryHeads {
    drugs: FcLayers,
    covariates: BTreeMap<Box<str>, FcLayers>,
}

impl AdversaryHeads {
    /// * `adv.drugs.*` - condition classifier
    /// * `adv.covars.<covar>.*` - one classifier per covariate
    pub fn new(
        vocab: &CpaVocabulary,
        n_latent: usize,
        layers: &FcConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        let drugs = FcLayers::new(n_latent, vocab.num_conditions(), layers, vb.pp(DRUGS_KEY))?;
        let mut covariates = BTreeMap::new();
        for (name, categories) in vocab.covariates().iter() {
            let head_vb = vb.pp("covars").pp(&**name);
            let head = FcLayers::new(n_latent, categories.len(), layers, head_vb)?;
            covariates.insert(name.clone(), head);
        }
        Ok(Self { drugs, covariates })
    }

    pub fn covariate_names(&self) -> impl Iterator<Item = &str> {
        self.covariates.keys().map(|k| &**k)
    }

    /// Classify the basal latent code, recording traces for the penalty
    pub fn forward_traced(&self, latent_basal_nk: &Tensor, train: bool) -> Result<AdversaryOutput> {
        let (logits, trace) = self.drugs.forward_traced(latent_basal_nk, train)?;
        let drugs = HeadOutput { logits, trace };

        let mut covariates = BTreeMap::new();
        for (name, head) in self.covariates.iter() {
            let (logits, trace) = head.forward_traced(latent_basal_nk, train)?;
            covariates.insert(name.clone(), HeadOutput { logits, trace });
        }
        Ok(AdversaryOutput { drugs, covariates })
    }

    /// Mean over cells and latent dimensions of the squared gradient of
    /// the summed logits with respect to the basal latent code
    fn penalty(head: &FcLayers, output: &HeadOutput) -> Result<Tensor> {
        head.sum_input_gradient(&output.trace, &output.logits)?.sqr()?.mean_all()
    }

    /// Cross-entropy and gradient penalty of every head.
    ///
    /// `output` must come from [`Self::forward_traced`] on the basal code
    /// of the same forward pass; its traces are what the penalties are
    /// differentiated through.
    pub fn losses(&self, output: &AdversaryOutput, batch: &CpaBatch) -> Result<AdversarialLosses> {
        let mut terms = BTreeMap::new();

        let adv_drugs = candle_nn::loss::cross_entropy(&output.drugs.logits, &batch.condition_n)?;
        let penalty_drugs = Self::penalty(&self.drugs, &output.drugs)?;
        let mut adv_loss = adv_drugs.clone();
        let mut penalty_adv = penalty_drugs.clone();
        terms.insert(format!("adv_{}", DRUGS_KEY), adv_drugs);
        terms.insert(format!("penalty_{}", DRUGS_KEY), penalty_drugs);

        for (name, head) in self.covariates.iter() {
            let head_output = output.covariates.get(name).ok_or_else(|| {
                candle_core::Error::Msg(format!("no logits for covariate '{}'", name))
            })?;
            let labels = batch.covariate(name)?.to_dtype(DType::U32)?;

            let adv = candle_nn::loss::cross_entropy(&head_output.logits, &labels)?;
            let penalty = Self::penalty(head, head_output)?;
            adv_loss = (adv_loss + &adv)?;
            penalty_adv = (penalty_adv + &penalty)?;
            terms.insert(format!("adv_{}", name), adv);
            terms.insert(format!("penalty_{}", name), penalty);
        }

        terms.insert(ADV_LOSS_KEY.to_string(), adv_loss);
        terms.insert(PENALTY_ADV_KEY.to_string(), penalty_adv);
        Ok(AdversarialLosses { terms })
    }
}
