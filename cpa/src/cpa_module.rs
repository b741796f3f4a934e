use crate::adversary::*;
use crate::basal_encoder::*;
use crate::covariate_embedding::CovariateEmbedding;
use crate::cpa_batch::CpaBatch;
use crate::cpa_config::CpaConfig;
use crate::cpa_metrics::{r2_metric, r2_metric_by_category, DegR2Scores, R2Scores};
use crate::cpa_vocab::{CpaVocabulary, PAD_INDEX};
use crate::deg_mask::DegMasks;
use crate::disentanglement::{DisentanglementEvaluator, DisentanglementScores};
use crate::drug_network::DrugNetwork;
use crate::expression_decoder::*;

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::VarBuilder;
use log::{debug, info};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Covariate names that would collide with the adversarial loss keys
const RESERVED_COVARIATE_NAMES: [&str; 3] = [DRUGS_KEY, "loss", "adv"];

/// Latent codes of one forward pass
///
/// `latent = latent_basal + latent_covariates + latent_treatment`
#[derive(Clone, Debug)]
pub struct InferenceOutput {
    pub latent: Tensor,
    pub latent_basal: Tensor,
    pub latent_covariates: Tensor,
    pub latent_treatment: Tensor,
    /// variational encoder only
    pub posterior: Option<NormalPosterior>,
    /// log library size, count likelihoods only
    pub library: Option<Tensor>,
}

/// Decoded expression and adversarial predictions of one forward pass
#[derive(Clone, Debug)]
pub struct GenerativeOutput {
    pub expression: ExpressionParams,
    pub adversary: AdversaryOutput,
}

/// Replacement treatment (and optionally covariates) for counterfactual
/// prediction
#[derive(Clone, Debug)]
pub struct CounterfactualTarget {
    pub perts_nc: Tensor,
    pub doses_nc: Tensor,
    pub covariates: Option<BTreeMap<Box<str>, Tensor>>,
}

/// Compositional perturbation autoencoder
///
/// The basal code of a cell is made free of perturbation and covariate
/// information by adversarial heads; perturbations and covariates are
/// added back as embeddings before decoding.
pub struct CpaModule {
    config: CpaConfig,
    vocab: Arc<CpaVocabulary>,
    n_genes: usize,
    dtype: DType,
    device: Device,
    encoder: BasalEncoder,
    library_encoder: Option<LibraryEncoder>,
    decoder: ExpressionDecoder,
    drug_network: DrugNetwork,
    covariate_embedding: CovariateEmbedding,
    adversary: AdversaryHeads,
}

impl CpaModule {
    /// Build every sub-network; parameters are registered in the
    /// `VarMap` behind `vb`.
    ///
    /// * `config` - model hyper-parameters
    /// * `vocab` - frozen perturbation/condition/covariate vocabularies
    /// * `n_genes` - number of genes in the expression matrix
    pub fn new(
        config: &CpaConfig,
        vocab: Arc<CpaVocabulary>,
        n_genes: usize,
        vb: VarBuilder,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        if n_genes == 0 {
            anyhow::bail!("need at least one gene");
        }
        for name in vocab.covariate_names() {
            if RESERVED_COVARIATE_NAMES.contains(&name) {
                anyhow::bail!("covariate name '{}' is reserved", name);
            }
        }

        let n_latent = config.n_latent;
        let ae_layers = config.autoencoder_layers();
        let adv_layers = config.adversary_layers();

        let encoder = BasalEncoder::new(
            n_genes,
            n_latent,
            &ae_layers,
            config.variational,
            vb.pp("encoder"),
        )?;

        let library_encoder = if config.recon_loss.is_count_model() {
            Some(LibraryEncoder::new(n_genes, &ae_layers, vb.pp("library"))?)
        } else {
            None
        };

        let decoder = ExpressionDecoder::new(
            n_latent,
            n_genes,
            config.recon_loss,
            config.output_activation,
            &ae_layers,
            vb.pp("px"),
        )?;

        let drug_network = DrugNetwork::new(
            vocab.num_perturbations(),
            n_latent,
            config.doser_type,
            config.dosers_width,
            config.dosers_depth,
            vb.pp("drugs"),
        )?;

        let covariate_embedding = CovariateEmbedding::new(&vocab, n_latent, vb.pp("covars"))?;
        let adversary = AdversaryHeads::new(&vocab, n_latent, &adv_layers, vb.pp("adv"))?;

        info!(
            "CPA: {} genes, {} latent, {:?}, {:?} doser, {} perts, {} conditions, {} covariates{}",
            n_genes,
            n_latent,
            config.recon_loss,
            config.doser_type,
            vocab.num_perturbations(),
            vocab.num_conditions(),
            vocab.covariates().len(),
            if config.variational { ", variational" } else { "" }
        );

        Ok(Self {
            config: config.clone(),
            vocab,
            n_genes,
            dtype: vb.dtype(),
            device: vb.device().clone(),
            encoder,
            library_encoder,
            decoder,
            drug_network,
            covariate_embedding,
            adversary,
        })
    }

    pub fn config(&self) -> &CpaConfig {
        &self.config
    }

    pub fn vocab(&self) -> &CpaVocabulary {
        &self.vocab
    }

    pub fn n_genes(&self) -> usize {
        self.n_genes
    }

    pub fn n_latent(&self) -> usize {
        self.config.n_latent
    }

    fn expression_input(&self, batch: &CpaBatch) -> Result<Tensor> {
        let (_, dd) = batch.x_nd.dims2()?;
        if dd != self.n_genes {
            candle_core::bail!("expression has {} genes, the model has {}", dd, self.n_genes);
        }
        batch.x_nd.to_dtype(self.dtype)
    }

    /// Encode expression into the basal code and add covariate and
    /// treatment embeddings
    pub fn inference(&self, batch: &CpaBatch, train: bool) -> Result<InferenceOutput> {
        let x_nd = self.expression_input(batch)?;
        let (latent_basal, posterior) = self.encoder.forward_t(&x_nd, train)?;

        let library = match &self.library_encoder {
            Some(enc) => Some(enc.forward_t(&x_nd, train)?),
            None => None,
        };

        let latent_covariates = self.covariate_embedding.forward(&batch.covariates, &latent_basal)?;
        let latent_treatment = self.drug_network.forward(&batch.perts_nc, &batch.doses_nc)?;
        let latent = ((&latent_basal + &latent_covariates)? + &latent_treatment)?;

        Ok(InferenceOutput {
            latent,
            latent_basal,
            latent_covariates,
            latent_treatment,
            posterior,
            library,
        })
    }

    /// Decode the combined latent code and run the adversarial heads on
    /// the basal code
    pub fn generative(&self, inference: &InferenceOutput, train: bool) -> Result<GenerativeOutput> {
        let expression = self
            .decoder
            .forward_t(&inference.latent, inference.library.as_ref(), train)?;
        let adversary = self.adversary.forward_traced(&inference.latent_basal, train)?;
        Ok(GenerativeOutput { expression, adversary })
    }

    pub fn forward(
        &self,
        batch: &CpaBatch,
        train: bool,
    ) -> Result<(InferenceOutput, GenerativeOutput)> {
        let inference = self.inference(batch, train)?;
        let generative = self.generative(&inference, train)?;
        Ok((inference, generative))
    }

    /// Scalar reconstruction loss of the observed expression
    pub fn loss(&self, batch: &CpaBatch, generative: &GenerativeOutput) -> Result<Tensor> {
        let x_nd = self.expression_input(batch)?;
        generative.expression.reconstruction_loss(&x_nd)
    }

    /// Mean KL divergence of the basal posterior to N(0, I); `None` for
    /// the deterministic encoder. Adding it to the objective is up to the
    /// caller.
    pub fn kl_loss(&self, inference: &InferenceOutput) -> Result<Option<Tensor>> {
        match &inference.posterior {
            Some(posterior) => Ok(Some(posterior.kl_to_standard_normal()?.mean_all()?)),
            None => Ok(None),
        }
    }

    /// Adversarial classification losses and gradient penalties.
    ///
    /// `inference` and `generative` must come from the same forward pass:
    /// the penalties are differentiated through the traces recorded by
    /// [`Self::generative`] on `inference.latent_basal`.
    pub fn adversarial_loss(
        &self,
        batch: &CpaBatch,
        inference: &InferenceOutput,
        generative: &GenerativeOutput,
    ) -> Result<AdversarialLosses> {
        let nn = inference.latent_basal.dim(0)?;
        if generative.adversary.drugs.logits.dim(0)? != nn || batch.condition_n.dim(0)? != nn {
            candle_core::bail!("adversarial outputs do not match the inference pass");
        }
        let losses = self.adversary.losses(&generative.adversary, batch)?;
        debug!("adversarial terms: {:?}", losses.keys().collect::<Vec<_>>());
        Ok(losses)
    }

    /// R² of per-gene mean and variance, Gaussian likelihood only
    pub fn r2_metric(
        &self,
        batch: &CpaBatch,
        generative: &GenerativeOutput,
        gene_mask: Option<&[bool]>,
    ) -> anyhow::Result<R2Scores> {
        match &generative.expression {
            ExpressionParams::Gaussian { mean, var } => {
                r2_metric(&batch.x_nd, mean, var, gene_mask)
            }
            _ => anyhow::bail!("R² metric needs Gaussian means and variances"),
        }
    }

    /// R² per cell category on all genes, on the category's DEGs and on
    /// its top DEGs, averaged over categories; Gaussian likelihood only
    ///
    /// * `masks` - from [`crate::deg_mask::build_deg_masks`] for the same cells
    /// * `cell_categories` - category of every cell in `batch`
    pub fn r2_metric_deg<S: AsRef<str>>(
        &self,
        batch: &CpaBatch,
        generative: &GenerativeOutput,
        masks: &DegMasks,
        cell_categories: &[S],
    ) -> anyhow::Result<DegR2Scores> {
        match &generative.expression {
            ExpressionParams::Gaussian { mean, var } => {
                r2_metric_by_category(&batch.x_nd, mean, var, masks, cell_categories)
            }
            _ => anyhow::bail!("R² metric needs Gaussian means and variances"),
        }
    }

    /// Cross-validated linear classification of the condition and the
    /// covariates from the basal and the combined latent codes
    pub fn disentanglement(
        &self,
        batch: &CpaBatch,
        inference: &InferenceOutput,
        seed: u64,
    ) -> anyhow::Result<DisentanglementScores> {
        let mut labels = vec![(DRUGS_KEY.to_string(), batch.condition_n.clone())];
        for (name, categories) in self.vocab.covariates().iter() {
            if categories.len() > 1 {
                labels.push((name.to_string(), batch.covariate(name)?.clone()));
            }
        }
        DisentanglementEvaluator::new(seed).evaluate(
            &inference.latent_basal,
            &inference.latent,
            &labels,
        )
    }

    /// Gaussian means and variances in evaluation mode
    pub fn get_expression(&self, batch: &CpaBatch) -> anyhow::Result<(Tensor, Tensor)> {
        let (_, generative) = self.forward(batch, false)?;
        match generative.expression {
            ExpressionParams::Gaussian { mean, var } => Ok((mean, var)),
            _ => anyhow::bail!(
                "expression means/variances are only defined for the Gaussian likelihood, not {:?}",
                self.config.recon_loss
            ),
        }
    }

    /// Treatment embedding of single perturbations at `dosage`
    ///
    /// * `pert` - one perturbation, or every vocabulary entry (padding
    ///   included) when `None`
    ///
    /// # Returns `(n_perts x n_latent)` or `(1 x n_latent)`
    pub fn get_pert_embeddings(&self, dosage: f32, pert: Option<&str>) -> anyhow::Result<Tensor> {
        let indices: Vec<u32> = match pert {
            Some(name) => {
                let idx = self
                    .vocab
                    .perturbations()
                    .get(name)
                    .ok_or_else(|| anyhow::anyhow!("unknown perturbation '{}'", name))?;
                vec![idx as u32]
            }
            None => (0..self.vocab.num_perturbations() as u32).collect(),
        };

        let nn = indices.len();
        let cc = self.vocab.max_comb_len();
        let mut perts = vec![PAD_INDEX; nn * cc];
        let mut doses = vec![0f32; nn * cc];
        for (i, &p) in indices.iter().enumerate() {
            perts[i * cc] = p;
            doses[i * cc] = dosage;
        }

        let perts_nc = Tensor::from_vec(perts, (nn, cc), &self.device)?;
        let doses_nc = Tensor::from_vec(doses, (nn, cc), &self.device)?;
        Ok(self.drug_network.forward(&perts_nc, &doses_nc)?)
    }

    /// Embedding of one covariate value, or of every category in
    /// vocabulary order when `value` is `None`
    pub fn get_covar_embeddings(&self, covar: &str, value: Option<&str>) -> anyhow::Result<Tensor> {
        let categories = self.vocab.covariate(covar)?;
        let labels: Vec<u32> = match value {
            Some(v) => vec![self.vocab.encode_covariate(covar, v)?],
            None => (0..categories.len() as u32).collect(),
        };
        let nn = labels.len();
        let labels_n = Tensor::from_vec(labels, nn, &self.device)?;
        Ok(self.covariate_embedding.embed(covar, &labels_n)?)
    }

    fn counterfactual_batch(
        &self,
        batch: &CpaBatch,
        target: &CounterfactualTarget,
    ) -> anyhow::Result<CpaBatch> {
        let mut counterfactual =
            batch.with_treatment(target.perts_nc.clone(), target.doses_nc.clone());
        if let Some(covariates) = &target.covariates {
            counterfactual.covariates = covariates.clone();
        }
        counterfactual.check(&self.vocab)?;
        Ok(counterfactual)
    }

    fn decode_counterfactual(
        &self,
        counterfactual: &CpaBatch,
        latent_basal: &Tensor,
        library: Option<&Tensor>,
    ) -> Result<ExpressionParams> {
        let latent_covariates = self
            .covariate_embedding
            .forward(&counterfactual.covariates, latent_basal)?;
        let latent_treatment = self
            .drug_network
            .forward(&counterfactual.perts_nc, &counterfactual.doses_nc)?;
        let latent = ((latent_basal + latent_covariates)? + latent_treatment)?;
        self.decoder.forward_t(&latent, library, false)
    }

    /// # Returns `(latent_basal, posterior, log_library)` in evaluation mode
    fn encode_eval(
        &self,
        batch: &CpaBatch,
    ) -> Result<(Tensor, Option<NormalPosterior>, Option<Tensor>)> {
        let x_nd = self.expression_input(batch)?;
        let (latent_basal, posterior) = self.encoder.forward_t(&x_nd, false)?;
        let library = match &self.library_encoder {
            Some(enc) => Some(enc.forward_t(&x_nd, false)?),
            None => None,
        };
        Ok((latent_basal, posterior, library))
    }

    /// Decode the basal code of the observed cells under another
    /// treatment (and optionally other covariates), in evaluation mode.
    /// A variational encoder contributes its posterior mean.
    pub fn predict_counterfactual(
        &self,
        batch: &CpaBatch,
        target: &CounterfactualTarget,
    ) -> anyhow::Result<ExpressionParams> {
        let counterfactual = self.counterfactual_batch(batch, target)?;
        let (latent_basal, _, library) = self.encode_eval(batch)?;
        Ok(self.decode_counterfactual(&counterfactual, &latent_basal, library.as_ref())?)
    }

    /// Counterfactual predictions from `n_samples` draws of the basal
    /// posterior; a deterministic encoder gives a single prediction.
    pub fn sample_counterfactual(
        &self,
        batch: &CpaBatch,
        target: &CounterfactualTarget,
        n_samples: usize,
    ) -> anyhow::Result<Vec<ExpressionParams>> {
        if n_samples == 0 {
            anyhow::bail!("need at least one sample");
        }
        let counterfactual = self.counterfactual_batch(batch, target)?;
        let (latent_basal, posterior, library) = self.encode_eval(batch)?;

        match posterior {
            Some(posterior) => (0..n_samples)
                .map(|_| -> anyhow::Result<ExpressionParams> {
                    let z_nk = posterior.rsample()?;
                    Ok(self.decode_counterfactual(&counterfactual, &z_nk, library.as_ref())?)
                })
                .collect(),
            None => {
                debug!("deterministic encoder: one counterfactual sample");
                Ok(vec![self.decode_counterfactual(
                    &counterfactual,
                    &latent_basal,
                    library.as_ref(),
                )?])
            }
        }
    }

    /// Mean expression of the counterfactual cells
    ///
    /// * `n_samples` - average the decoded means over this many posterior
    ///   draws; `None` decodes the posterior mean once
    pub fn predict_counterfactual_mean(
        &self,
        batch: &CpaBatch,
        target: &CounterfactualTarget,
        n_samples: Option<usize>,
    ) -> anyhow::Result<Tensor> {
        match n_samples {
            None => Ok(self.predict_counterfactual(batch, target)?.mean().clone()),
            Some(n) => {
                let means: Vec<Tensor> = self
                    .sample_counterfactual(batch, target, n)?
                    .iter()
                    .map(|params| params.mean().clone())
                    .collect();
                Ok(Tensor::stack(&means, 0)?.mean(0)?)
            }
        }
    }
}
