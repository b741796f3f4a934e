pub mod adversary;
pub mod basal_encoder;
pub mod covariate_embedding;
pub mod cpa_batch;
pub mod cpa_config;
pub mod cpa_metrics;
pub mod cpa_module;
pub mod cpa_vocab;
pub mod deg_mask;
pub mod disentanglement;
pub mod drug_network;
pub mod expression_decoder;

pub use cpa_batch::CpaBatch;
pub use cpa_config::{CpaConfig, DoserType, OutputActivation, ReconLikelihood};
pub use cpa_module::{CounterfactualTarget, CpaModule, GenerativeOutput, InferenceOutput};
pub use cpa_vocab::CpaVocabulary;
pub use cpa_metrics::{DegR2Scores, R2Scores};
pub use deg_mask::{build_deg_masks, DegMasks};
