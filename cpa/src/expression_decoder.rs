use crate::cpa_config::{OutputActivation, ReconLikelihood};
use candle_core::{Result, Tensor, D};
use candle_nn::{ops, Init, Linear, Module, ModuleT, VarBuilder};
use candle_util::candle_aux_layers::{FcConfig, FcLayers};
use candle_util::candle_loss_functions::*;
use candle_util::candle_model_traits::InputGradientT;

const VAR_EPS: f64 = 1e-4;

/// Decoded distribution parameters of the expression
#[derive(Clone, Debug)]
pub enum ExpressionParams {
    /// per-gene mean and strictly positive variance
    Gaussian { mean: Tensor, var: Tensor },
    /// mean `mu = exp(library) * scale` and inverse dispersion `theta`
    NegativeBinomial { mu: Tensor, theta: Tensor },
    /// as `NegativeBinomial` plus zero-inflation logits
    ZeroInflatedNb { mu: Tensor, theta: Tensor, pi_logits: Tensor },
}

impl ExpressionParams {
    /// Mean of the decoded distribution
    pub fn mean(&self) -> &Tensor {
        match self {
            Self::Gaussian { mean, .. } => mean,
            Self::NegativeBinomial { mu, .. } => mu,
            Self::ZeroInflatedNb { mu, .. } => mu,
        }
    }

    /// Scalar reconstruction loss
    ///
    /// * Gaussian: mean over cells and genes of the negative log-likelihood
    /// * count models: mean over cells of the per-cell negative log-likelihood
    pub fn reconstruction_loss(&self, x_nd: &Tensor) -> Result<Tensor> {
        match self {
            Self::Gaussian { mean, var } => gaussian_nll(x_nd, mean, var)?.mean_all(),
            Self::NegativeBinomial { mu, theta } => {
                negative_binomial_likelihood(x_nd, mu, theta)?.mean_all()?.neg()
            }
            Self::ZeroInflatedNb { mu, theta, pi_logits } => {
                zinb_likelihood(x_nd, mu, theta, pi_logits)?.mean_all()?.neg()
            }
        }
    }
}

enum DecoderHeads {
    Gaussian {
        mean: Linear,
        var: Linear,
        activation: OutputActivation,
    },
    Count {
        scale: Linear,
        px_r: Tensor,
        pi: Option<Linear>,
    },
}

/// Latent code -> expression parameters
pub struct ExpressionDecoder {
    likelihood: ReconLikelihood,
    body: FcLayers,
    heads: DecoderHeads,
}

impl ExpressionDecoder {
    /// * `px.body.fc.{j}.*` - shared hidden stack
    /// * `px.mean`, `px.var` - Gaussian heads
    /// * `px.scale`, `px.dropout`, `px.r` - count-model heads and dispersion
    pub fn new(
        n_latent: usize,
        n_genes: usize,
        likelihood: ReconLikelihood,
        output_activation: OutputActivation,
        layers: &FcConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        let body = FcLayers::new_hidden(n_latent, layers, vb.pp("body"))?;
        let n_hidden = body.dim_out();

        let heads = match likelihood {
            ReconLikelihood::Gauss => DecoderHeads::Gaussian {
                mean: candle_nn::linear(n_hidden, n_genes, vb.pp("mean"))?,
                var: candle_nn::linear(n_hidden, n_genes, vb.pp("var"))?,
                activation: output_activation,
            },
            ReconLikelihood::Nb | ReconLikelihood::Zinb => {
                let init_r = Init::Randn { mean: 0., stdev: 1. };
                DecoderHeads::Count {
                    scale: candle_nn::linear(n_hidden, n_genes, vb.pp("scale"))?,
                    px_r: vb.get_with_hints(n_genes, "r", init_r)?,
                    pi: match likelihood {
                        ReconLikelihood::Zinb => {
                            Some(candle_nn::linear(n_hidden, n_genes, vb.pp("dropout"))?)
                        }
                        _ => None,
                    },
                }
            }
        };

        Ok(Self {
            likelihood,
            body,
            heads,
        })
    }

    pub fn likelihood(&self) -> ReconLikelihood {
        self.likelihood
    }

    /// * `z_nk` - latent code
    /// * `log_library_n1` - required for count models
    pub fn forward_t(
        &self,
        z_nk: &Tensor,
        log_library_n1: Option<&Tensor>,
        train: bool,
    ) -> Result<ExpressionParams> {
        let h_nh = self.body.forward_t(z_nk, train)?;

        match &self.heads {
            DecoderHeads::Gaussian { mean, var, activation } => {
                let mean_nd = mean.forward(&h_nh)?;
                let mean_nd = match activation {
                    OutputActivation::Linear => mean_nd,
                    OutputActivation::Relu => mean_nd.relu()?,
                };
                let var_nd = (softplus(&var.forward(&h_nh)?)? + VAR_EPS)?;
                Ok(ExpressionParams::Gaussian {
                    mean: mean_nd,
                    var: var_nd,
                })
            }
            DecoderHeads::Count { scale, px_r, pi } => {
                let log_library_n1 = log_library_n1.ok_or_else(|| {
                    candle_core::Error::Msg("count likelihood needs a library size".into())
                })?;
                let scale_nd = ops::softmax(&scale.forward(&h_nh)?, D::Minus1)?;
                let mu_nd = scale_nd.broadcast_mul(&log_library_n1.exp()?)?;
                let theta_1d = px_r.exp()?.unsqueeze(0)?;
                match pi {
                    Some(pi) => Ok(ExpressionParams::ZeroInflatedNb {
                        mu: mu_nd,
                        theta: theta_1d,
                        pi_logits: pi.forward(&h_nh)?,
                    }),
                    None => Ok(ExpressionParams::NegativeBinomial {
                        mu: mu_nd,
                        theta: theta_1d,
                    }),
                }
            }
        }
    }
}
