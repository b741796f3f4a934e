use candle_core::{Result, Tensor};
use candle_nn::{Linear, Module, ModuleT, VarBuilder};
use candle_util::candle_aux_layers::{FcConfig, FcLayers};
use candle_util::candle_loss_functions::{gaussian_kl_loss, softplus};
use candle_util::candle_model_traits::InputGradientT;

const SCALE_EPS: f64 = 1e-4;

/// Diagonal Gaussian posterior of the basal latent code
#[derive(Clone, Debug)]
pub struct NormalPosterior {
    pub mean: Tensor,
    pub std: Tensor,
}

impl NormalPosterior {
    /// KL divergence to N(0, I) per cell, `(n,)`
    pub fn kl_to_standard_normal(&self) -> Result<Tensor> {
        gaussian_kl_loss(&self.mean, &self.std)
    }

    /// `mean + std * eps`, `eps ~ N(0, I)`
    pub fn rsample(&self) -> Result<Tensor> {
        let eps = self.mean.randn_like(0., 1.)?;
        &self.mean + (&self.std * eps)?
    }
}

/// Expression -> basal latent code
pub enum BasalEncoder {
    Deterministic(FcLayers),
    Variational {
        body: FcLayers,
        mean: Linear,
        scale: Linear,
    },
}

impl BasalEncoder {
    /// * `n_genes` - input dimension
    /// * `n_latent` - basal latent dimension
    /// * `variational` - draw the latent code from a Gaussian posterior
    pub fn new(
        n_genes: usize,
        n_latent: usize,
        layers: &FcConfig,
        variational: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        if variational {
            let body = FcLayers::new_hidden(n_genes, layers, vb.pp("body"))?;
            let mean = candle_nn::linear(body.dim_out(), n_latent, vb.pp("z.mean"))?;
            let scale = candle_nn::linear(body.dim_out(), n_latent, vb.pp("z.scale"))?;
            Ok(Self::Variational { body, mean, scale })
        } else {
            Ok(Self::Deterministic(FcLayers::new(n_genes, n_latent, layers, vb)?))
        }
    }

    pub fn is_variational(&self) -> bool {
        matches!(self, Self::Variational { .. })
    }

    /// # Returns `(latent_basal, posterior)`
    ///
    /// In training mode the variational latent is a reparameterized
    /// sample; in evaluation mode it is the posterior mean.
    pub fn forward_t(
        &self,
        x_nd: &Tensor,
        train: bool,
    ) -> Result<(Tensor, Option<NormalPosterior>)> {
        match self {
            Self::Deterministic(fc) => Ok((fc.forward_t(x_nd, train)?, None)),
            Self::Variational { body, mean, scale } => {
                let h_nh = body.forward_t(x_nd, train)?;
                let posterior = NormalPosterior {
                    mean: mean.forward(&h_nh)?,
                    std: (softplus(&scale.forward(&h_nh)?)? + SCALE_EPS)?,
                };
                let z_nk = if train {
                    posterior.rsample()?
                } else {
                    posterior.mean.clone()
                };
                Ok((z_nk, Some(posterior)))
            }
        }
    }
}

/// Expression -> log library size, `(n x 1)`
pub struct LibraryEncoder {
    fc: FcLayers,
}

impl LibraryEncoder {
    pub fn new(n_genes: usize, layers: &FcConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc: FcLayers::new(n_genes, 1, layers, vb)?,
        })
    }

    pub fn forward_t(&self, x_nd: &Tensor, train: bool) -> Result<Tensor> {
        self.fc.forward_t(x_nd, train)
    }
}
