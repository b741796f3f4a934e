use candle_core::{Result, Tensor, Var, D};
use candle_nn::{Init, VarBuilder};

/// Cached intermediates of a normalization step, enough to push an
/// upstream gradient back to the normalization input.
#[derive(Clone, Debug)]
pub enum NormTrace {
    /// batch statistics (training mode)
    Batch {
        xhat: Tensor,
        inv_std: Tensor,
        gamma: Tensor,
    },
    /// running statistics (evaluation mode): a per-feature affine map
    Frozen { scale: Tensor },
    /// per-row statistics, no affine parameters
    Layer { xhat: Tensor, inv_std: Tensor },
}

impl NormTrace {
    /// Given `g = dL/dy`, return `dL/dx` using differentiable ops only.
    ///
    /// Batch (reduce over rows) and layer (reduce over columns) share
    /// the same closed form:
    ///
    /// ```text
    /// dx = inv_std * ( gy - mean(gy) - xhat * mean(gy * xhat) )
    /// ```
    pub fn backward(&self, g: &Tensor) -> Result<Tensor> {
        match self {
            NormTrace::Batch {
                xhat,
                inv_std,
                gamma,
            } => {
                let gy = g.broadcast_mul(gamma)?;
                let mean_gy = gy.mean_keepdim(0)?;
                let mean_gy_xhat = (&gy * xhat)?.mean_keepdim(0)?;
                gy.broadcast_sub(&mean_gy)?
                    .sub(&xhat.broadcast_mul(&mean_gy_xhat)?)?
                    .broadcast_mul(inv_std)
            }
            NormTrace::Frozen { scale } => g.broadcast_mul(scale),
            NormTrace::Layer { xhat, inv_std } => {
                let mean_g = g.mean_keepdim(D::Minus1)?;
                let mean_g_xhat = (g * xhat)?.mean_keepdim(D::Minus1)?;
                g.broadcast_sub(&mean_g)?
                    .sub(&xhat.broadcast_mul(&mean_g_xhat)?)?
                    .broadcast_mul(inv_std)
            }
        }
    }
}

/// Batch normalization over the rows of an `n x d` matrix.
///
/// Running statistics live in the same variable map as the affine
/// parameters (`running_mean`, `running_var`) and are refreshed on every
/// training-mode call.
pub struct BatchNorm1d {
    gamma: Tensor,
    beta: Tensor,
    running_mean: Var,
    running_var: Var,
    eps: f64,
    momentum: f64,
}

impl BatchNorm1d {
    /// * `weight`, `bias` - affine parameters
    /// * `running_mean`, `running_var` - moving statistics
    pub fn new(dim: usize, eps: f64, momentum: f64, vb: VarBuilder) -> Result<Self> {
        let gamma = vb.get_with_hints(dim, "weight", Init::Const(1.))?;
        let beta = vb.get_with_hints(dim, "bias", Init::Const(0.))?;
        let running_mean = vb.get_with_hints(dim, "running_mean", Init::Const(0.))?;
        let running_var = vb.get_with_hints(dim, "running_var", Init::Const(1.))?;

        Ok(Self {
            gamma,
            beta,
            running_mean: Var::from_tensor(&running_mean)?,
            running_var: Var::from_tensor(&running_var)?,
            eps,
            momentum,
        })
    }

    pub fn forward_traced(&self, x_nd: &Tensor, train: bool) -> Result<(Tensor, NormTrace)> {
        if train {
            let nn = x_nd.dim(0)?;
            let mean_d = x_nd.mean_keepdim(0)?;
            let centred_nd = x_nd.broadcast_sub(&mean_d)?;
            let var_d = centred_nd.sqr()?.mean_keepdim(0)?;
            let inv_std_d = (&var_d + self.eps)?.sqrt()?.recip()?;
            let xhat_nd = centred_nd.broadcast_mul(&inv_std_d)?;

            self.update_running_stats(&mean_d, &var_d, nn)?;

            let y_nd = xhat_nd
                .broadcast_mul(&self.gamma)?
                .broadcast_add(&self.beta)?;

            Ok((
                y_nd,
                NormTrace::Batch {
                    xhat: xhat_nd,
                    inv_std: inv_std_d,
                    gamma: self.gamma.clone(),
                },
            ))
        } else {
            let mean_d = self.running_mean.as_detached_tensor();
            let var_d = self.running_var.as_detached_tensor();
            let scale_d = (var_d + self.eps)?
                .sqrt()?
                .recip()?
                .mul(&self.gamma)?;
            let y_nd = x_nd
                .broadcast_sub(&mean_d)?
                .broadcast_mul(&scale_d)?
                .broadcast_add(&self.beta)?;
            Ok((y_nd, NormTrace::Frozen { scale: scale_d }))
        }
    }

    fn update_running_stats(&self, mean_1d: &Tensor, var_1d: &Tensor, nn: usize) -> Result<()> {
        let m = self.momentum;
        let unbiased = if nn > 1 {
            nn as f64 / (nn - 1) as f64
        } else {
            1.
        };
        let mean_d = mean_1d.detach().squeeze(0)?;
        let var_d = (var_1d.detach().squeeze(0)? * unbiased)?;

        let new_mean = ((self.running_mean.as_detached_tensor() * (1. - m))? + (mean_d * m)?)?;
        let new_var = ((self.running_var.as_detached_tensor() * (1. - m))? + (var_d * m)?)?;
        self.running_mean.set(&new_mean)?;
        self.running_var.set(&new_var)
    }

    pub fn running_mean(&self) -> Tensor {
        self.running_mean.as_detached_tensor()
    }

    pub fn running_var(&self) -> Tensor {
        self.running_var.as_detached_tensor()
    }
}

/// Layer normalization over the last axis, without affine parameters
#[derive(Clone, Copy, Debug)]
pub struct LayerNorm1d {
    eps: f64,
}

impl LayerNorm1d {
    pub fn new(eps: f64) -> Self {
        Self { eps }
    }

    pub fn forward_traced(&self, x_nd: &Tensor) -> Result<(Tensor, NormTrace)> {
        let mean_n = x_nd.mean_keepdim(D::Minus1)?;
        let centred_nd = x_nd.broadcast_sub(&mean_n)?;
        let var_n = centred_nd.sqr()?.mean_keepdim(D::Minus1)?;
        let inv_std_n = (var_n + self.eps)?.sqrt()?.recip()?;
        let xhat_nd = centred_nd.broadcast_mul(&inv_std_n)?;
        Ok((
            xhat_nd.clone(),
            NormTrace::Layer {
                xhat: xhat_nd,
                inv_std: inv_std_n,
            },
        ))
    }
}
