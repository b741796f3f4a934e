use candle_core::{Result, Tensor};

/// A module that can replay the gradient of its output with respect to
/// its input from a recorded forward pass.
pub trait InputGradientT {
    type Trace;

    /// Forward pass that also records whatever the replay needs
    ///
    /// # Arguments
    /// * `x_nd` - input data (n x d)
    /// * `train` - whether to use dropout/batchnorm statistics or not
    ///
    /// # Returns `(y_nk, trace)`
    fn forward_traced(&self, x_nd: &Tensor, train: bool) -> Result<(Tensor, Self::Trace)>;

    /// Vector-Jacobian product: `grad_out_nk -> dL/dx_nd` where
    /// `grad_out_nk = dL/dy_nk`. Built from differentiable ops, so the
    /// result can itself be part of a loss.
    fn input_gradient(&self, trace: &Self::Trace, grad_out_nk: &Tensor) -> Result<Tensor>;

    /// Gradient of `sum(y)` with respect to `x`, row by row
    fn sum_input_gradient(&self, trace: &Self::Trace, y_nk: &Tensor) -> Result<Tensor> {
        self.input_gradient(trace, &y_nk.ones_like()?)
    }

    fn dim_in(&self) -> usize;

    fn dim_out(&self) -> usize;
}
