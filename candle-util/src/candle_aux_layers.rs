use crate::candle_aux_norm::*;
use crate::candle_model_traits::InputGradientT;
use candle_core::{Result, Tensor};
use candle_nn::{Linear, Module, ModuleT, VarBuilder};
use log::debug;

/// Shape and regularization of a fully connected stack
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FcConfig {
    pub n_hidden: usize,
    pub n_layers: usize,
    pub use_batch_norm: bool,
    pub use_layer_norm: bool,
    pub dropout_rate: f64,
}

impl Default for FcConfig {
    fn default() -> Self {
        Self {
            n_hidden: 128,
            n_layers: 1,
            use_batch_norm: true,
            use_layer_norm: false,
            dropout_rate: 0.,
        }
    }
}

const BN_EPS: f64 = 1e-3;
const BN_MOMENTUM: f64 = 0.01;
const LN_EPS: f64 = 1e-5;

/// linear -> [batch norm] -> [layer norm] -> relu -> [dropout]
struct FcBlock {
    linear: Linear,
    batch_norm: Option<BatchNorm1d>,
    layer_norm: Option<LayerNorm1d>,
    dropout_rate: f64,
}

/// What one block needs to replay its input gradient
#[derive(Clone, Debug)]
struct BlockTrace {
    norms: Vec<NormTrace>,
    relu_mask: Tensor,
    dropout_mask: Option<Tensor>,
}

/// Recorded forward pass of [`FcLayers`]
#[derive(Clone, Debug)]
pub struct FcTrace {
    blocks: Vec<BlockTrace>,
}

impl FcTrace {
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }
}

impl FcBlock {
    fn new(d_in: usize, d_out: usize, config: &FcConfig, vb: VarBuilder) -> Result<Self> {
        let linear = candle_nn::linear(d_in, d_out, vb.pp("linear"))?;
        let batch_norm = if config.use_batch_norm {
            Some(BatchNorm1d::new(d_out, BN_EPS, BN_MOMENTUM, vb.pp("bn"))?)
        } else {
            None
        };
        let layer_norm = config.use_layer_norm.then(|| LayerNorm1d::new(LN_EPS));

        Ok(Self {
            linear,
            batch_norm,
            layer_norm,
            dropout_rate: config.dropout_rate,
        })
    }

    fn forward(
        &self,
        x_nd: &Tensor,
        train: bool,
        record: bool,
    ) -> Result<(Tensor, Option<BlockTrace>)> {
        let mut norms = vec![];
        let mut h = self.linear.forward(x_nd)?;

        if let Some(bn) = &self.batch_norm {
            let (y, trace) = bn.forward_traced(&h, train)?;
            h = y;
            norms.push(trace);
        }

        if let Some(ln) = &self.layer_norm {
            let (y, trace) = ln.forward_traced(&h)?;
            h = y;
            norms.push(trace);
        }

        let relu_mask = if record {
            Some(h.gt(0.)?.to_dtype(h.dtype())?)
        } else {
            None
        };
        h = h.relu()?;

        let dropout_mask = if train && self.dropout_rate > 0. {
            let keep = 1. - self.dropout_rate;
            let mask = (h.rand_like(0., 1.)?.ge(self.dropout_rate)?.to_dtype(h.dtype())? / keep)?;
            h = (h * &mask)?;
            Some(mask)
        } else {
            None
        };

        let trace = relu_mask.map(|relu_mask| BlockTrace {
            norms,
            relu_mask,
            dropout_mask,
        });

        Ok((h, trace))
    }

    fn backward(&self, trace: &BlockTrace, g: &Tensor) -> Result<Tensor> {
        let mut g = g.clone();
        if let Some(mask) = &trace.dropout_mask {
            g = (g * mask)?;
        }
        g = (g * &trace.relu_mask)?;
        for norm in trace.norms.iter().rev() {
            g = norm.backward(&g)?;
        }
        g.matmul(self.linear.weight())
    }
}

/// A stack of fully connected blocks, optionally capped by a plain
/// linear output layer.
///
/// Besides the usual forward pass, the stack can record a trace of its
/// intermediates and replay the gradient of any linear functional of its
/// output with respect to its input. The replay is built from ordinary
/// tensor ops, so the result stays differentiable with respect to the
/// stack's parameters and to the input.
pub struct FcLayers {
    n_in: usize,
    n_out: usize,
    blocks: Vec<FcBlock>,
    output: Option<Linear>,
}

impl FcLayers {
    /// `n_layers - 1` hidden blocks of width `n_hidden` and a linear
    /// output layer `n_hidden -> n_out`. With a single layer this is
    /// just `n_in -> n_out`.
    ///
    /// * `fc.{j}.linear.weight` for each hidden block `j`
    /// * `fc.{j}.bn.{weight,bias,running_mean,running_var}`
    /// * `out.weight`, `out.bias`
    pub fn new(n_in: usize, n_out: usize, config: &FcConfig, vb: VarBuilder) -> Result<Self> {
        let n_layers = config.n_layers.max(1);
        let mut blocks = Vec::with_capacity(n_layers - 1);
        let mut prev_dim = n_in;
        for j in 0..(n_layers - 1) {
            blocks.push(FcBlock::new(
                prev_dim,
                config.n_hidden,
                config,
                vb.pp(format!("fc.{}", j)),
            )?);
            prev_dim = config.n_hidden;
        }
        let output = candle_nn::linear(prev_dim, n_out, vb.pp("out"))?;
        debug!("fc stack {} -> {} x {} -> {}", n_in, n_layers - 1, config.n_hidden, n_out);

        Ok(Self {
            n_in,
            n_out,
            blocks,
            output: Some(output),
        })
    }

    /// `n_layers` hidden blocks, every one followed by the activation.
    /// The output dimension is `n_hidden`.
    pub fn new_hidden(n_in: usize, config: &FcConfig, vb: VarBuilder) -> Result<Self> {
        let n_layers = config.n_layers.max(1);
        let mut blocks = Vec::with_capacity(n_layers);
        let mut prev_dim = n_in;
        for j in 0..n_layers {
            blocks.push(FcBlock::new(
                prev_dim,
                config.n_hidden,
                config,
                vb.pp(format!("fc.{}", j)),
            )?);
            prev_dim = config.n_hidden;
        }

        debug!("hidden fc stack {} -> {} x {}", n_in, n_layers, config.n_hidden);
        Ok(Self {
            n_in,
            n_out: config.n_hidden,
            blocks,
            output: None,
        })
    }

    fn run(&self, x_nd: &Tensor, train: bool, record: bool) -> Result<(Tensor, Option<FcTrace>)> {
        let mut h = x_nd.clone();
        let mut traces = Vec::with_capacity(self.blocks.len());
        for block in self.blocks.iter() {
            let (next, trace) = block.forward(&h, train, record)?;
            h = next;
            if let Some(trace) = trace {
                traces.push(trace);
            }
        }
        if let Some(output) = &self.output {
            h = output.forward(&h)?;
        }
        let trace = record.then_some(FcTrace { blocks: traces });
        Ok((h, trace))
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }
}

impl ModuleT for FcLayers {
    fn forward_t(&self, x_nd: &Tensor, train: bool) -> Result<Tensor> {
        Ok(self.run(x_nd, train, false)?.0)
    }
}

impl InputGradientT for FcLayers {
    type Trace = FcTrace;

    fn forward_traced(&self, x_nd: &Tensor, train: bool) -> Result<(Tensor, FcTrace)> {
        let (out, trace) = self.run(x_nd, train, true)?;
        let trace = trace.ok_or_else(|| candle_core::Error::Msg("missing forward trace".into()))?;
        Ok((out, trace))
    }

    fn input_gradient(&self, trace: &FcTrace, grad_out: &Tensor) -> Result<Tensor> {
        if trace.blocks.len() != self.blocks.len() {
            candle_core::bail!(
                "trace has {} blocks, but the stack has {}",
                trace.blocks.len(),
                self.blocks.len()
            );
        }

        let mut g = match &self.output {
            Some(output) => grad_out.matmul(output.weight())?,
            None => grad_out.clone(),
        };

        for (block, block_trace) in self.blocks.iter().zip(trace.blocks.iter()).rev() {
            g = block.backward(block_trace, &g)?;
        }
        Ok(g)
    }

    fn dim_in(&self) -> usize {
        self.n_in
    }

    fn dim_out(&self) -> usize {
        self.n_out
    }
}
