use crate::cpa_config::DoserType;
use crate::cpa_vocab::PAD_INDEX;
use candle_core::{DType, Result, Tensor, D};
use candle_nn::{ops, Embedding, Init, Module, VarBuilder};

/// Per-perturbation feed-forward dose response `1 -> w -> ... -> 1`
///
/// Weights of all perturbations are stacked `(n_perts, d_in, d_out)`
/// and gathered per slot, so every slot runs its own network in one
/// batched matmul.
struct BatchedMlpDoser {
    weights: Vec<Tensor>,
    biases: Vec<Tensor>,
}

impl BatchedMlpDoser {
    fn new(n_perts: usize, width: usize, depth: usize, vb: VarBuilder) -> Result<Self> {
        let mut dims = vec![1];
        dims.extend(std::iter::repeat_n(width, depth));
        dims.push(1);

        let mut weights = Vec::with_capacity(dims.len() - 1);
        let mut biases = Vec::with_capacity(dims.len() - 1);

        for (l, w) in dims.windows(2).enumerate() {
            let (d_in, d_out) = (w[0], w[1]);
            let init_ws = Init::Randn {
                mean: 0.,
                stdev: 1. / (d_in as f64).sqrt(),
            };
            let weight_name = format!("{}.weight", l);
            let bias_name = format!("{}.bias", l);
            weights.push(vb.get_with_hints((n_perts, d_in, d_out), &weight_name, init_ws)?);
            biases.push(vb.get_with_hints((n_perts, d_out), &bias_name, Init::Const(0.))?);
        }
        Ok(Self { weights, biases })
    }

    /// * `perts_m` - flattened slot indices
    /// * `doses_m` - flattened slot dosages
    fn forward(&self, perts_m: &Tensor, doses_m: &Tensor) -> Result<Tensor> {
        let mm = doses_m.dim(0)?;
        let n_layers = self.weights.len();
        let mut h = doses_m.reshape((mm, 1, 1))?;

        for (l, (w, b)) in self.weights.iter().zip(self.biases.iter()).enumerate() {
            let w_m = w.index_select(perts_m, 0)?;
            let b_m = b.index_select(perts_m, 0)?.unsqueeze(1)?;
            h = h.matmul(&w_m)?.broadcast_add(&b_m)?;
            h = if l + 1 < n_layers { h.relu()? } else { ops::sigmoid(&h)? };
        }
        h.reshape(mm)
    }
}

enum DoseResponse {
    Linear,
    Sigmoid { beta: Tensor, bias: Tensor, log_dose: bool },
    Mlp(BatchedMlpDoser),
}

/// Embeds a padded set of perturbations with dosages into one latent
/// vector per cell
///
/// `z = sum_c mask(c) * response(p_c, d_c) * E[p_c]`
///
/// where `mask(c) = 0` for padding slots and for zero dosage.
pub struct DrugNetwork {
    n_perts: usize,
    n_latent: usize,
    doser_type: DoserType,
    embedding: Embedding,
    response: DoseResponse,
}

impl DrugNetwork {
    /// * `drugs.embedding.weight` - `(n_perts, n_latent)`
    /// * `drugs.doser.{beta,bias}` for sigmoid families
    /// * `drugs.doser.{l}.{weight,bias}` for the mlp family
    pub fn new(
        n_perts: usize,
        n_latent: usize,
        doser_type: DoserType,
        dosers_width: usize,
        dosers_depth: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let embedding = candle_nn::embedding(n_perts, n_latent, vb.pp("embedding"))?;
        let vb_doser = vb.pp("doser");

        let response = match doser_type {
            DoserType::Linear => DoseResponse::Linear,
            DoserType::Sigm | DoserType::Logsigm => DoseResponse::Sigmoid {
                beta: vb_doser.get_with_hints(n_perts, "beta", Init::Const(1.))?,
                bias: vb_doser.get_with_hints(n_perts, "bias", Init::Const(0.))?,
                log_dose: doser_type == DoserType::Logsigm,
            },
            DoserType::Mlp => DoseResponse::Mlp(BatchedMlpDoser::new(
                n_perts,
                dosers_width,
                dosers_depth,
                vb_doser,
            )?),
        };

        Ok(Self {
            n_perts,
            n_latent,
            doser_type,
            embedding,
            response,
        })
    }

    pub fn num_perturbations(&self) -> usize {
        self.n_perts
    }

    pub fn n_latent(&self) -> usize {
        self.n_latent
    }

    pub fn doser_type(&self) -> DoserType {
        self.doser_type
    }

    pub fn embeddings(&self) -> &Tensor {
        self.embedding.embeddings()
    }

    /// Scaled dose response per slot, before masking
    fn response(&self, perts_nc: &Tensor, doses_nc: &Tensor) -> Result<Tensor> {
        match &self.response {
            DoseResponse::Linear => Ok(doses_nc.clone()),
            DoseResponse::Sigmoid { beta, bias, log_dose } => {
                let shape = perts_nc.shape();
                let flat = perts_nc.flatten_all()?;
                let beta_nc = beta.index_select(&flat, 0)?.reshape(shape)?;
                let bias_nc = bias.index_select(&flat, 0)?.reshape(shape)?;
                let dose_nc = if *log_dose {
                    (doses_nc + 1.)?.log()?
                } else {
                    doses_nc.clone()
                };
                let on = ops::sigmoid(&(dose_nc.mul(&beta_nc)? + &bias_nc)?)?;
                let off = ops::sigmoid(&bias_nc)?;
                on - off
            }
            DoseResponse::Mlp(mlp) => {
                let shape = perts_nc.shape();
                mlp.forward(&perts_nc.flatten_all()?, &doses_nc.flatten_all()?)?
                    .reshape(shape)
            }
        }
    }

    /// * `perts_nc` - perturbation indices (n x max_comb_len), u32
    /// * `doses_nc` - dosages (n x max_comb_len)
    ///
    /// # Returns `(n x n_latent)` treatment contribution
    pub fn forward(&self, perts_nc: &Tensor, doses_nc: &Tensor) -> Result<Tensor> {
        let perts_nc = perts_nc.to_dtype(DType::U32)?;
        let dtype = self.embedding.embeddings().dtype();
        let doses_nc = doses_nc.to_dtype(dtype)?;

        let dosed_nc = doses_nc.ne(0.)?.to_dtype(dtype)?;
        let mask_nc = (dosed_nc * perts_nc.ne(PAD_INDEX)?.to_dtype(dtype)?)?;
        let scale_nc = (self.response(&perts_nc, &doses_nc)? * mask_nc)?;

        let emb_nck = self.embedding.forward(&perts_nc)?;
        emb_nck.broadcast_mul(&scale_nc.unsqueeze(D::Minus1)?)?.sum(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn network(doser_type: DoserType, varmap: &VarMap) -> Result<DrugNetwork> {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        DrugNetwork::new(5, 4, doser_type, 8, 2, vb.pp("drugs"))
    }

    #[test]
    fn linear_response_scales_embedding() -> Result<()> {
        let varmap = VarMap::new();
        let net = network(DoserType::Linear, &varmap)?;
        let dev = Device::Cpu;

        let perts = Tensor::new(&[[2u32, 0u32]], &dev)?;
        let doses = Tensor::new(&[[0.5f32, 0.0f32]], &dev)?;
        let z = net.forward(&perts, &doses)?;

        let expected = (net.embeddings().get(2)? * 0.5)?.unsqueeze(0)?;
        let diff = (z - expected)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }

    #[test]
    fn zero_dose_slots_vanish() -> Result<()> {
        let dev = Device::Cpu;
        for doser in [DoserType::Linear, DoserType::Sigm, DoserType::Logsigm, DoserType::Mlp] {
            let varmap = VarMap::new();
            let net = network(doser, &varmap)?;
            let perts = Tensor::new(&[[3u32, 4u32], [0u32, 0u32]], &dev)?;
            let doses = Tensor::new(&[[0f32, 0f32], [1f32, 2f32]], &dev)?;
            let z = net.forward(&perts, &doses)?;
            assert_eq!(z.dims(), &[2, 4]);
            let max = z.abs()?.max_all()?.to_scalar::<f32>()?;
            assert_eq!(max, 0., "{:?}", doser);
        }
        Ok(())
    }

    #[test]
    fn sigmoid_response_saturates() -> Result<()> {
        let varmap = VarMap::new();
        let net = network(DoserType::Sigm, &varmap)?;
        let dev = Device::Cpu;
        let perts = Tensor::new(&[[1u32, 2u32]], &dev)?;
        let doses = Tensor::new(&[[1f32, 100f32]], &dev)?;
        // beta = 1, bias = 0 at initialization
        let r = net.response(&perts, &doses)?.to_vec2::<f32>()?;
        assert!((r[0][0] - (1. / (1. + (-1f32).exp()) - 0.5)).abs() < 1e-5);
        assert!((r[0][1] - 0.5).abs() < 1e-5);
        Ok(())
    }
}
