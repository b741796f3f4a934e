use candle_util::candle_aux_layers::FcConfig;
use serde::{Deserialize, Serialize};

/// Reconstruction likelihood of the decoder
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReconLikelihood {
    #[serde(alias = "mse")]
    Gauss,
    Nb,
    Zinb,
}

impl ReconLikelihood {
    pub fn is_count_model(&self) -> bool {
        matches!(self, Self::Nb | Self::Zinb)
    }
}

impl std::str::FromStr for ReconLikelihood {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "gauss" | "gaussian" | "mse" => Ok(Self::Gauss),
            "nb" => Ok(Self::Nb),
            "zinb" => Ok(Self::Zinb),
            _ => anyhow::bail!(
                "Invalid reconstruction likelihood: {} (expected gauss, mse, nb or zinb)",
                s
            ),
        }
    }
}

/// Dose-response family of the perturbation network
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DoserType {
    Linear,
    Sigm,
    Logsigm,
    Mlp,
}

impl std::str::FromStr for DoserType {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "linear" => Ok(Self::Linear),
            "sigm" | "sigmoid" => Ok(Self::Sigm),
            "logsigm" => Ok(Self::Logsigm),
            "mlp" => Ok(Self::Mlp),
            _ => anyhow::bail!("Invalid doser type: {} (expected linear, sigm, logsigm or mlp)", s),
        }
    }
}

/// Output activation of the Gaussian decoder mean
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputActivation {
    #[default]
    Linear,
    Relu,
}

impl std::str::FromStr for OutputActivation {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "linear" => Ok(Self::Linear),
            "relu" => Ok(Self::Relu),
            _ => anyhow::bail!("Invalid output activation: {}", s),
        }
    }
}

/// Hyper-parameters of the compositional perturbation autoencoder
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct CpaConfig {
    pub n_latent: usize,
    pub recon_loss: ReconLikelihood,
    pub doser_type: DoserType,
    pub output_activation: OutputActivation,
    pub autoencoder_width: usize,
    pub autoencoder_depth: usize,
    pub adversary_width: usize,
    pub adversary_depth: usize,
    pub dosers_width: usize,
    pub dosers_depth: usize,
    pub use_batch_norm: bool,
    pub use_layer_norm: bool,
    pub dropout_rate: f64,
    pub variational: bool,
}

impl Default for CpaConfig {
    fn default() -> Self {
        Self {
            n_latent: 256,
            recon_loss: ReconLikelihood::Gauss,
            doser_type: DoserType::Linear,
            output_activation: OutputActivation::Linear,
            autoencoder_width: 256,
            autoencoder_depth: 2,
            adversary_width: 128,
            adversary_depth: 3,
            dosers_width: 64,
            dosers_depth: 2,
            use_batch_norm: true,
            use_layer_norm: false,
            dropout_rate: 0.,
            variational: false,
        }
    }
}

impl CpaConfig {
    /// Parse a JSON document; unknown likelihood or doser names are
    /// rejected here rather than later in training.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.n_latent == 0 {
            anyhow::bail!("n_latent must be positive");
        }
        if self.autoencoder_depth == 0 || self.adversary_depth == 0 || self.dosers_depth == 0 {
            anyhow::bail!("network depths must be at least 1");
        }
        if self.autoencoder_width == 0 || self.adversary_width == 0 || self.dosers_width == 0 {
            anyhow::bail!("network widths must be positive");
        }
        if !(0.0..1.0).contains(&self.dropout_rate) {
            anyhow::bail!("dropout rate must be in [0, 1): {}", self.dropout_rate);
        }
        Ok(())
    }

    pub fn autoencoder_layers(&self) -> FcConfig {
        FcConfig {
            n_hidden: self.autoencoder_width,
            n_layers: self.autoencoder_depth,
            use_batch_norm: self.use_batch_norm,
            use_layer_norm: self.use_layer_norm,
            dropout_rate: self.dropout_rate,
        }
    }

    pub fn adversary_layers(&self) -> FcConfig {
        FcConfig {
            n_hidden: self.adversary_width,
            n_layers: self.adversary_depth,
            use_batch_norm: self.use_batch_norm,
            use_layer_norm: self.use_layer_norm,
            dropout_rate: self.dropout_rate,
        }
    }
}
