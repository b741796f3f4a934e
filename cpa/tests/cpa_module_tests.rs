use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use cpa::cpa_batch::*;
use cpa::cpa_module::*;
use cpa::*;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

const N_GENES: usize = 10;
const N_LATENT: usize = 8;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn small_config(
    recon_loss: ReconLikelihood,
    doser_type: DoserType,
    variational: bool,
) -> CpaConfig {
    CpaConfig {
        n_latent: N_LATENT,
        recon_loss,
        doser_type,
        autoencoder_width: 16,
        autoencoder_depth: 2,
        adversary_width: 16,
        adversary_depth: 2,
        dosers_width: 8,
        dosers_depth: 2,
        variational,
        ..CpaConfig::default()
    }
}

/// 4 cells, 10 genes, drugA/drugB, at most 2 per cell, one covariate with
/// two categories
fn toy_vocab() -> anyhow::Result<CpaVocabulary> {
    let conditions = ["drugA", "drugB", "drugA+drugB", "ctrl"];
    let cell_type = ["T", "B", "T", "B"];
    CpaVocabulary::build(&conditions, "ctrl", &[("cell_type", &cell_type[..])], 2)
}

fn toy_batch(vocab: &CpaVocabulary, counts: bool, dev: &Device) -> anyhow::Result<CpaBatch> {
    let conditions = ["drugA", "drugB", "drugA+drugB", "ctrl"];
    let dosages = ["0.5", "1.0", "0.1+2.0", "1.0"];
    let cell_type = ["T", "B", "T", "B"];
    let covariates = [("cell_type", &cell_type[..])];
    let cells = vocab.encode_cells(&conditions, Some(&dosages[..]), &covariates)?;

    let x = if counts {
        Tensor::rand(0f32, 6f32, (4, N_GENES), dev)?.floor()?
    } else {
        Tensor::randn(0f32, 1f32, (4, N_GENES), dev)?
    };
    CpaBatch::from_encoded(&x, &cells, dev)
}

fn toy_model(
    config: &CpaConfig,
    varmap: &VarMap,
    dev: &Device,
) -> anyhow::Result<(CpaModule, CpaBatch)> {
    init_logger();
    let vocab = Arc::new(toy_vocab()?);
    let vb = VarBuilder::from_varmap(varmap, DType::F32, dev);
    let batch = toy_batch(&vocab, config.recon_loss.is_count_model(), dev)?;
    let model = CpaModule::new(config, vocab, N_GENES, vb)?;
    Ok((model, batch))
}

fn max_abs(x: &Tensor) -> candle_core::Result<f32> {
    x.abs()?.max_all()?.to_scalar::<f32>()
}

fn scalar(x: &Tensor) -> candle_core::Result<f32> {
    x.to_scalar::<f32>()
}

#[test]
fn end_to_end_toy_batch() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let config = small_config(ReconLikelihood::Gauss, DoserType::Linear, false);
    let (model, batch) = toy_model(&config, &varmap, &dev)?;

    let (inference, generative) = model.forward(&batch, true)?;
    let loss = model.loss(&batch, &generative)?;
    assert!(scalar(&loss)?.is_finite());
    assert_eq!(inference.latent.dims(), &[4, N_LATENT]);

    let adv = model.adversarial_loss(&batch, &inference, &generative)?;
    let keys: BTreeSet<&str> = adv.keys().collect();
    let expected: BTreeSet<&str> = [
        "adv_drugs",
        "adv_cell_type",
        "adv_loss",
        "penalty_drugs",
        "penalty_cell_type",
        "penalty_adv",
    ]
    .into_iter()
    .collect();
    assert_eq!(keys, expected);

    for (key, value) in adv.to_scalars()? {
        assert!(value.is_finite(), "{} = {}", key, value);
    }
    Ok(())
}

#[test]
fn latent_is_sum_of_parts() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    for doser in [DoserType::Linear, DoserType::Sigm, DoserType::Logsigm, DoserType::Mlp] {
        let varmap = VarMap::new();
        let config = small_config(ReconLikelihood::Gauss, doser, false);
        let (model, batch) = toy_model(&config, &varmap, &dev)?;

        let inference = model.inference(&batch, true)?;
        let parts = ((&inference.latent_basal + &inference.latent_covariates)?
            + &inference.latent_treatment)?;
        assert!(max_abs(&(&inference.latent - parts)?)? < 1e-5);
        assert!(max_abs(&inference.latent_covariates)? > 0.);
    }
    Ok(())
}

#[test]
fn padding_only_batch_has_no_treatment() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    for doser in [DoserType::Linear, DoserType::Sigm, DoserType::Logsigm, DoserType::Mlp] {
        let varmap = VarMap::new();
        let config = small_config(ReconLikelihood::Gauss, doser, false);
        let (model, batch) = toy_model(&config, &varmap, &dev)?;

        let padded = batch.with_treatment(
            Tensor::zeros((4, 2), DType::U32, &dev)?,
            Tensor::zeros((4, 2), DType::F32, &dev)?,
        );
        let inference = model.inference(&padded, false)?;
        assert_eq!(max_abs(&inference.latent_treatment)?, 0., "{:?}", doser);
    }
    Ok(())
}

#[test]
fn adversarial_totals_are_sums() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let config = small_config(ReconLikelihood::Gauss, DoserType::Sigm, false);
    let (model, batch) = toy_model(&config, &varmap, &dev)?;

    let (inference, generative) = model.forward(&batch, true)?;
    let adv = model.adversarial_loss(&batch, &inference, &generative)?.to_scalars()?;

    let adv_sum = adv["adv_drugs"] + adv["adv_cell_type"];
    let penalty_sum = adv["penalty_drugs"] + adv["penalty_cell_type"];
    assert!((adv["adv_loss"] - adv_sum).abs() < 1e-5);
    assert!((adv["penalty_adv"] - penalty_sum).abs() < 1e-5);
    assert!(adv["penalty_adv"] >= 0.);
    Ok(())
}

#[test]
fn penalty_trains_adversary_and_encoder() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let config = small_config(ReconLikelihood::Gauss, DoserType::Linear, false);
    let (model, batch) = toy_model(&config, &varmap, &dev)?;

    let (inference, generative) = model.forward(&batch, true)?;
    let adv = model.adversarial_loss(&batch, &inference, &generative)?;
    let grads = adv.penalty_adv()?.backward()?;

    {
        let data = varmap.data().lock().expect("varmap lock");
        let head = data.get("adv.drugs.out.weight").expect("drug head");
        let g = grads.get(head.as_tensor()).expect("penalty reaches the head");
        assert!(max_abs(g)? > 0.);

        let enc = data.get("encoder.out.weight").expect("encoder output layer");
        let g = grads.get(enc.as_tensor()).expect("penalty reaches the encoder");
        assert!(max_abs(g)? > 0.);
    }

    let params = ParamsAdamW {
        lr: 1e-3,
        ..Default::default()
    };
    let mut opt = AdamW::new(varmap.all_vars(), params)?;
    for _ in 0..3 {
        let (inference, generative) = model.forward(&batch, true)?;
        let adv = model.adversarial_loss(&batch, &inference, &generative)?;
        let recon = model.loss(&batch, &generative)?;
        let total = ((recon - adv.adv_loss()?)? + adv.penalty_adv()?)?;
        opt.backward_step(&total)?;
        assert!(scalar(&total)?.is_finite());
    }
    Ok(())
}

#[test]
fn count_likelihoods_use_library() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    for likelihood in [ReconLikelihood::Nb, ReconLikelihood::Zinb] {
        let varmap = VarMap::new();
        let config = small_config(likelihood, DoserType::Logsigm, false);
        let (model, batch) = toy_model(&config, &varmap, &dev)?;

        let (inference, generative) = model.forward(&batch, true)?;
        let library = inference.library.as_ref().expect("library for count models");
        assert_eq!(library.dims(), &[4, 1]);

        let loss = scalar(&model.loss(&batch, &generative)?)?;
        assert!(loss.is_finite(), "{:?}: {}", likelihood, loss);
        assert!(model.get_expression(&batch).is_err());
        assert!(model.r2_metric(&batch, &generative, None).is_err());
    }
    Ok(())
}

#[test]
fn variational_encoder_exposes_posterior() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let config = small_config(ReconLikelihood::Gauss, DoserType::Linear, true);
    let (model, batch) = toy_model(&config, &varmap, &dev)?;

    let inference = model.inference(&batch, true)?;
    let kl = model.kl_loss(&inference)?.expect("variational KL");
    assert!(scalar(&kl)? >= 0.);

    let inference = model.inference(&batch, false)?;
    let posterior = inference.posterior.as_ref().expect("posterior");
    assert_eq!(max_abs(&(&inference.latent_basal - &posterior.mean)?)?, 0.);
    assert!(posterior.std.min_all()?.to_scalar::<f32>()? > 0.);
    Ok(())
}

#[test]
fn expression_variance_is_positive() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let config = small_config(ReconLikelihood::Gauss, DoserType::Mlp, false);
    let (model, batch) = toy_model(&config, &varmap, &dev)?;

    let extreme = CpaBatch {
        x_nd: (batch.x_nd.clone() * 1e3)?,
        ..batch.clone()
    };
    let (mean, var) = model.get_expression(&extreme)?;
    assert_eq!(mean.dims(), &[4, N_GENES]);
    assert!(var.min_all()?.to_scalar::<f32>()? > 0.);

    let (_, generative) = model.forward(&batch, false)?;
    let r2 = model.r2_metric(&batch, &generative, None)?;
    assert!(r2.r2_mean.is_finite() && r2.r2_var.is_finite());
    Ok(())
}

#[test]
fn embedding_queries() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let config = small_config(ReconLikelihood::Gauss, DoserType::Sigm, false);
    let (model, _) = toy_model(&config, &varmap, &dev)?;

    let all = model.get_pert_embeddings(1.0, None)?;
    assert_eq!(all.dims(), &[model.vocab().num_perturbations(), N_LATENT]);
    // padding token
    assert_eq!(max_abs(&all.get(0)?)?, 0.);

    let one = model.get_pert_embeddings(1.0, Some("drugA"))?;
    assert_eq!(one.dims(), &[1, N_LATENT]);
    assert!(max_abs(&one)? > 0.);
    assert_eq!(max_abs(&model.get_pert_embeddings(0.0, Some("drugA"))?)?, 0.);
    assert!(model.get_pert_embeddings(1.0, Some("drugZ")).is_err());

    assert_eq!(model.get_covar_embeddings("cell_type", None)?.dims(), &[2, N_LATENT]);
    assert_eq!(model.get_covar_embeddings("cell_type", Some("T"))?.dims(), &[1, N_LATENT]);
    assert!(model.get_covar_embeddings("cell_type", Some("NK")).is_err());
    assert!(model.get_covar_embeddings("tissue", None).is_err());
    Ok(())
}

#[test]
fn counterfactual_with_observed_treatment_reproduces_prediction() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let config = small_config(ReconLikelihood::Gauss, DoserType::Linear, false);
    let (model, batch) = toy_model(&config, &varmap, &dev)?;

    let (mean, _) = model.get_expression(&batch)?;

    let same = CounterfactualTarget {
        perts_nc: batch.perts_nc.clone(),
        doses_nc: batch.doses_nc.clone(),
        covariates: None,
    };
    let pred = model.predict_counterfactual(&batch, &same)?;
    assert!(max_abs(&(pred.mean() - &mean)?)? < 1e-5);

    let vocab = model.vocab();
    let drug_b = vocab.perturbations().get("drugB").expect("drugB") as u32;
    let swapped = CounterfactualTarget {
        perts_nc: Tensor::from_vec(vec![drug_b, 0, drug_b, 0, drug_b, 0, drug_b, 0], (4, 2), &dev)?,
        doses_nc: Tensor::from_vec(vec![5f32, 0., 5., 0., 5., 0., 5., 0.], (4, 2), &dev)?,
        covariates: None,
    };
    let pred = model.predict_counterfactual(&batch, &swapped)?;
    assert_eq!(pred.mean().dims(), &[4, N_GENES]);

    let bad = CounterfactualTarget {
        perts_nc: Tensor::zeros((4, 3), DType::U32, &dev)?,
        doses_nc: Tensor::zeros((4, 3), DType::F32, &dev)?,
        covariates: None,
    };
    assert!(model.predict_counterfactual(&batch, &bad).is_err());
    Ok(())
}

#[test]
fn disentanglement_scores_are_accuracies() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let config = small_config(ReconLikelihood::Gauss, DoserType::Linear, false);
    let (model, batch) = toy_model(&config, &varmap, &dev)?;

    let inference = model.inference(&batch, false)?;
    let scores = model.disentanglement(&batch, &inference, 42)?;

    assert!(scores.basal.contains_key("drugs"));
    assert!(scores.basal.contains_key("cell_type"));
    for v in scores.basal.values().chain(scores.combined.values()) {
        assert!((0.0..=1.0).contains(v));
    }
    assert!((0.0..=1.0).contains(&scores.basal_mean));
    assert!((0.0..=1.0).contains(&scores.combined_mean));

    // same seed, same folds
    let again = model.disentanglement(&batch, &inference, 42)?;
    assert_eq!(scores, again);
    Ok(())
}

#[test]
fn batch_from_tensor_map() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let vocab = toy_vocab()?;
    let encoded = toy_batch(&vocab, false, &dev)?;

    let mut tensors = HashMap::new();
    tensors.insert(X_KEY.to_string(), encoded.x_nd.clone());
    tensors.insert(PERTURBATIONS_KEY.to_string(), encoded.perts_nc.clone());
    tensors.insert(PERTURBATIONS_DOSAGES_KEY.to_string(), encoded.doses_nc.clone());
    tensors.insert(CONDITION_KEY.to_string(), encoded.condition_n.clone());
    tensors.insert("cell_type".to_string(), encoded.covariate("cell_type")?.clone());

    let batch = CpaBatch::from_tensor_map(&tensors, &vocab)?;
    assert_eq!(batch.num_cells()?, 4);
    assert_eq!(
        batch.perts_nc.to_vec2::<u32>()?,
        encoded.perts_nc.to_vec2::<u32>()?
    );

    tensors.remove("cell_type");
    assert!(CpaBatch::from_tensor_map(&tensors, &vocab).is_err());
    Ok(())
}

#[test]
fn vocabulary_file_round_trip() -> anyhow::Result<()> {
    let vocab = toy_vocab()?;
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("vocab.json");

    vocab.write_json(&path)?;
    let back = CpaVocabulary::read_json(&path)?;
    assert_eq!(back, vocab);
    assert_eq!(back.perturbations().get("drugB"), vocab.perturbations().get("drugB"));

    let broken = r#"{
        "pert_encoder": {"<PAD>": 0, "ctrl": 0},
        "covars_encoder": {},
        "conditions": {"ctrl": 0},
        "control": "ctrl",
        "max_comb_len": 1
    }"#;
    std::fs::write(&path, broken)?;
    assert!(CpaVocabulary::read_json(&path).is_err());
    Ok(())
}

#[test]
fn reserved_covariate_name_is_rejected() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let conditions = ["drugA", "ctrl"];
    let drugs = ["x", "y"];
    let vocab = Arc::new(CpaVocabulary::build(&conditions, "ctrl", &[("drugs", &drugs[..])], 1)?);
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
    let config = small_config(ReconLikelihood::Gauss, DoserType::Linear, false);
    assert!(CpaModule::new(&config, vocab, N_GENES, vb).is_err());
    Ok(())
}

#[test]
fn counterfactual_samples_from_posterior() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let config = small_config(ReconLikelihood::Gauss, DoserType::Linear, true);
    let (model, batch) = toy_model(&config, &varmap, &dev)?;

    let same = CounterfactualTarget {
        perts_nc: batch.perts_nc.clone(),
        doses_nc: batch.doses_nc.clone(),
        covariates: None,
    };

    let samples = model.sample_counterfactual(&batch, &same, 5)?;
    assert_eq!(samples.len(), 5);
    assert!(max_abs(&(samples[0].mean() - samples[1].mean())?)? > 0.);

    let averaged = model.predict_counterfactual_mean(&batch, &same, Some(5))?;
    assert_eq!(averaged.dims(), &[4, N_GENES]);
    assert!(max_abs(&averaged)?.is_finite());

    let (mean, _) = model.get_expression(&batch)?;
    let point = model.predict_counterfactual_mean(&batch, &same, None)?;
    assert!(max_abs(&(point - mean)?)? < 1e-5);

    assert!(model.sample_counterfactual(&batch, &same, 0).is_err());
    Ok(())
}

#[test]
fn deterministic_counterfactual_has_one_sample() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let config = small_config(ReconLikelihood::Gauss, DoserType::Linear, false);
    let (model, batch) = toy_model(&config, &varmap, &dev)?;

    let same = CounterfactualTarget {
        perts_nc: batch.perts_nc.clone(),
        doses_nc: batch.doses_nc.clone(),
        covariates: None,
    };
    assert_eq!(model.sample_counterfactual(&batch, &same, 3)?.len(), 1);

    let averaged = model.predict_counterfactual_mean(&batch, &same, Some(3))?;
    let point = model.predict_counterfactual(&batch, &same)?;
    assert!(max_abs(&(averaged - point.mean())?)? < 1e-5);
    Ok(())
}

#[test]
fn r2_on_deg_masks() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let config = small_config(ReconLikelihood::Gauss, DoserType::Linear, false);
    let (model, batch) = toy_model(&config, &varmap, &dev)?;

    let genes: Vec<String> = (0..N_GENES).map(|j| format!("g{}", j)).collect();
    let categories: Vec<String> = ["T_drugA", "B_drugB", "T_drugA+drugB", "B_ctrl"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let ranked = |names: &[&str]| names.iter().map(|g| g.to_string()).collect::<Vec<_>>();
    let mut deg = HashMap::new();
    deg.insert("T_drugA".to_string(), ranked(&["g1", "g3", "g5"]));
    deg.insert("B_drugB".to_string(), ranked(&["g2", "g4", "g6", "g8"]));
    let masks = cpa::deg_mask::build_deg_masks(&genes, &deg, &categories, 2);

    let (_, generative) = model.forward(&batch, false)?;
    let r2 = model.r2_metric_deg(&batch, &generative, &masks, &categories)?;
    assert_eq!(r2.categories.len(), 4);
    for scores in [r2.all, r2.deg, r2.top_deg] {
        assert!(scores.r2_mean.is_finite() && scores.r2_var.is_finite());
    }
    assert!(model
        .r2_metric_deg(&batch, &generative, &masks, &categories[..2])
        .is_err());

    let varmap = VarMap::new();
    let config = small_config(ReconLikelihood::Nb, DoserType::Linear, false);
    let (model, batch) = toy_model(&config, &varmap, &dev)?;
    let (_, generative) = model.forward(&batch, false)?;
    assert!(model
        .r2_metric_deg(&batch, &generative, &masks, &categories)
        .is_err());
    Ok(())
}
