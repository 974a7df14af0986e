// End-to-end tests: sampler -> batch -> model -> optimizer -> full-sort scoring.
//
// Uses the tiny config with dropout off so loss curves are deterministic
// given the parameter init.

use candle_core::Device;
use candle_nn::VarMap;
use fissa::config::{FissaConfig, SamplerConfig};
use fissa::dataset::{Dataset, InteractionTable};
use fissa::fissa::{Fissa, Interaction};
use fissa::loss::LossType;
use fissa::sampler::Sampler;
use fissa::training::{attach_negatives, Trainer, TrainingConfig};
use fissa::Error;

const N_ITEMS: usize = 12;

fn histories() -> (Vec<Vec<usize>>, Vec<usize>) {
    let sequences = vec![vec![1, 2, 3], vec![4, 5], vec![7, 8, 9, 10]];
    let targets = vec![4, 6, 11];
    (sequences, targets)
}

fn build(loss_type: &str) -> anyhow::Result<(Fissa, VarMap, Device)> {
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let cfg = FissaConfig::tiny()
        .with_loss_type(loss_type)
        .with_dropout(0.0, 0.0);
    let model = Fissa::new(cfg, N_ITEMS, &varmap, &device)?;
    Ok((model, varmap, device))
}

fn train_table() -> InteractionTable {
    let (sequences, targets) = histories();
    let mut pairs = Vec::new();
    for (user, (seq, &target)) in sequences.iter().zip(&targets).enumerate() {
        pairs.extend(seq.iter().map(|&item| (user, item)));
        pairs.push((user, target));
    }
    InteractionTable::from_pairs(sequences.len(), N_ITEMS, &pairs)
}

#[test]
fn test_listwise_training_reduces_loss_and_ranks_target_first() -> anyhow::Result<()> {
    let (model, varmap, device) = build("CE")?;
    assert_eq!(model.loss_type(), LossType::Listwise);
    let mut trainer = Trainer::new(
        &varmap,
        TrainingConfig {
            lr: 1e-2,
            ..TrainingConfig::default()
        },
    )?;

    let (sequences, targets) = histories();
    let batch = Interaction::from_sequences(&sequences, 6, &device)?.with_pos_items(&targets)?;

    let first = trainer.train_step(&model, &batch)?;
    let mut last = first;
    for _ in 0..99 {
        last = trainer.train_step(&model, &batch)?;
    }
    assert_eq!(trainer.step_count(), 100);
    assert!(last < first, "loss should fall: {first} -> {last}");

    let scores = model.full_sort_predict(&batch)?;
    assert_eq!(scores.dims2()?, (3, N_ITEMS));
    let top = scores.argmax(1)?.to_vec1::<u32>()?;
    let top: Vec<usize> = top.into_iter().map(|i| i as usize).collect();
    assert_eq!(top, targets, "memorised batch should rank its targets first");
    Ok(())
}

#[test]
fn test_pairwise_training_with_sampled_negatives() -> anyhow::Result<()> {
    let (model, varmap, device) = build("BPR")?;
    let table = train_table();
    let mut sampler = Sampler::for_phase(&SamplerConfig::seeded(42), "train", &table, "popularity")?;
    let mut trainer = Trainer::new(
        &varmap,
        TrainingConfig {
            lr: 1e-2,
            ..TrainingConfig::default()
        },
    )?;

    let (sequences, targets) = histories();
    let user_ids = [0, 1, 2];
    let mut losses = Vec::new();
    for _ in 0..60 {
        let batch = Interaction::from_sequences(&sequences, 6, &device)?.with_pos_items(&targets)?;
        let batch = attach_negatives(&mut sampler, "train", &user_ids, batch)?;

        let negatives = batch.neg_items.as_ref().unwrap().to_vec1::<u32>()?;
        for (&user, &neg) in user_ids.iter().zip(&negatives) {
            let seen = sampler.used_item_ids("train", user).unwrap();
            assert!(!seen.contains(&(neg as usize)), "user {user} got seen item {neg}");
            assert_ne!(neg, 0, "padding id sampled");
        }

        losses.push(trainer.train_step(&model, &batch)?);
    }

    assert!(losses.iter().all(|l| l.is_finite()));
    let head: f32 = losses[..5].iter().sum::<f32>() / 5.0;
    let tail: f32 = losses[losses.len() - 5..].iter().sum::<f32>() / 5.0;
    assert!(tail < head, "BPR loss should fall: {head} -> {tail}");
    Ok(())
}

#[test]
fn test_phases_accumulate_history() -> anyhow::Result<()> {
    let train = InteractionTable::from_pairs(2, 8, &[(0, 1), (0, 2), (1, 3)]);
    let valid = InteractionTable::from_pairs(2, 8, &[(0, 4), (1, 5)]);
    let test = InteractionTable::from_pairs(2, 8, &[(0, 6), (1, 7)]);
    let datasets: [&dyn Dataset; 3] = [&train, &valid, &test];
    let mut sampler = Sampler::new(
        &SamplerConfig::seeded(3),
        &["train", "valid", "test"],
        &datasets,
        "uniform",
    )?;

    let negatives = sampler.sample_by_user_ids("test", &[0], 20)?;
    for neg in negatives {
        assert!(![0, 1, 2, 4, 6].contains(&neg), "user 0 drew {neg} in test phase");
    }

    let err = sampler.sample_by_user_ids("holdout", &[0], 1).unwrap_err();
    assert!(matches!(err, Error::PhaseNotFound(_)));
    Ok(())
}

#[test]
fn test_predict_agrees_with_full_sort_on_candidates() -> anyhow::Result<()> {
    let (model, _varmap, device) = build("BPR")?;
    let (sequences, _) = histories();
    let candidates = [5, 0, 11];
    let batch = Interaction::from_sequences(&sequences, 8, &device)?.with_item_ids(&candidates)?;

    let point = model.predict(&batch)?.to_vec1::<f32>()?;
    let full = model.full_sort_predict(&batch)?.to_vec2::<f32>()?;
    for (row, &item) in candidates.iter().enumerate() {
        assert!(
            (point[row] - full[row][item]).abs() < 1e-4,
            "row {row}: predict {} vs full-sort {}",
            point[row],
            full[row][item]
        );
    }
    // The padding item embeds to zeros, so its score is exactly 0.
    assert_eq!(point[1], 0.0);
    Ok(())
}

#[test]
fn test_config_file_drives_model() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("fissa.json");
    std::fs::write(
        &path,
        r#"{"n_layers": 1, "n_heads": 2, "hidden_size": 8, "inner_size": 16,
            "max_seq_length": 5, "loss_type": "BPR"}"#,
    )?;
    let cfg = FissaConfig::from_json_file(&path)?;
    let device = fissa::config::select_device(&cfg.device)?;
    let varmap = VarMap::new();
    let model = Fissa::new(cfg, N_ITEMS, &varmap, &device)?;
    assert_eq!(model.loss_type(), LossType::Pairwise);
    assert_eq!(model.config().hidden_size, 8);
    assert_eq!(model.n_items(), N_ITEMS);
    Ok(())
}
