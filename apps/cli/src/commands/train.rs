//! Training command implementation.

use super::finite;
use super::progress::BarProgressSink;
use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde_json::json;
use std::path::{Path, PathBuf};
use thred_core::BigramModelFactory;
use thred_training::{HierarchicalTrainer, RunConfig, TrainReport};

#[derive(Args, Debug, Default)]
pub struct TrainOverrides {
    /// Model directory (overrides the config file)
    #[arg(long)]
    pub model_dir: Option<PathBuf>,

    /// Epoch budget; applied after resuming so a finished run can be extended.
    /// Raising it also restores patience if the run had stopped on it.
    #[arg(long)]
    pub num_train_epochs: Option<u32>,

    #[arg(long)]
    pub steps_per_eval: Option<u64>,

    #[arg(long)]
    pub random_seed: Option<u64>,

    /// Score the best model on the test set once training ends
    #[arg(long)]
    pub eval_best_model: bool,
}

fn load_config(path: &Path, overrides: &TrainOverrides) -> Result<RunConfig> {
    let mut fresh = RunConfig::load(path)
        .with_context(|| format!("Failed to read run config: {}", path.display()))?;
    if let Some(model_dir) = &overrides.model_dir {
        fresh.model_dir.clone_from(model_dir);
    }
    if let Some(seed) = overrides.random_seed {
        fresh.random_seed = Some(seed);
    }
    if overrides.eval_best_model {
        fresh.eval_best_model = true;
    }

    let mut config = RunConfig::resume_or(fresh)?;
    if let Some(epochs) = overrides.num_train_epochs {
        config.extend_epochs(epochs);
    }
    if let Some(steps) = overrides.steps_per_eval {
        config.steps_per_eval = steps;
    }
    Ok(config)
}

pub fn execute(config_path: &Path, overrides: &TrainOverrides, json_output: bool) -> Result<()> {
    let config = load_config(config_path, overrides)?;
    let model_dir = config.model_dir.clone();

    let mut trainer = HierarchicalTrainer::new(config, BigramModelFactory);
    let sink = BarProgressSink::new(json_output);
    let report = trainer.train(&sink).context("Training failed")?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&report_json(&report, &model_dir))?);
        return Ok(());
    }

    println!();
    println!("{}", "Training complete".bold().green());
    println!("  Model dir: {}", model_dir.display().to_string().cyan());
    println!("  Stopped: {}", report.termination.to_string().yellow());
    println!("  Global step: {}", report.global_step);
    println!("  Epoch: {}", report.epoch);
    println!("  Train ppl: {:.3}", report.train_ppl);
    println!("  Best dev ppl: {:.3}", report.best_dev_ppl);
    if let Some(test) = &report.test {
        println!("  Test ppl: {:.3} (step {})", test.test_ppl, test.checkpoint_step);
        println!("  Responses: {}", test.output_path.display().to_string().dimmed());
    }
    println!();
    Ok(())
}

fn report_json(report: &TrainReport, model_dir: &Path) -> serde_json::Value {
    json!({
        "model_dir": model_dir,
        "termination": report.termination.to_string(),
        "global_step": report.global_step,
        "epoch": report.epoch,
        "train_ppl": finite(report.train_ppl),
        "best_dev_ppl": finite(report.best_dev_ppl),
        "final_checkpoint": report.final_checkpoint.global_step,
        "test": report.test.as_ref().map(|t| json!({
            "label": t.label,
            "checkpoint_step": t.checkpoint_step,
            "output_path": t.output_path,
            "num_inputs": t.num_inputs,
            "test_ppl": finite(t.test_ppl),
        })),
    })
}
