//! Status command implementation.

use super::{finite, load_run};
use anyhow::Result;
use colored::Colorize;
use serde_json::json;
use std::path::Path;
use thred_training::CheckpointStore;

/// Shows the persisted progress of the run in `model_dir`.
pub fn execute(model_dir: &Path, json_output: bool) -> Result<()> {
    let config = load_run(model_dir)?;
    let layout = config.layout();
    let checkpoints = CheckpointStore::new(layout.root().to_path_buf(), 0).list()?;
    let best = CheckpointStore::new(layout.best_dev_ppl_dir(), 0).latest()?;

    if json_output {
        let out = json!({
            "run_id": config.run_id.to_string(),
            "model_dir": layout.root(),
            "epoch": config.epoch,
            "epoch_step": config.epoch_step,
            "num_train_epochs": config.num_train_epochs,
            "best_dev_ppl": finite(config.best_dev_ppl),
            "patience_left": config.patience_left(),
            "checkpoints": checkpoints.iter().map(|c| c.global_step).collect::<Vec<_>>(),
            "best_checkpoint": best.as_ref().map(|c| c.global_step),
            "updated_at": config.updated_at,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("{}", "thred Status".bold().cyan());
    println!();
    println!("  Run: {}", config.run_id.to_string().cyan());
    println!("  Location: {}", layout.root().display().to_string().green());
    println!(
        "  Epoch: {}/{} (step {} in epoch)",
        config.epoch, config.num_train_epochs, config.epoch_step
    );
    if config.best_dev_ppl.is_finite() {
        println!("  Best dev ppl: {}", format!("{:.3}", config.best_dev_ppl).green());
    } else {
        println!("  Best dev ppl: {}", "not evaluated yet".yellow());
    }
    println!("  Patience left: {}/{}", config.patience_left(), config.patience);
    println!("  Updated: {}", config.updated_at.to_rfc3339().dimmed());
    println!();

    println!("{}", "Checkpoints:".bold());
    if checkpoints.is_empty() {
        println!("  {}", "No checkpoints saved".yellow());
    } else {
        for checkpoint in &checkpoints {
            let marker = if best.as_ref().is_some_and(|b| b.global_step == checkpoint.global_step) {
                " (best)".green().to_string()
            } else {
                String::new()
            };
            println!("  step {}{}", checkpoint.global_step, marker);
        }
    }
    if let Some(best) = &best {
        println!("  Best dev ppl model: step {}", best.global_step.to_string().green());
    }
    println!();
    Ok(())
}
