//! Test-set decoding and scoring of a saved checkpoint.

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::RunConfig;
use crate::context::{
    ContextKind, DecodeOptions, EvalContext, InferContext, ModelFactory, Session,
};
use crate::dataset::load_dialogues;
use crate::error::{TrainingError, TrainingResult};
use crate::log::RunLog;
use chrono::Utc;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub struct TestReport {
    pub checkpoint_step: u64,
    pub label: String,
    pub output_path: PathBuf,
    pub num_inputs: usize,
    pub test_ppl: f64,
}

/// Label for decode outputs: `<test>_t<temp>` when sampling, else
/// `<test>_bw<beam>_lp<penalty>`.
#[must_use]
pub fn decode_label(config: &RunConfig) -> String {
    if config.sampling_temperature > 0.0 {
        format!("{}_t{:.1}", config.test_name(), config.sampling_temperature)
    } else {
        format!(
            "{}_bw{}_lp{:.1}",
            config.test_name(),
            config.beam_width,
            config.length_penalty_weight
        )
    }
}

/// Directory inference should load from: the best-model directory once it
/// holds a checkpoint, the model directory otherwise.
pub fn infer_model_dir(config: &RunConfig) -> TrainingResult<PathBuf> {
    let layout = config.layout();
    let best = layout.best_dev_ppl_dir();
    if CheckpointStore::new(best.clone(), 0).latest()?.is_some() {
        Ok(best)
    } else {
        Ok(layout.root().to_path_buf())
    }
}

fn latest_checkpoint(model_dir: &Path) -> TrainingResult<Checkpoint> {
    let checkpoint = CheckpointStore::new(model_dir.to_path_buf(), 0).latest()?.ok_or_else(|| {
        TrainingError::Checkpoint(format!("no checkpoint found in {}", model_dir.display()))
    })?;
    checkpoint.verify()?;
    Ok(checkpoint)
}

/// Decodes the whole test set with `n_responses` candidates per input and
/// writes them to `<model_dir>/<label>.out`, `n_responses` lines per input.
pub fn decode_test_set<I>(
    config: &RunConfig,
    checkpoint: &Checkpoint,
    infer: &mut I,
    label: &str,
    log: &mut RunLog,
) -> TrainingResult<(PathBuf, usize)>
where
    I: InferContext + ?Sized,
{
    infer.restore(Some(checkpoint))?;

    log.print("# Start decoding");
    log.print(&format!("  beam width: {}", config.beam_width));
    log.print(&format!("  length penalty: {}", config.length_penalty_weight));
    log.print(&format!("  sampling temperature: {}", config.sampling_temperature));
    log.print(&format!("  num responses per tests instance: {}", config.n_responses));

    let inputs: Vec<String> =
        load_dialogues(&config.test_data)?.into_iter().map(|ex| ex.raw).collect();
    let options = DecodeOptions {
        batch_size: config.infer_batch_size,
        n_responses: config.n_responses,
        use_beam: config.beam_width > 0,
    };
    let wanted = config.n_responses as usize;

    let output_path = config.layout().decode_output_path(label);
    let mut out = std::io::BufWriter::new(std::fs::File::create(&output_path)?);

    for chunk in inputs.chunks(config.infer_batch_size.max(1) as usize) {
        let output = infer.decode(chunk, &options)?;
        if output.outputs.len() != chunk.len() {
            return Err(TrainingError::session(
                ContextKind::Infer,
                format!("decoded {} outputs for {} inputs", output.outputs.len(), chunk.len()),
            ));
        }
        for decoded in &output.outputs {
            let candidates = decoded.candidates();
            if candidates.len() < wanted {
                return Err(TrainingError::session(
                    ContextKind::Infer,
                    format!("got {} candidates, expected {}", candidates.len(), wanted),
                ));
            }
            for response in &candidates[..wanted] {
                writeln!(out, "{response}")?;
            }
        }
    }
    out.flush()?;

    log.print(&format!("  decoded {} inputs to {}", inputs.len(), output_path.display()));
    Ok((output_path, inputs.len()))
}

/// Test-set perplexity of `checkpoint`.
pub fn score_test_set<E>(
    config: &RunConfig,
    checkpoint: &Checkpoint,
    eval: &mut E,
    log: &mut RunLog,
) -> TrainingResult<f64>
where
    E: EvalContext + ?Sized,
{
    eval.restore(Some(checkpoint))?;
    log.print("# Compute Perplexity");
    let test_ppl = eval.perplexity(&config.test_data)?;
    log.print(&format!("  test: perplexity {test_ppl:.2}"));
    Ok(test_ppl)
}

/// Decodes and scores the latest checkpoint in `model_dir` with already open
/// contexts.
pub fn evaluate_checkpoint_dir<I, E>(
    config: &RunConfig,
    model_dir: &Path,
    infer: &mut I,
    eval: &mut E,
    label: &str,
    log: &mut RunLog,
) -> TrainingResult<TestReport>
where
    I: InferContext + ?Sized,
    E: EvalContext + ?Sized,
{
    let checkpoint = latest_checkpoint(model_dir)?;
    let (output_path, num_inputs) = decode_test_set(config, &checkpoint, infer, label, log)?;
    let test_ppl = score_test_set(config, &checkpoint, eval, log)?;
    Ok(TestReport {
        checkpoint_step: checkpoint.global_step,
        label: label.to_string(),
        output_path,
        num_inputs,
        test_ppl,
    })
}

/// Standalone test run: fresh infer and eval contexts over the latest
/// checkpoint of the inference model directory.
pub fn run_test<F: ModelFactory>(config: &RunConfig, factory: &F) -> TrainingResult<TestReport> {
    let start = Instant::now();
    config.validate_for_test()?;

    let layout = config.layout();
    let mut log = RunLog::open(&layout.log_path(Utc::now().timestamp()))?;

    factory.prepare(config)?;
    let model_dir = infer_model_dir(config)?;
    let checkpoint = latest_checkpoint(&model_dir)?;
    let label = decode_label(config);

    let mut infer = Session::new(factory.create_infer(config)?);
    let (output_path, num_inputs) =
        decode_test_set(config, &checkpoint, &mut *infer, &label, &mut log)?;
    infer.close()?;
    log.print_time("# Decoding done", start);

    let mut eval = Session::new(factory.create_eval(config)?);
    let test_ppl = score_test_set(config, &checkpoint, &mut *eval, &mut log)?;
    eval.close()?;

    log.print_time("# Test finished", start);
    log.flush()?;

    Ok(TestReport {
        checkpoint_step: checkpoint.global_step,
        label,
        output_path,
        num_inputs,
        test_ppl,
    })
}
