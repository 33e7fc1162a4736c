//! The training loop.
//!
//! Each iteration runs one optimization step, then checks the statistics and
//! evaluation cadences. An exhausted training iterator is an epoch boundary,
//! not an error: it triggers a sample decode, advances the epoch and rewinds
//! the iterator. The loop stops when the epoch budget is spent, when patience
//! runs out, or when training perplexity overflows. Every exit saves a final
//! checkpoint, and every context is closed on every exit path.

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::RunConfig;
use crate::context::{
    ContextKind, EvalContext, ExecutionContext, ModelFactory, Session, StepOutcome, TrainContext,
};
use crate::dataset::{DialogueExample, load_dialogues};
use crate::error::{TrainingError, TrainingResult};
use crate::final_eval::{TestReport, evaluate_checkpoint_dir, infer_model_dir, run_test};
use crate::log::RunLog;
use crate::progress::{ProgressEvent, ProgressSink};
use crate::sample::{SampleDecode, sample_decode};
use crate::stats::StatsAccumulator;
use crate::summary::{JsonlSummaryWriter, SummaryWriter};
use chrono::Utc;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TerminationReason {
    EpochsCompleted,
    PatienceExhausted,
    NumericalOverflow { train_ppl: f64 },
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EpochsCompleted => f.write_str("epochs completed"),
            Self::PatienceExhausted => f.write_str("patience exhausted"),
            Self::NumericalOverflow { train_ppl } => {
                write!(f, "numerical overflow (train ppl {train_ppl})")
            }
        }
    }
}

/// Outcome of comparing a dev perplexity with the best so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevVerdict {
    Improved,
    Degraded,
    /// Worse than the best but within `degrade_threshold`.
    Unchanged,
}

/// Applies the early-stopping policy to `config`.
///
/// Improvement restores full patience; a perplexity above
/// `degrade_threshold * best_dev_ppl` costs one unit of patience. Anything in
/// between leaves both the best value and patience alone.
pub fn judge_dev_ppl(config: &mut RunConfig, dev_ppl: f64) -> DevVerdict {
    if dev_ppl < config.best_dev_ppl {
        config.best_dev_ppl = dev_ppl;
        config.reset_patience();
        DevVerdict::Improved
    } else if dev_ppl > config.degrade_threshold * config.best_dev_ppl {
        config.decrement_patience();
        DevVerdict::Degraded
    } else {
        DevVerdict::Unchanged
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainReport {
    pub termination: TerminationReason,
    pub global_step: u64,
    pub epoch: u32,
    pub train_ppl: f64,
    pub best_dev_ppl: f64,
    pub final_checkpoint: Checkpoint,
    pub test: Option<TestReport>,
}

/// Drives a hierarchical encoder-decoder through training and testing.
pub struct HierarchicalTrainer<F: ModelFactory> {
    config: RunConfig,
    factory: F,
    rng: StdRng,
}

impl<F: ModelFactory> HierarchicalTrainer<F> {
    pub fn new(config: RunConfig, factory: F) -> Self {
        let rng = match config.random_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { config, factory, rng }
    }

    #[must_use]
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn test(&self) -> TrainingResult<TestReport> {
        run_test(&self.config, &self.factory)
    }

    pub fn train(&mut self, progress: &dyn ProgressSink) -> TrainingResult<TrainReport> {
        self.config.validate_for_train()?;

        let layout = self.config.layout();
        layout.ensure_dirs()?;
        let mut log = RunLog::open(&layout.log_path(Utc::now().timestamp()))?;
        log.print(&format!("# log_file={}", log.path().display()));

        self.factory.prepare(&self.config)?;
        let mut train = Session::new(self.factory.create_train(&self.config)?);
        let mut eval = Session::new(self.factory.create_eval(&self.config)?);
        let mut infer = Session::new(self.factory.create_infer(&self.config)?);

        // Preload data for sample decoding.
        let dev_set = load_dialogues(&self.config.dev_data)?;
        if dev_set.is_empty() {
            return Err(TrainingError::Dataset(format!(
                "dev set {} has no examples",
                self.config.dev_data.display()
            )));
        }
        self.config.dev_size = (dev_set.len() as u64).div_ceil(u64::from(self.config.batch_size));
        self.config.save()?;

        let store =
            CheckpointStore::new(layout.root().to_path_buf(), self.config.max_checkpoints_to_keep);
        let best_store = CheckpointStore::new(layout.best_dev_ppl_dir(), 1);
        let mut summary = JsonlSummaryWriter::create(&layout.summary_dir())?;

        let mut global_step = train.restore(store.latest()?.as_ref())?;
        let mut last_stats_step = global_step;
        let mut last_eval_step = global_step;

        let mut stats = StatsAccumulator::new();
        let (mut train_ppl, mut speed, mut avg_step_time) = (0.0, 0.0, 0.0);
        let start_train_time = Instant::now();

        let skip_count = u64::from(self.config.batch_size) * self.config.epoch_step;
        let lr = train.learning_rate();
        log.print(&format!(
            "# Starting step {}/{} (skipping {} elements), epoch {}/{}, lr {:.6}, {}",
            global_step,
            self.config.num_train_steps,
            skip_count,
            self.config.epoch,
            self.config.num_train_epochs,
            lr,
            ctime()
        ));
        if self.config.patience_left() == 0 && self.config.epoch < self.config.num_train_epochs {
            warn!(
                run_id = %self.config.run_id,
                epoch = self.config.epoch,
                "Resumed run has no patience left; raise num_train_epochs to keep training"
            );
        }
        train.reset_iterator(skip_count)?;

        progress.on_event(ProgressEvent::Started {
            run_id: self.config.run_id.clone(),
            global_step,
            total_steps: self.config.num_train_steps,
            epoch: self.config.epoch,
            num_epochs: self.config.num_train_epochs,
            learning_rate: lr,
            best_dev_ppl: self.config.best_dev_ppl,
        });

        let termination = loop {
            if self.config.epoch >= self.config.num_train_epochs {
                break TerminationReason::EpochsCompleted;
            }
            if self.config.patience_left() == 0 {
                break TerminationReason::PatienceExhausted;
            }

            let step_start = Instant::now();
            let step = match train.step()? {
                StepOutcome::Advanced(step) => {
                    self.config.epoch_step += 1;
                    step
                }
                StepOutcome::EpochExhausted => {
                    let eval_start = Instant::now();
                    self.run_sample_decode(
                        &mut *infer,
                        &store,
                        &dev_set,
                        &mut summary,
                        &mut log,
                        global_step,
                    )?;
                    log.print(&format!(
                        "## Done epoch {} in {} steps. step {} @ eval time: {:.2}s",
                        self.config.epoch,
                        self.config.epoch_step,
                        global_step,
                        eval_start.elapsed().as_secs_f64()
                    ));

                    self.config.epoch += 1;
                    self.config.epoch_step = 0;
                    self.config.save()?;
                    progress.on_event(ProgressEvent::Epoch {
                        run_id: self.config.run_id.clone(),
                        epoch: self.config.epoch,
                        num_epochs: self.config.num_train_epochs,
                    });

                    train.reset_iterator(0)?;
                    continue;
                }
            };

            if step.global_step < global_step {
                return Err(TrainingError::session(
                    ContextKind::Train,
                    format!("global step went backwards: {} -> {}", global_step, step.global_step),
                ));
            }
            stats.update(&step, step_start.elapsed());
            global_step = step.global_step;
            if let Some(step_summary) = &step.summary {
                summary.add_summary(global_step, step_summary)?;
            }

            if global_step - last_stats_step >= self.config.steps_per_stats {
                let report = stats.report();
                train_ppl = report.train_ppl;
                speed = report.speed;
                avg_step_time = report.avg_step_time;

                log.print(&format!(
                    "  global step {} lr {:e} step-time {:.2}s wps {:.2}K ppl {:.2} gN {:.2} best_dev_ppl {:.2}, {}",
                    global_step,
                    step.learning_rate,
                    report.avg_step_time,
                    report.speed,
                    report.train_ppl,
                    report.avg_grad_norm,
                    self.config.best_dev_ppl,
                    ctime()
                ));
                progress.on_event(ProgressEvent::Stats {
                    run_id: self.config.run_id.clone(),
                    global_step,
                    advanced: global_step - last_stats_step,
                    learning_rate: step.learning_rate,
                    words_per_sec_k: report.speed,
                    train_ppl: report.train_ppl,
                    grad_norm: report.avg_grad_norm,
                    best_dev_ppl: self.config.best_dev_ppl,
                });
                last_stats_step = global_step;

                if report.is_overflow() {
                    log.print(&format!("  step {global_step} overflow, stop early"));
                    break TerminationReason::NumericalOverflow { train_ppl: report.train_ppl };
                }

                stats.reset();
            }

            if global_step - last_eval_step >= self.config.steps_per_eval {
                last_eval_step = global_step;

                log.print(&format!("# Save eval, global step {global_step}"));
                summary.add_scalar(global_step, "train_ppl", train_ppl)?;

                let files = train.save(&layout.checkpoint_prefix(), global_step)?;
                let checkpoint = store.record(global_step, &files)?;

                self.run_sample_decode(
                    &mut *infer,
                    &store,
                    &dev_set,
                    &mut summary,
                    &mut log,
                    global_step,
                )?;
                let dev_ppl = run_internal_eval(
                    &self.config,
                    &mut *eval,
                    &store,
                    &mut summary,
                    &mut log,
                    global_step,
                )?;

                match judge_dev_ppl(&mut self.config, dev_ppl) {
                    DevVerdict::Improved => {
                        best_store.import(&checkpoint)?;
                        log.print(&format!(
                            "    **** Best model so far @Ep {} @step {} (global {}) dev_ppl {:.3}",
                            self.config.epoch, self.config.epoch_step, global_step, dev_ppl
                        ));
                    }
                    DevVerdict::Degraded => {
                        log.print(&format!(
                            "    PPL got worse @Ep {} @step {} (global {}) patience {} dev_ppl {:.3} best_dev_ppl {:.3}",
                            self.config.epoch,
                            self.config.epoch_step,
                            global_step,
                            self.config.patience_left(),
                            dev_ppl,
                            self.config.best_dev_ppl
                        ));
                    }
                    DevVerdict::Unchanged => {
                        debug!(
                            global_step,
                            dev_ppl,
                            best_dev_ppl = self.config.best_dev_ppl,
                            "Dev ppl within threshold"
                        );
                    }
                }

                self.config.save()?;
            }
        };

        // Done training
        let files = train.save(&layout.checkpoint_prefix(), global_step)?;
        let final_checkpoint = store.record(global_step, &files)?;

        match termination {
            TerminationReason::EpochsCompleted => info!(global_step, "Training finished"),
            _ => warn!(global_step, reason = %termination, "Training stopped early"),
        }
        log.print(&format!(
            "# Final, step {} ep {}/{} lr {:.6} step-time {:.2} wps {:.2}K train_ppl {:.3} best_dev_ppl {:.3}, {}",
            global_step,
            self.config.epoch,
            self.config.epoch_step,
            train.learning_rate(),
            avg_step_time,
            speed,
            train_ppl,
            self.config.best_dev_ppl,
            ctime()
        ));
        log.print(&format!("# Stopped: {termination}"));
        log.print_time("# Done training!", start_train_time);

        let test = if self.config.eval_best_model {
            log.print("Evaluating the best model begins...");
            let model_dir = infer_model_dir(&self.config)?;
            let label = format!("{}_final", self.config.test_name());
            let report = evaluate_checkpoint_dir(
                &self.config,
                &model_dir,
                &mut *infer,
                &mut *eval,
                &label,
                &mut log,
            )?;
            summary.add_scalar(global_step, "test_ppl", report.test_ppl)?;
            log.print(&format!(
                "# test_ppl {:.3} w. beam_width: {} | length_penalty: {:.1} | sampling_temperature: {:.1}",
                report.test_ppl,
                self.config.beam_width,
                self.config.length_penalty_weight,
                self.config.sampling_temperature
            ));
            Some(report)
        } else {
            None
        };

        summary.close()?;
        eval.close()?;
        infer.close()?;
        train.close()?;
        log.flush()?;

        progress.on_event(ProgressEvent::Finished {
            run_id: self.config.run_id.clone(),
            global_step,
        });

        Ok(TrainReport {
            termination,
            global_step,
            epoch: self.config.epoch,
            train_ppl,
            best_dev_ppl: self.config.best_dev_ppl,
            final_checkpoint,
            test,
        })
    }

    fn run_sample_decode(
        &mut self,
        infer: &mut F::Infer,
        store: &CheckpointStore,
        dev_set: &[DialogueExample],
        summary: &mut dyn SummaryWriter,
        log: &mut RunLog,
        global_step: u64,
    ) -> TrainingResult<SampleDecode> {
        infer.restore(store.latest()?.as_ref())?;
        let use_beam = self.config.uses_beam();
        sample_decode(infer, dev_set, use_beam, &mut self.rng, summary, log, global_step)
    }
}

/// Dev perplexity of the latest checkpoint.
fn run_internal_eval<E: EvalContext + ?Sized>(
    config: &RunConfig,
    eval: &mut E,
    store: &CheckpointStore,
    summary: &mut dyn SummaryWriter,
    log: &mut RunLog,
    global_step: u64,
) -> TrainingResult<f64> {
    eval.restore(store.latest()?.as_ref())?;
    let dev_ppl = eval.perplexity(&config.dev_data)?;
    summary.add_scalar(global_step, "dev_ppl", dev_ppl)?;
    log.print(&format!("  eval dev: perplexity {dev_ppl:.2}"));
    Ok(dev_ppl)
}

fn ctime() -> String {
    chrono::Local::now().format("%a %b %e %T %Y").to_string()
}
