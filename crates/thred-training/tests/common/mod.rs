//! Scripted execution contexts for exercising the training loop.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use thred_training::summary::SummaryEvent;
use thred_training::{
    Checkpoint, ContextKind, DecodeOptions, Decoded, EvalContext, ExecutionContext, InferContext,
    InferOutput, ModelFactory, RunConfig, StepOutcome, StepStats, Summary, TrainContext,
    TrainingError, TrainingResult,
};

/// Everything the fakes observed, shared across the three contexts.
#[derive(Debug, Default)]
pub struct Journal {
    pub closed: Vec<ContextKind>,
    pub resets: Vec<u64>,
    pub restores: Vec<(ContextKind, Option<u64>)>,
    pub saves: Vec<u64>,
    pub decoded_inputs: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Script {
    pub batches_per_epoch: u64,
    /// Mean per-example loss returned by every step.
    pub loss: f64,
    /// Dev perplexities returned by successive evaluations; the last repeats.
    pub dev_ppls: Vec<f64>,
    pub test_ppl: f64,
    /// Steps whose reported global step is forced to this value.
    pub rewind_to: Option<(u64, u64)>,
    pub fail_eval: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            batches_per_epoch: 3,
            loss: 1.0,
            dev_ppls: vec![10.0],
            test_ppl: 7.5,
            rewind_to: None,
            fail_eval: false,
        }
    }
}

#[derive(Clone, Default)]
pub struct ScriptedFactory {
    pub script: Script,
    pub journal: Rc<RefCell<Journal>>,
}

impl ScriptedFactory {
    pub fn new(script: Script) -> Self {
        Self { script, journal: Rc::new(RefCell::new(Journal::default())) }
    }
}

fn read_step(checkpoint: Option<&Checkpoint>) -> TrainingResult<u64> {
    let Some(checkpoint) = checkpoint else {
        return Ok(0);
    };
    let path = &checkpoint.paths()[0];
    let text = std::fs::read_to_string(path)?;
    text.trim()
        .parse()
        .map_err(|e| TrainingError::Checkpoint(format!("bad fake checkpoint: {e}")))
}

pub struct FakeTrain {
    script: Script,
    journal: Rc<RefCell<Journal>>,
    global_step: u64,
    cursor: u64,
    batch_size: u32,
}

impl ExecutionContext for FakeTrain {
    fn kind(&self) -> ContextKind {
        ContextKind::Train
    }

    fn restore(&mut self, checkpoint: Option<&Checkpoint>) -> TrainingResult<u64> {
        self.global_step = read_step(checkpoint)?;
        self.journal
            .borrow_mut()
            .restores
            .push((ContextKind::Train, checkpoint.map(|c| c.global_step)));
        Ok(self.global_step)
    }

    fn close(&mut self) -> TrainingResult<()> {
        self.journal.borrow_mut().closed.push(ContextKind::Train);
        Ok(())
    }
}

impl TrainContext for FakeTrain {
    fn learning_rate(&self) -> f64 {
        0.5
    }

    fn reset_iterator(&mut self, skip_count: u64) -> TrainingResult<()> {
        self.journal.borrow_mut().resets.push(skip_count);
        self.cursor = skip_count / u64::from(self.batch_size);
        Ok(())
    }

    fn step(&mut self) -> TrainingResult<StepOutcome> {
        if self.cursor >= self.script.batches_per_epoch {
            return Ok(StepOutcome::EpochExhausted);
        }
        self.cursor += 1;
        self.global_step += 1;

        let mut reported = self.global_step;
        if let Some((at, to)) = self.script.rewind_to {
            if self.global_step == at {
                reported = to;
            }
        }

        Ok(StepOutcome::Advanced(StepStats {
            loss: self.script.loss,
            batch_size: self.batch_size,
            predict_count: u64::from(self.batch_size),
            word_count: u64::from(self.batch_size) * 3,
            grad_norm: 1.0,
            learning_rate: 0.5,
            global_step: reported,
            summary: Some(Summary::scalar("loss", self.script.loss)),
        }))
    }

    fn save(&mut self, prefix: &Path, global_step: u64) -> TrainingResult<Vec<PathBuf>> {
        let path = PathBuf::from(format!("{}-{}.txt", prefix.display(), global_step));
        std::fs::write(&path, global_step.to_string())?;
        self.journal.borrow_mut().saves.push(global_step);
        Ok(vec![path])
    }
}

pub struct FakeEval {
    script: Script,
    journal: Rc<RefCell<Journal>>,
    queue: VecDeque<f64>,
    last: f64,
}

impl ExecutionContext for FakeEval {
    fn kind(&self) -> ContextKind {
        ContextKind::Eval
    }

    fn restore(&mut self, checkpoint: Option<&Checkpoint>) -> TrainingResult<u64> {
        self.journal
            .borrow_mut()
            .restores
            .push((ContextKind::Eval, checkpoint.map(|c| c.global_step)));
        read_step(checkpoint)
    }

    fn close(&mut self) -> TrainingResult<()> {
        self.journal.borrow_mut().closed.push(ContextKind::Eval);
        Ok(())
    }
}

impl EvalContext for FakeEval {
    fn perplexity(&mut self, data: &Path) -> TrainingResult<f64> {
        if self.script.fail_eval {
            return Err(TrainingError::session(ContextKind::Eval, "device lost"));
        }
        if data.file_name().is_some_and(|n| n.to_string_lossy().starts_with("test")) {
            return Ok(self.script.test_ppl);
        }
        if let Some(next) = self.queue.pop_front() {
            self.last = next;
        }
        Ok(self.last)
    }
}

pub struct FakeInfer {
    journal: Rc<RefCell<Journal>>,
    beam_width: u32,
}

impl ExecutionContext for FakeInfer {
    fn kind(&self) -> ContextKind {
        ContextKind::Infer
    }

    fn restore(&mut self, checkpoint: Option<&Checkpoint>) -> TrainingResult<u64> {
        self.journal
            .borrow_mut()
            .restores
            .push((ContextKind::Infer, checkpoint.map(|c| c.global_step)));
        read_step(checkpoint)
    }

    fn close(&mut self) -> TrainingResult<()> {
        self.journal.borrow_mut().closed.push(ContextKind::Infer);
        Ok(())
    }
}

impl InferContext for FakeInfer {
    fn decode(
        &mut self,
        inputs: &[String],
        options: &DecodeOptions,
    ) -> TrainingResult<InferOutput> {
        let mut outputs = Vec::with_capacity(inputs.len());
        for input in inputs {
            self.journal.borrow_mut().decoded_inputs.push(input.clone());
            let last = input.split('\t').next().unwrap_or_default();
            if options.use_beam {
                let beam = (0..self.beam_width).map(|i| format!("beam{i} {last}")).collect();
                outputs.push(Decoded::Beam(beam));
            } else {
                let direct = (0..options.n_responses).map(|i| format!("out{i} {last}")).collect();
                outputs.push(Decoded::Direct(direct));
            }
        }
        Ok(InferOutput { outputs, summary: Some(Summary::scalar("decode_len", 2.0)) })
    }
}

impl ModelFactory for ScriptedFactory {
    type Train = FakeTrain;
    type Eval = FakeEval;
    type Infer = FakeInfer;

    fn create_train(&self, config: &RunConfig) -> TrainingResult<FakeTrain> {
        Ok(FakeTrain {
            script: self.script.clone(),
            journal: self.journal.clone(),
            global_step: 0,
            cursor: 0,
            batch_size: config.batch_size,
        })
    }

    fn create_eval(&self, _config: &RunConfig) -> TrainingResult<FakeEval> {
        Ok(FakeEval {
            script: self.script.clone(),
            journal: self.journal.clone(),
            queue: self.script.dev_ppls.iter().copied().collect(),
            last: f64::NAN,
        })
    }

    fn create_infer(&self, config: &RunConfig) -> TrainingResult<FakeInfer> {
        Ok(FakeInfer { journal: self.journal.clone(), beam_width: config.beam_width })
    }
}

/// Parses an `events.jsonl` file written by the summary writer.
pub fn read_events(path: &Path) -> Vec<SummaryEvent> {
    let contents = std::fs::read_to_string(path).unwrap();
    contents.lines().map(|line| serde_json::from_str(line).unwrap()).collect()
}

/// A run config over small dialogue files inside `dir`.
pub fn run_config(dir: &Path) -> RunConfig {
    let data = dir.join("data");
    std::fs::create_dir_all(&data).unwrap();
    std::fs::write(data.join("train.txt"), "a\tb\nc\td\ne\tf\n").unwrap();
    std::fs::write(data.join("dev.txt"), "hi\thello there\nbye\tsee you\n").unwrap();
    std::fs::write(data.join("test.txt"), "one\ttwo\nthree\tfour\nfive\tsix\n").unwrap();

    RunConfig {
        model_dir: dir.join("model"),
        train_data: data.join("train.txt"),
        dev_data: data.join("dev.txt"),
        test_data: data.join("test.txt"),
        batch_size: 2,
        num_train_epochs: 2,
        steps_per_stats: 100,
        steps_per_eval: 100,
        patience: 3,
        degrade_threshold: 1.1,
        random_seed: Some(7),
        ..RunConfig::default()
    }
}
