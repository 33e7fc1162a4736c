use crate::config::RunId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started {
        run_id: RunId,
        global_step: u64,
        total_steps: u64,
        epoch: u32,
        num_epochs: u32,
        learning_rate: f64,
        best_dev_ppl: f64,
    },
    Epoch { run_id: RunId, epoch: u32, num_epochs: u32 },
    Stats {
        run_id: RunId,
        global_step: u64,
        advanced: u64,
        learning_rate: f64,
        words_per_sec_k: f64,
        train_ppl: f64,
        grad_norm: f64,
        best_dev_ppl: f64,
    },
    Finished { run_id: RunId, global_step: u64 },
}

pub trait ProgressSink {
    fn on_event(&self, event: ProgressEvent);
}

/// Discards every event.
#[derive(Debug, Default)]
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn on_event(&self, _event: ProgressEvent) {}
}
