//! Qualitative decoding of one random held-out example.

use crate::context::{ContextKind, DecodeOptions, Decoded, InferContext};
use crate::dataset::DialogueExample;
use crate::error::{TrainingError, TrainingResult};
use crate::log::RunLog;
use crate::summary::SummaryWriter;
use rand::Rng;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleDecode {
    pub index: usize,
    pub sources: Vec<String>,
    pub target: String,
    pub generated: String,
}

/// Picks the candidate to show from one decoder output.
pub fn top_candidate(decoded: &Decoded, use_beam: bool) -> TrainingResult<&str> {
    let candidates = match (decoded, use_beam) {
        (Decoded::Beam(c), true) | (Decoded::Direct(c), false) => c,
        (Decoded::Beam(_), false) => {
            return Err(TrainingError::session(
                ContextKind::Infer,
                "got beam output but beam decoding is not in use",
            ));
        }
        (Decoded::Direct(_), true) => {
            return Err(TrainingError::session(
                ContextKind::Infer,
                "expected beam output but got a direct decode",
            ));
        }
    };
    candidates
        .first()
        .map(String::as_str)
        .ok_or_else(|| TrainingError::session(ContextKind::Infer, "decoder returned no candidates"))
}

/// Decodes one uniformly chosen example of `data`, logs it and forwards the
/// decoder's summary.
pub fn sample_decode<I, R>(
    infer: &mut I,
    data: &[DialogueExample],
    use_beam: bool,
    rng: &mut R,
    summary_writer: &mut dyn SummaryWriter,
    log: &mut RunLog,
    global_step: u64,
) -> TrainingResult<SampleDecode>
where
    I: InferContext + ?Sized,
    R: Rng + ?Sized,
{
    if data.is_empty() {
        return Err(TrainingError::Dataset("cannot sample from an empty dataset".to_string()));
    }

    let index = rng.gen_range(0..data.len());
    let example = &data[index];

    let options = DecodeOptions { batch_size: 1, n_responses: 1, use_beam };
    let output = infer.decode(std::slice::from_ref(&example.raw), &options)?;
    let decoded = output.outputs.first().ok_or_else(|| {
        TrainingError::session(ContextKind::Infer, "decoder returned no outputs")
    })?;
    let generated = top_candidate(decoded, use_beam)?.to_string();

    log.print(&format!("  # {index}"));
    log.print("    sources:");
    for (t, src) in example.sources.iter().enumerate() {
        log.print(&format!("      @{} {}", t + 1, src));
    }
    log.print(&format!("    resp: {}", example.target));
    log.print(&format!("    generated: {generated}"));

    if let Some(summary) = &output.summary {
        summary_writer.add_summary(global_step, summary)?;
    }

    Ok(SampleDecode {
        index,
        sources: example.sources.clone(),
        target: example.target.clone(),
        generated,
    })
}
