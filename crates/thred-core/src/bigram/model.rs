use rand::Rng;
use rand::distributions::{Distribution, WeightedIndex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thred_training::{ContextKind, DialogueExample, TrainingError, TrainingResult};

pub const UNK: &str = "<unk>";
pub const BOS: &str = "<s>";
pub const EOS: &str = "</s>";

const UNK_ID: usize = 0;
const BOS_ID: usize = 1;
const EOS_ID: usize = 2;

/// On-disk form of a bigram model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BigramCheckpoint {
    pub global_step: u64,
    /// Ordered vocabulary; the first three entries are `<unk>`, `<s>`, `</s>`.
    pub vocab: Vec<String>,
    /// transitions[prev] = (next, weight), sorted by next id.
    pub transitions: Vec<Vec<(usize, f64)>>,
}

impl BigramCheckpoint {
    fn validate(&self) -> TrainingResult<()> {
        if self.vocab.len() < 3 || self.vocab[..3] != [UNK, BOS, EOS] {
            return Err(TrainingError::Checkpoint(
                "bigram checkpoint must start with <unk>, <s>, </s>".to_string(),
            ));
        }
        if self.transitions.len() != self.vocab.len() {
            return Err(TrainingError::Checkpoint(
                "bigram checkpoint rows != vocab".to_string(),
            ));
        }
        for row in &self.transitions {
            for &(next, weight) in row {
                if next >= self.vocab.len() {
                    return Err(TrainingError::Checkpoint(format!(
                        "bigram checkpoint refers to token {next} outside the vocabulary"
                    )));
                }
                if !weight.is_finite() || weight < 0.0 {
                    return Err(TrainingError::Checkpoint(format!(
                        "bigram checkpoint has invalid weight {weight}"
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn load(path: &Path) -> TrainingResult<Self> {
        let bytes = std::fs::read(path).map_err(|e| {
            TrainingError::Checkpoint(format!("failed to read {}: {e}", path.display()))
        })?;
        let ckpt: Self = serde_json::from_slice(&bytes).map_err(|e| {
            TrainingError::Checkpoint(format!("failed to parse {}: {e}", path.display()))
        })?;
        ckpt.validate()?;
        Ok(ckpt)
    }

    pub fn write(&self, path: &Path) -> TrainingResult<()> {
        let json = serde_json::to_string(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Negative log-likelihood of one example's response.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Score {
    pub nll: f64,
    /// Response tokens plus the end-of-sequence marker.
    pub predict_count: u64,
}

#[derive(Debug, Clone)]
struct Hypothesis {
    tokens: Vec<usize>,
    log_prob: f64,
    last: usize,
}

impl Hypothesis {
    fn extend(&self, next: usize, log_prob: f64) -> Self {
        let mut tokens = self.tokens.clone();
        tokens.push(next);
        Self { tokens, log_prob: self.log_prob + log_prob, last: next }
    }

    fn normalized(&self, alpha: f64) -> f64 {
        self.log_prob / length_penalty(self.tokens.len(), alpha)
    }
}

/// GNMT length penalty: `((5 + len) / 6) ^ alpha`.
#[must_use]
pub fn length_penalty(len: usize, alpha: f64) -> f64 {
    ((5.0 + len as f64) / 6.0).powf(alpha)
}

/// Turns that condition the response: every field but the last when the
/// line carries a response, the whole line otherwise.
#[must_use]
pub fn context_of(raw: &str) -> Vec<&str> {
    let fields: Vec<&str> = raw.split('\t').collect();
    if fields.len() >= 2 { fields[..fields.len() - 1].to_vec() } else { fields }
}

/// Word bigram model with add-one smoothing.
///
/// A response is modelled as a chain starting from the last word of the
/// preceding turn (or `<s>` when there is none) and ending with `</s>`.
#[derive(Debug, Clone)]
pub struct BigramModel {
    vocab: Vec<String>,
    index: HashMap<String, usize>,
    rows: Vec<HashMap<usize, f64>>,
    totals: Vec<f64>,
}

impl Default for BigramModel {
    fn default() -> Self {
        Self::new()
    }
}

impl BigramModel {
    #[must_use]
    pub fn new() -> Self {
        let mut model =
            Self { vocab: Vec::new(), index: HashMap::new(), rows: Vec::new(), totals: Vec::new() };
        for special in [UNK, BOS, EOS] {
            model.intern(special);
        }
        model
    }

    pub fn from_checkpoint(ckpt: BigramCheckpoint) -> TrainingResult<Self> {
        ckpt.validate()?;
        let index = ckpt.vocab.iter().enumerate().map(|(i, w)| (w.clone(), i)).collect();
        let rows: Vec<HashMap<usize, f64>> =
            ckpt.transitions.into_iter().map(|row| row.into_iter().collect()).collect();
        let totals = rows.iter().map(|row| row.values().sum()).collect();
        Ok(Self { vocab: ckpt.vocab, index, rows, totals })
    }

    #[must_use]
    pub fn to_checkpoint(&self, global_step: u64) -> BigramCheckpoint {
        let transitions = self
            .rows
            .iter()
            .map(|row| {
                let mut entries: Vec<(usize, f64)> = row.iter().map(|(&n, &w)| (n, w)).collect();
                entries.sort_by_key(|(n, _)| *n);
                entries
            })
            .collect();
        BigramCheckpoint { global_step, vocab: self.vocab.clone(), transitions }
    }

    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    fn intern(&mut self, word: &str) -> usize {
        if let Some(&id) = self.index.get(word) {
            return id;
        }
        let id = self.vocab.len();
        self.vocab.push(word.to_string());
        self.index.insert(word.to_string(), id);
        self.rows.push(HashMap::new());
        self.totals.push(0.0);
        id
    }

    fn id(&self, word: &str) -> usize {
        self.index.get(word).copied().unwrap_or(UNK_ID)
    }

    /// Start state for a response given the preceding turns.
    #[must_use]
    pub fn start_for<S: AsRef<str>>(&self, context: &[S]) -> usize {
        last_word(context).and_then(|w| self.index.get(w).copied()).unwrap_or(BOS_ID)
    }

    #[must_use]
    pub fn log_prob(&self, prev: usize, next: usize) -> f64 {
        let count = self.rows[prev].get(&next).copied().unwrap_or(0.0);
        ((count + 1.0) / (self.totals[prev] + self.vocab.len() as f64)).ln()
    }

    #[must_use]
    pub fn score(&self, example: &DialogueExample) -> Score {
        let mut prev = self.start_for(&example.sources);
        let mut score = Score::default();
        for word in example.target.split_whitespace() {
            let next = self.id(word);
            score.nll -= self.log_prob(prev, next);
            score.predict_count += 1;
            prev = next;
        }
        score.nll -= self.log_prob(prev, EOS_ID);
        score.predict_count += 1;
        score
    }

    /// Transitions observed in `example`, growing the vocabulary as needed.
    pub fn transitions(&mut self, example: &DialogueExample) -> Vec<(usize, usize)> {
        let mut prev = last_word(&example.sources).map_or(BOS_ID, |w| self.intern(w));
        let mut pairs = Vec::new();
        for word in example.target.split_whitespace() {
            let next = self.intern(word);
            pairs.push((prev, next));
            prev = next;
        }
        pairs.push((prev, EOS_ID));
        pairs
    }

    pub fn add(&mut self, prev: usize, next: usize, weight: f64) {
        *self.rows[prev].entry(next).or_default() += weight;
        self.totals[prev] += weight;
    }

    /// Most likely continuation, one token at a time. Ties go to the lowest id.
    #[must_use]
    pub fn greedy(&self, start: usize, max_len: usize) -> Vec<usize> {
        let mut tokens = Vec::new();
        let mut prev = start;
        for _ in 0..max_len {
            let mut best = EOS_ID;
            let mut best_lp = f64::NEG_INFINITY;
            for next in EOS_ID..self.vocab.len() {
                let lp = self.log_prob(prev, next);
                if lp > best_lp {
                    best_lp = lp;
                    best = next;
                }
            }
            tokens.push(best);
            if best == EOS_ID {
                break;
            }
            prev = best;
        }
        tokens
    }

    /// Beam search returning exactly `width` hypotheses, best first after
    /// length normalization.
    #[must_use]
    pub fn beam_search(
        &self,
        start: usize,
        width: usize,
        alpha: f64,
        max_len: usize,
    ) -> Vec<Vec<usize>> {
        let width = width.max(1);
        let mut alive = vec![Hypothesis { tokens: Vec::new(), log_prob: 0.0, last: start }];
        let mut finished: Vec<Hypothesis> = Vec::new();

        for _ in 0..max_len {
            let mut expanded: Vec<Hypothesis> = alive
                .iter()
                .flat_map(|hyp| {
                    (EOS_ID..self.vocab.len()).map(move |next| (hyp, next))
                })
                .map(|(hyp, next)| hyp.extend(next, self.log_prob(hyp.last, next)))
                .collect();
            expanded.sort_by(|a, b| b.log_prob.total_cmp(&a.log_prob));
            expanded.truncate(width);

            alive.clear();
            for hyp in expanded {
                if hyp.last == EOS_ID {
                    finished.push(hyp);
                } else {
                    alive.push(hyp);
                }
            }
            if alive.is_empty() || finished.len() >= width {
                break;
            }
        }

        finished.extend(alive);
        finished.sort_by(|a, b| b.normalized(alpha).total_cmp(&a.normalized(alpha)));
        finished.truncate(width);
        // A tiny vocabulary can produce fewer distinct hypotheses than the beam is wide.
        while finished.len() < width {
            let Some(best) = finished.first().cloned() else {
                break;
            };
            finished.push(best);
        }
        finished.into_iter().map(|h| h.tokens).collect()
    }

    /// Samples a continuation from the temperature-scaled distribution.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        start: usize,
        temperature: f64,
        max_len: usize,
        rng: &mut R,
    ) -> TrainingResult<Vec<usize>> {
        let mut tokens = Vec::new();
        let mut prev = start;
        for _ in 0..max_len {
            let log_probs: Vec<f64> =
                (EOS_ID..self.vocab.len()).map(|next| self.log_prob(prev, next)).collect();
            let max = log_probs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let weights: Vec<f64> =
                log_probs.iter().map(|lp| ((lp - max) / temperature).exp()).collect();
            let dist = WeightedIndex::new(&weights).map_err(|e| {
                TrainingError::session(ContextKind::Infer, format!("invalid sampling weights: {e}"))
            })?;

            let next = EOS_ID + dist.sample(rng);
            tokens.push(next);
            if next == EOS_ID {
                break;
            }
            prev = next;
        }
        Ok(tokens)
    }

    #[must_use]
    pub fn render(&self, tokens: &[usize]) -> String {
        tokens
            .iter()
            .filter(|&&id| id != EOS_ID)
            .map(|&id| self.vocab[id].as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn last_word<S: AsRef<str>>(context: &[S]) -> Option<&str> {
    context.last().and_then(|turn| turn.as_ref().split_whitespace().last())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use tempfile::TempDir;

    fn trained(times: usize) -> BigramModel {
        let mut model = BigramModel::new();
        let example = DialogueExample::parse("how are you\tfine thanks").unwrap();
        for _ in 0..times {
            for (prev, next) in model.transitions(&example) {
                model.add(prev, next, 1.0);
            }
        }
        model
    }

    fn start(model: &BigramModel, raw: &str) -> usize {
        model.start_for(&context_of(raw))
    }

    #[test]
    fn test_training_lowers_loss() {
        let example = DialogueExample::parse("how are you\tfine thanks").unwrap();
        let before = trained(1).score(&example);
        let after = trained(10).score(&example);
        assert_eq!(before.predict_count, 3);
        assert!(after.nll < before.nll);
    }

    #[test]
    fn test_unknown_words_score_as_unk() {
        let model = trained(3);
        let example = DialogueExample::parse("hello\tnever seen").unwrap();
        let score = model.score(&example);
        assert_eq!(score.predict_count, 3);
        assert!(score.nll.is_finite());
    }

    #[test]
    fn test_greedy_recovers_learned_response() {
        let model = trained(5);
        let tokens = model.greedy(start(&model, "how are you"), 10);
        assert_eq!(model.render(&tokens), "fine thanks");
        assert_eq!(tokens.last(), Some(&EOS_ID));
    }

    #[test]
    fn test_greedy_respects_max_len() {
        let model = trained(5);
        assert_eq!(model.greedy(start(&model, "how are you"), 1).len(), 1);
        assert!(model.greedy(BOS_ID, 0).is_empty());
    }

    #[test]
    fn test_beam_search_returns_full_width_best_first() {
        let model = trained(5);
        let beams = model.beam_search(start(&model, "how are you"), 4, 1.0, 10);
        assert_eq!(beams.len(), 4);
        assert_eq!(model.render(&beams[0]), "fine thanks");
    }

    #[test]
    fn test_beam_search_pads_tiny_vocabulary() {
        let model = BigramModel::new();
        let beams = model.beam_search(BOS_ID, 5, 0.0, 3);
        assert_eq!(beams.len(), 5);
        assert!(beams.iter().all(|b| model.render(b).is_empty()));
    }

    #[test]
    fn test_cold_sampling_matches_greedy() {
        let model = trained(20);
        let mut rng = StdRng::seed_from_u64(11);
        let start = start(&model, "how are you");
        let sampled = model.sample(start, 0.01, 10, &mut rng).unwrap();
        assert_eq!(sampled, model.greedy(start, 10));
    }

    #[test]
    fn test_length_penalty_is_neutral_without_weight() {
        assert_eq!(length_penalty(7, 0.0), 1.0);
        assert_eq!(length_penalty(1, 1.0), 1.0);
        assert!(length_penalty(10, 1.0) > 1.0);
    }

    #[test]
    fn test_context_of_drops_response_field() {
        assert_eq!(context_of("a b\tc d\te"), vec!["a b", "c d"]);
        assert_eq!(context_of("just a prompt"), vec!["just a prompt"]);
    }

    #[test]
    fn test_checkpoint_round_trip_preserves_scores() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("ckpt-3.json");
        let model = trained(4);
        model.to_checkpoint(3).write(&path).unwrap();

        let ckpt = BigramCheckpoint::load(&path).unwrap();
        assert_eq!(ckpt.global_step, 3);
        let restored = BigramModel::from_checkpoint(ckpt).unwrap();

        let example = DialogueExample::parse("are you\tfine").unwrap();
        assert_eq!(restored.score(&example), model.score(&example));
    }

    #[test]
    fn test_checkpoint_rejects_ragged_rows() {
        let mut ckpt = trained(1).to_checkpoint(1);
        ckpt.transitions.pop();
        assert!(matches!(
            BigramModel::from_checkpoint(ckpt),
            Err(TrainingError::Checkpoint(_))
        ));
    }
}
