use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One multi-turn dialogue example.
///
/// On disk an example is a single line of tab-separated turns; the last field
/// is the response target and every preceding field is an earlier turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogueExample {
    /// The untouched line, as fed to inference.
    pub raw: String,
    pub sources: Vec<String>,
    pub target: String,
}

impl DialogueExample {
    pub fn parse(line: &str) -> TrainingResult<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Err(TrainingError::Dataset("dialogue line is empty".to_string()));
        }

        let mut turns: Vec<String> = line.split('\t').map(str::to_string).collect();
        // split always yields at least one field
        let target = turns.pop().unwrap_or_default();
        Ok(Self { raw: line.to_string(), sources: turns, target })
    }
}

pub type DialogueSet = Vec<DialogueExample>;

/// Loads a dev/test file. Blank lines are skipped.
pub fn load_dialogues(path: &Path) -> TrainingResult<DialogueSet> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        TrainingError::Dataset(format!("failed to read {}: {}", path.display(), e))
    })?;

    let mut examples = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let example = DialogueExample::parse(line).map_err(|e| {
            TrainingError::Dataset(format!("{}:{}: {}", path.display(), idx + 1, e))
        })?;
        examples.push(example);
    }

    Ok(examples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_splits_sources_and_target() {
        let ex = DialogueExample::parse("hi there\thow are you\tfine thanks\n").unwrap();
        assert_eq!(ex.sources, vec!["hi there".to_string(), "how are you".to_string()]);
        assert_eq!(ex.target, "fine thanks");
        assert_eq!(ex.raw, "hi there\thow are you\tfine thanks");
    }

    #[test]
    fn test_parse_single_field_has_no_sources() {
        let ex = DialogueExample::parse("just a reply").unwrap();
        assert!(ex.sources.is_empty());
        assert_eq!(ex.target, "just a reply");
    }

    #[test]
    fn test_parse_rejects_blank_line() {
        assert!(DialogueExample::parse("   ").is_err());
    }

    #[test]
    fn test_load_skips_blank_lines() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("dev.txt");
        std::fs::write(&path, "a\tb\n\nc\td\n").unwrap();

        let set = load_dialogues(&path).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set[1].target, "d");
    }

    #[test]
    fn test_load_missing_file_is_dataset_error() {
        let temp = TempDir::new().unwrap();
        let err = load_dialogues(&temp.path().join("nope.txt")).unwrap_err();
        assert!(matches!(err, TrainingError::Dataset(_)));
    }
}
