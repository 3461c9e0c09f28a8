// Person-name span recognition.
//
// Extraction is a blocking call behind a trait so a heavier local model can
// be plugged in; callers on the async pool must isolate it (the orchestrator
// runs it under spawn_blocking).

use regex::Regex;

use crate::privacy::registry::PSEUDONYM_PREFIX;

pub trait NameRecognizer: Send + Sync {
    /// Candidate person-name spans in reading order, deduplicated.
    fn person_spans(&self, text: &str) -> Vec<String>;
}

/// Rule-based recognizer: honorific-introduced names ("M. Dupont",
/// "Dr Lefèvre") and runs of two or more capitalized words.
pub struct HeuristicRecognizer {
    honorific: Regex,
    capitalized_run: Regex,
}

impl Default for HeuristicRecognizer {
    fn default() -> Self {
        Self::new()
    }
}

impl HeuristicRecognizer {
    pub fn new() -> Self {
        HeuristicRecognizer {
            honorific: Regex::new(
                r"\b(?:M\.|Mme|Mlle|Mr|Mrs|Ms|Dr)\s+\p{Lu}[\p{L}'’-]+(?:\s+\p{Lu}[\p{L}'’-]+)?",
            )
            .unwrap(),
            capitalized_run: Regex::new(
                r"\b\p{Lu}[\p{Ll}'’-]+(?:\s+\p{Lu}[\p{Ll}'’-]+)+\b",
            )
            .unwrap(),
        }
    }
}

impl NameRecognizer for HeuristicRecognizer {
    fn person_spans(&self, text: &str) -> Vec<String> {
        let mut matches: Vec<(usize, usize)> = Vec::new();
        for re in [&self.honorific, &self.capitalized_run] {
            for m in re.find_iter(text) {
                matches.push((m.start(), m.end()));
            }
        }
        matches.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));

        // Drop spans contained in an earlier, longer one.
        let mut spans: Vec<String> = Vec::new();
        let mut covered_end = 0usize;
        for (start, end) in matches {
            if start < covered_end {
                continue;
            }
            let span = text[start..end].trim();
            if span.is_empty() || span.contains(PSEUDONYM_PREFIX) {
                continue;
            }
            if !spans.iter().any(|s| s == span) {
                spans.push(span.to_string());
            }
            covered_end = end;
        }
        spans
    }
}
