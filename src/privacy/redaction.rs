// Three-pass redaction pipeline.
//
// Pass 1 — exact/normalized, accent and case insensitive, longest name
//          variants first so a full name is never clobbered by its parts.
// Pass 2 — recognizer-assisted fuzzy: candidate person spans scored against
//          registered names with length-adaptive thresholds.
// Pass 3 — residual fuzzy over capitalized word uni/bigrams, stricter
//          thresholds since no model evidence backs this pass.
//
// Ambiguous spans below threshold are never guessed: the text stays
// untouched and the span is surfaced for human review.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use regex::Regex;
use tracing::{debug, warn};

use crate::config::FuzzyThresholds;
use crate::error::Result;
use crate::privacy::normalize::{accent_insensitive_pattern, fold_diacritics};
use crate::privacy::recognizer::NameRecognizer;
use crate::privacy::registry::{IdentityRegistry, PSEUDONYM_TOKEN_PATTERN};
use crate::types::Identity;

/// A span the fuzzy passes could not confidently attribute, kept for human
/// review before export. Diagnostic only, never persisted as-is.
#[derive(Debug, Clone)]
pub struct ReviewCandidate {
    pub span: String,
    pub closest: Option<String>,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct RedactionResult {
    pub text: String,
    pub review: Vec<ReviewCandidate>,
}

/// Folded comparison material for one registered identity.
struct NameKey {
    pseudonym: String,
    /// Individual name words, diacritics stripped, single letters dropped.
    parts: Vec<String>,
    /// Folded "given family" form, for bigram comparison.
    full: String,
}

#[derive(Clone)]
pub struct RedactionPipeline {
    registry: IdentityRegistry,
    recognizer: Arc<dyn NameRecognizer>,
    thresholds: FuzzyThresholds,
    token_re: Regex,
    word_re: Regex,
}

impl RedactionPipeline {
    pub fn new(
        registry: IdentityRegistry,
        recognizer: Arc<dyn NameRecognizer>,
        thresholds: FuzzyThresholds,
    ) -> Self {
        RedactionPipeline {
            registry,
            recognizer,
            thresholds,
            token_re: Regex::new(PSEUDONYM_TOKEN_PATTERN).unwrap(),
            word_re: Regex::new(r"[\p{L}][\p{L}'’-]*").unwrap(),
        }
    }

    /// Replace every identifying token of the scope's registered names.
    /// Returns the redacted text plus the spans left for human review.
    pub fn redact(&self, text: &str, scope: &str) -> Result<RedactionResult> {
        let identities = self.registry.list(scope)?;
        if identities.is_empty() {
            debug!(scope, "no identities registered, text passed through");
            return Ok(RedactionResult {
                text: text.to_string(),
                review: Vec::new(),
            });
        }

        let keys = name_keys(&identities);
        let mut review = Vec::new();

        let text = exact_pass(text, &identities);
        let text = self.assisted_pass(text, &keys, &mut review);
        let text = self.residual_pass(text, &keys);

        debug!(scope, flagged = review.len(), "redaction complete");
        Ok(RedactionResult { text, review })
    }

    /// Recognizer-assisted fuzzy pass. Spans scoring below threshold are
    /// recorded for review, never replaced.
    fn assisted_pass(
        &self,
        text: String,
        keys: &[NameKey],
        review: &mut Vec<ReviewCandidate>,
    ) -> String {
        let spans = self.recognizer.person_spans(&text);
        let mut out = text;
        for span in spans {
            let parts: Vec<String> = span
                .split_whitespace()
                .filter(|p| p.chars().count() > 1)
                .map(fold_diacritics)
                .collect();
            if parts.is_empty() {
                continue;
            }

            let mut best_score = 0.0;
            let mut best_key: Option<&NameKey> = None;
            let mut matched: Option<&NameKey> = None;
            for key in keys {
                let (score, hit) = score_parts(&parts, key, |len| self.thresholds.assisted(len));
                if score > best_score {
                    best_score = score;
                    best_key = Some(key);
                }
                if hit && matched.is_none() {
                    matched = Some(key);
                }
            }

            match matched {
                Some(key) => {
                    debug!(span = %span, pseudonym = %key.pseudonym, "assisted fuzzy match");
                    out = replace_span(&out, &span, &key.pseudonym);
                }
                None => {
                    warn!(span = %span, score = best_score, "low-confidence name candidate flagged for review");
                    review.push(ReviewCandidate {
                        span,
                        closest: best_key.map(|k| k.full.clone()),
                        score: best_score,
                    });
                }
            }
        }
        out
    }

    /// Residual fuzzy pass: capitalized uni/bigrams against registered
    /// names, no recognizer evidence, stricter thresholds.
    fn residual_pass(&self, text: String, keys: &[NameKey]) -> String {
        let words: Vec<(usize, usize, String)> = self
            .word_re
            .find_iter(&text)
            .map(|m| (m.start(), m.end(), m.as_str().to_string()))
            .collect();

        let mut planned: Vec<(String, String)> = Vec::new();

        // Bigrams of adjacent capitalized words against full names.
        for pair in words.windows(2) {
            let (_, a_end, a) = &pair[0];
            let (b_start, _, b) = &pair[1];
            if !starts_uppercase(a) || !starts_uppercase(b) {
                continue;
            }
            if a == "PERSON" || b == "PERSON" {
                continue;
            }
            if !text[*a_end..*b_start].chars().all(char::is_whitespace) {
                continue;
            }
            let gram = format!("{a} {b}");
            let folded = fold_diacritics(&gram);
            if let Some(threshold) = self.thresholds.residual(folded.chars().count()) {
                for key in keys {
                    if strsim::normalized_levenshtein(&folded, &key.full) >= threshold {
                        planned.push((gram.clone(), key.pseudonym.clone()));
                        break;
                    }
                }
            }
        }

        // Single capitalized words against individual name parts.
        for (_, _, word) in &words {
            if !starts_uppercase(word) || word == "PERSON" {
                continue;
            }
            let Some(threshold) = self.thresholds.residual(word.chars().count()) else {
                continue;
            };
            let folded = fold_diacritics(word);
            'keys: for key in keys {
                for part in &key.parts {
                    if strsim::normalized_levenshtein(&folded, part) >= threshold {
                        debug!(word = %word, pseudonym = %key.pseudonym, "residual fuzzy match");
                        planned.push((word.clone(), key.pseudonym.clone()));
                        break 'keys;
                    }
                }
            }
        }

        let mut seen = HashSet::new();
        planned.retain(|(gram, _)| seen.insert(gram.to_lowercase()));
        planned.sort_by(|a, b| b.0.chars().count().cmp(&a.0.chars().count()));

        let mut out = text;
        for (gram, pseudonym) in planned {
            out = replace_span(&out, &gram, &pseudonym);
        }
        out
    }

    /// Single linear scan restoring real names for the scope. Unknown
    /// tokens pass through unchanged so one orphaned id never blocks an
    /// otherwise-valid export. Idempotent: restored text has no tokens
    /// left, so a second run is a no-op.
    pub fn depseudonymize(&self, text: &str, scope: &str) -> Result<String> {
        let identities = self.registry.list(scope)?;
        let names: HashMap<&str, String> = identities
            .iter()
            .map(|i| (i.pseudonym_id.as_str(), display_name(i)))
            .collect();

        let restored = self.token_re.replace_all(text, |caps: &regex::Captures<'_>| {
            let token = &caps[0];
            names
                .get(token)
                .cloned()
                .unwrap_or_else(|| token.to_string())
        });
        Ok(restored.into_owned())
    }
}

/// Exact/normalized pass: every known name variant, longest first,
/// replaced via accent/case-insensitive word-bounded patterns.
fn exact_pass(text: &str, identities: &[Identity]) -> String {
    let mut variants: Vec<(String, String)> = Vec::new();
    for identity in identities {
        let given = identity.given_name.trim();
        let family = identity.family_name.trim();

        let mut names = Vec::new();
        if !given.is_empty() {
            names.push(format!("{given} {family}"));
            names.push(format!("{family} {given}"));
        }
        names.push(family.to_string());
        if !given.is_empty() {
            names.push(given.to_string());
        }
        // Hyphenated names are often written with spaces instead.
        for name in names.clone() {
            if name.contains('-') {
                names.push(name.replace('-', " "));
            }
        }
        for name in names {
            variants.push((name, identity.pseudonym_id.clone()));
        }
    }

    let mut seen = HashSet::new();
    variants.retain(|(name, _)| seen.insert(name.to_lowercase()));
    variants.sort_by(|a, b| b.0.chars().count().cmp(&a.0.chars().count()));

    let mut out = text.to_string();
    for (name, pseudonym) in variants {
        if name.chars().count() < 2 {
            continue;
        }
        let pattern = format!(r"(?i)\b{}\b", accent_insensitive_pattern(&name));
        if let Ok(re) = Regex::new(&pattern) {
            out = re.replace_all(&out, pseudonym.as_str()).into_owned();
        }
    }
    out
}

/// Best similarity between any span token and any part of this name, and
/// whether one pairing clears the length-adaptive threshold.
fn score_parts<F>(parts: &[String], key: &NameKey, threshold_for: F) -> (f64, bool)
where
    F: Fn(usize) -> Option<f64>,
{
    let mut best = 0.0;
    let mut hit = false;
    for part in parts {
        let len = part.chars().count();
        match threshold_for(len) {
            // Too short to fuzzy-match safely: exact comparison only.
            None => {
                for name_part in &key.parts {
                    if part == name_part {
                        best = 1.0;
                        hit = true;
                    }
                }
            }
            Some(threshold) => {
                for name_part in &key.parts {
                    let score = strsim::normalized_levenshtein(part, name_part);
                    if score > best {
                        best = score;
                    }
                    if score >= threshold {
                        hit = true;
                    }
                }
            }
        }
    }
    (best, hit)
}

fn replace_span(text: &str, span: &str, pseudonym: &str) -> String {
    let pattern = format!(r"(?i)\b{}\b", regex::escape(span));
    match Regex::new(&pattern) {
        Ok(re) => re.replace_all(text, pseudonym).into_owned(),
        Err(_) => text.to_string(),
    }
}

fn starts_uppercase(word: &str) -> bool {
    word.chars().next().is_some_and(char::is_uppercase)
}

fn display_name(identity: &Identity) -> String {
    if identity.given_name.trim().is_empty() {
        identity.family_name.clone()
    } else {
        format!("{} {}", identity.given_name, identity.family_name)
    }
}

fn name_keys(identities: &[Identity]) -> Vec<NameKey> {
    identities
        .iter()
        .map(|identity| {
            let parts = [&identity.given_norm, &identity.family_norm]
                .iter()
                .flat_map(|n| n.split_whitespace())
                .filter(|p| p.chars().count() > 1)
                .map(fold_diacritics)
                .collect();
            let full = fold_diacritics(&format!(
                "{} {}",
                identity.given_norm, identity.family_norm
            ));
            NameKey {
                pseudonym: identity.pseudonym_id.clone(),
                parts,
                full,
            }
        })
        .collect()
}
