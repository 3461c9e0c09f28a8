// Few-shot prompt construction.
//
// The system template carries the domain scoring guidance and comes from
// configuration; this module only assembles messages. Every example and
// record string handed in here must already be redacted.

use crate::config::Settings;
use crate::types::{CalibrationExample, ChatMessage, SourceRecord};

const EXAMPLE_INSTRUCTION: &str = "Write the report for this record:";

pub struct PromptBuilder {
    system_template: String,
    max_examples: usize,
    max_example_chars: usize,
}

impl PromptBuilder {
    pub fn from_settings(settings: &Settings) -> Self {
        PromptBuilder {
            system_template: settings.system_template.clone(),
            max_examples: settings.max_calibration_examples,
            max_example_chars: settings.max_example_chars,
        }
    }

    /// System template, then each calibration example as a user/assistant
    /// pair (bounded in count and length), then the target record.
    pub fn build(
        &self,
        record_text: &str,
        examples: &[CalibrationExample],
    ) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(&self.system_template)];

        for example in examples.iter().take(self.max_examples) {
            messages.push(ChatMessage::user(format!(
                "{EXAMPLE_INSTRUCTION}\n\n{}",
                truncate(&example.record_summary, self.max_example_chars)
            )));
            messages.push(ChatMessage::assistant(truncate(
                &example.validated_output,
                self.max_example_chars,
            )));
        }

        messages.push(ChatMessage::user(format!(
            "{EXAMPLE_INSTRUCTION}\n\n{record_text}"
        )));
        messages
    }
}

/// Readable text form of a record, keyed by pseudonym. Name fields are
/// deliberately absent; the caller redacts the result before it goes
/// anywhere near a provider.
pub fn format_record(pseudonym_id: &str, record: &SourceRecord) -> String {
    let mut lines = vec![format!("Record: {pseudonym_id}")];
    for (label, value) in &record.attributes {
        lines.push(format!("{label}: {value}"));
    }
    if !record.sections.is_empty() {
        lines.push(String::new());
        for section in &record.sections {
            lines.push(format!("• {}", section.label));
            lines.push(format!("  \"{}\"", section.body));
        }
    }
    lines.join("\n")
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{cut}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RecordSection, Role};

    fn builder() -> PromptBuilder {
        PromptBuilder::from_settings(&Settings::default())
    }

    fn example(n: usize) -> CalibrationExample {
        CalibrationExample {
            record_summary: format!("Record: PERSON_00{n}"),
            validated_output: format!("PERSON_00{n} had a fine term."),
        }
    }

    #[test]
    fn messages_interleave_examples_then_target() {
        let messages = builder().build("Record: PERSON_009", &[example(1), example(2)]);
        let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::System, Role::User, Role::Assistant, Role::User, Role::Assistant, Role::User]
        );
        assert!(messages.last().unwrap().content.contains("PERSON_009"));
    }

    #[test]
    fn example_count_is_capped() {
        let examples: Vec<CalibrationExample> = (1..=5).map(example).collect();
        let messages = builder().build("Record: PERSON_009", &examples);
        // system + 3 capped pairs + target
        assert_eq!(messages.len(), 1 + 3 * 2 + 1);
    }

    #[test]
    fn long_examples_are_truncated() {
        let mut settings = Settings::default();
        settings.max_example_chars = 10;
        let builder = PromptBuilder::from_settings(&settings);

        let long = CalibrationExample {
            record_summary: "short".to_string(),
            validated_output: "x".repeat(50),
        };
        let messages = builder.build("Record: PERSON_001", &[long]);
        assert!(messages[2].content.chars().count() <= 11);
    }

    #[test]
    fn record_formatting_uses_the_pseudonym() {
        let record = SourceRecord {
            record_id: "r1".to_string(),
            given_name: "Marie".to_string(),
            family_name: "Dupont".to_string(),
            attributes: vec![("Absences".to_string(), "2 half-days".to_string())],
            sections: vec![RecordSection {
                label: "Mathematics".to_string(),
                body: "Serious and steady work.".to_string(),
            }],
        };
        let text = format_record("PERSON_001", &record);
        assert!(text.starts_with("Record: PERSON_001"));
        assert!(text.contains("Absences: 2 half-days"));
        assert!(text.contains("Mathematics"));
        assert!(!text.contains("Marie"));
        assert!(!text.contains("Dupont"));
    }
}
