use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::core::config::Settings;
use crate::schemas::grading::{AnswerKey, QuestionKey};
use crate::services::coercion::{
    coerce, coerce_any_object, number_field, optional_string, string_list, ExpectedShape,
};
use crate::services::reasoning::{complete_within, CompletionOptions, ReasoningClient};

const SYNTHESIS_SYSTEM_PROMPT: &str = r#"You are an experienced teacher preparing the marking scheme for an assignment.
Read the assignment and its reference material and produce an answer key.

Respond with a single JSON object and nothing else:
{
  "questions": [
    {
      "number": <positive integer>,
      "ideal_answer": "model answer a full-marks student would give",
      "key_points": ["point that must be covered"],
      "max_marks": <number>,
      "marking_criteria": ["how marks are awarded or deducted"]
    }
  ]
}

Question marks must add up to the total marks given in the request."#;

/// Builds per-assignment answer keys. Never fails: anything that goes wrong
/// yields the degenerate manual-review key.
#[derive(Clone)]
pub struct AnswerKeySynthesizer {
    reasoning: Arc<dyn ReasoningClient>,
    timeout: Duration,
    reference_char_limit: usize,
    options: CompletionOptions,
}

impl AnswerKeySynthesizer {
    pub fn new(
        reasoning: Arc<dyn ReasoningClient>,
        timeout: Duration,
        reference_char_limit: usize,
        options: CompletionOptions,
    ) -> Self {
        Self { reasoning, timeout, reference_char_limit, options }
    }

    pub(crate) fn from_settings(settings: &Settings, reasoning: Arc<dyn ReasoningClient>) -> Self {
        Self::new(
            reasoning,
            Duration::from_secs(settings.ai().ai_request_timeout),
            settings.grading().reference_char_limit,
            CompletionOptions {
                max_tokens: settings.grading().synthesis_max_tokens,
                temperature: settings.ai().ai_temperature,
            },
        )
    }

    pub async fn synthesize(
        &self,
        title: &str,
        description: &str,
        reference_text: &str,
        max_marks: u32,
    ) -> AnswerKey {
        match self.try_synthesize(title, description, reference_text, max_marks).await {
            Ok(key) => {
                metrics::counter!("answer_keys_synthesized_total", "outcome" => "synthesized")
                    .increment(1);
                tracing::info!(title, questions = key.questions().len(), "Answer key synthesized");
                key
            }
            Err(reason) => {
                metrics::counter!("answer_keys_synthesized_total", "outcome" => "degenerate")
                    .increment(1);
                tracing::warn!(title, reason = %reason, "Falling back to manual-review answer key");
                AnswerKey::degenerate(max_marks)
            }
        }
    }

    async fn try_synthesize(
        &self,
        title: &str,
        description: &str,
        reference_text: &str,
        max_marks: u32,
    ) -> Result<AnswerKey, String> {
        if reference_text.trim().is_empty() {
            return Err("reference document has no text".to_string());
        }

        let reference = truncate_chars(reference_text.trim(), self.reference_char_limit);
        let user_prompt = format!(
            "Assignment title: {title}\n\nAssignment description:\n{description}\n\nTotal marks: {max_marks}\n\nReference material:\n{reference}\n"
        );

        let raw = complete_within(
            self.reasoning.as_ref(),
            self.timeout,
            SYNTHESIS_SYSTEM_PROMPT,
            &user_prompt,
            self.options,
        )
        .await
        .map_err(|err| err.to_string())?;

        let shape = AnswerKeyShape { total_marks: max_marks };
        coerce(&raw, &shape)
            .or_else(|_| coerce_any_object(&raw, &shape))
            .map_err(|failure| failure.to_string())
    }
}

/// Cuts `text` to at most `limit` characters on a char boundary.
pub(crate) fn truncate_chars(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

pub(crate) struct AnswerKeyShape {
    pub(crate) total_marks: u32,
}

impl ExpectedShape for AnswerKeyShape {
    type Output = AnswerKey;

    fn name(&self) -> &'static str {
        "answer key"
    }

    fn validate(&self, object: &Map<String, Value>) -> Result<AnswerKey, String> {
        let items = match object.get("questions") {
            Some(Value::Array(items)) => items,
            Some(_) => return Err("`questions` must be an array".to_string()),
            None => return Err("missing `questions`".to_string()),
        };

        let mut questions = Vec::with_capacity(items.len());
        for (position, item) in items.iter().enumerate() {
            let Value::Object(item) = item else {
                return Err(format!("question {} is not an object", position + 1));
            };

            let number = number_field(item, &["number", "question_number"])?;
            if number < 1.0 || number.fract() != 0.0 || number > f64::from(u32::MAX) {
                return Err(format!("question number {number} is not a positive integer"));
            }

            questions.push(QuestionKey {
                number: number as u32,
                ideal_answer: optional_string(item, &["ideal_answer", "idealAnswer", "answer"])
                    .unwrap_or_default(),
                key_points: string_list(item, &["key_points", "keyPoints"])
                    .into_iter()
                    .collect::<BTreeSet<_>>(),
                max_marks: number_field(item, &["max_marks", "maxMarks", "marks"])?,
                marking_criteria: string_list(item, &["marking_criteria", "markingCriteria"])
                    .into_iter()
                    .collect::<BTreeSet<_>>(),
            });
        }

        AnswerKey::new(questions, self.total_marks).map_err(|err| err.to_string())
    }
}
