use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};

use crate::core::config::Settings;
use crate::schemas::grading::{
    clamp_grade, round_marks, AnswerKey, BasicGradingReason, GradingMode, GradingResult,
    QuestionGrade,
};
use crate::services::coercion::{
    coerce, coerce_any_object, number_field, optional_string, ExpectedShape,
};
use crate::services::reasoning::{complete_within, CompletionOptions, ReasoningClient};

pub(crate) const DEGRADED_FEEDBACK: &str = "automated detailed evaluation not available";

const GRADING_SYSTEM_PROMPT: &str = r#"You are an experienced teacher grading a student's submission against an answer key.
Award marks per question according to the ideal answer, key points and marking criteria.
Marks are absolute marks on the scale stated in the request, not percentages.

Respond with a single JSON object and nothing else:
{
  "total_grade": <number>,
  "overall_feedback": "feedback for the student",
  "questions": [
    {"number": <question number>, "grade": <number>, "feedback": "feedback for this question"}
  ]
}"#;

/// Grades extracted submission text against an answer key. Always returns a
/// result; degraded results carry [`GradingMode::Basic`].
#[derive(Clone)]
pub struct GradingEngine {
    reasoning: Arc<dyn ReasoningClient>,
    timeout: Duration,
    basic_fraction: f64,
    options: CompletionOptions,
}

impl GradingEngine {
    pub fn new(
        reasoning: Arc<dyn ReasoningClient>,
        timeout: Duration,
        basic_fraction: f64,
        options: CompletionOptions,
    ) -> Self {
        Self { reasoning, timeout, basic_fraction, options }
    }

    pub(crate) fn from_settings(settings: &Settings, reasoning: Arc<dyn ReasoningClient>) -> Self {
        Self::new(
            reasoning,
            Duration::from_secs(settings.ai().ai_request_timeout),
            settings.grading().basic_fraction,
            CompletionOptions {
                max_tokens: settings.grading().grading_max_tokens,
                temperature: settings.grading().grading_temperature,
            },
        )
    }

    pub async fn grade(&self, submission_text: &str, key: &AnswerKey) -> GradingResult {
        let result = self.evaluate(submission_text, key).await;
        metrics::counter!("grading_attempts_total", "mode" => result.mode.label()).increment(1);
        result
    }

    async fn evaluate(&self, submission_text: &str, key: &AnswerKey) -> GradingResult {
        if key.requires_manual_review() {
            return self.basic(key, BasicGradingReason::ManualReviewKey);
        }
        if submission_text.trim().is_empty() {
            return self.basic(key, BasicGradingReason::EmptySubmission);
        }

        let user_prompt = grading_prompt(submission_text.trim(), key);
        let raw = match complete_within(
            self.reasoning.as_ref(),
            self.timeout,
            GRADING_SYSTEM_PROMPT,
            &user_prompt,
            self.options,
        )
        .await
        {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(error = %err, "Reasoning unavailable; using basic grading");
                return self.basic(key, BasicGradingReason::ReasoningUnavailable);
            }
        };

        let shape = GradeShape { key };
        let coerced = coerce(&raw, &shape).or_else(|failure| {
            tracing::debug!(failure = %failure, "Retrying coercion on any JSON object");
            coerce_any_object(&raw, &shape)
        });

        match coerced {
            Ok(result) => result,
            Err(failure) => {
                tracing::warn!(failure = %failure, "Unusable grading completion; using basic grading");
                self.basic(key, BasicGradingReason::UnusableResponse)
            }
        }
    }

    /// Deterministic placeholder grade: a fixed fraction of each question's marks,
    /// or zero when there was nothing to grade.
    fn basic(&self, key: &AnswerKey, reason: BasicGradingReason) -> GradingResult {
        let fraction = match reason {
            BasicGradingReason::EmptySubmission => 0.0,
            _ => self.basic_fraction,
        };

        let questions: Vec<QuestionGrade> = key
            .questions()
            .iter()
            .map(|question| QuestionGrade {
                number: question.number,
                grade: clamp_grade(round_marks(fraction * question.max_marks), question.max_marks),
                max_marks: question.max_marks,
                feedback: format!("Provisional mark: {DEGRADED_FEEDBACK}."),
            })
            .collect();
        // The total is the sum of the rounded question marks so the breakdown adds up.
        let awarded: f64 = questions.iter().map(|question| question.grade).sum();

        let total_marks = key.total_marks_f64();
        let overall_feedback = format!(
            "Grading note: {DEGRADED_FEEDBACK} because {}. A provisional grade of {:.0}% of the available marks was assigned; manual review is advisable.",
            reason.describe(),
            fraction * 100.0
        );

        GradingResult {
            total_grade: clamp_grade(round_marks(awarded), total_marks),
            max_marks: total_marks,
            overall_feedback,
            questions,
            mode: GradingMode::Basic(reason),
        }
    }
}

fn grading_prompt(submission_text: &str, key: &AnswerKey) -> String {
    let questions: Vec<Value> = key
        .questions()
        .iter()
        .map(|question| {
            json!({
                "number": question.number,
                "ideal_answer": question.ideal_answer,
                "key_points": question.key_points,
                "max_marks": round_marks(question.max_marks),
                "marking_criteria": question.marking_criteria,
            })
        })
        .collect();

    format!(
        "Grade this submission out of {total} marks, not a percentage. The total grade must be between 0 and {total}, and each question's grade between 0 and its max_marks.\n\nAnswer key:\n{key}\n\nStudent submission:\n{submission_text}\n",
        total = key.total_marks(),
        key = serde_json::to_string_pretty(&questions).unwrap_or_default(),
    )
}

struct GradeShape<'a> {
    key: &'a AnswerKey,
}

impl ExpectedShape for GradeShape<'_> {
    type Output = GradingResult;

    fn name(&self) -> &'static str {
        "grading result"
    }

    fn validate(&self, object: &Map<String, Value>) -> Result<GradingResult, String> {
        let total_marks = self.key.total_marks_f64();
        let total_grade = number_field(object, &["total_grade", "grade", "totalGrade"])?;

        let mut questions = BTreeMap::new();
        if let Some(Value::Array(items)) = object.get("questions") {
            for item in items.iter().filter_map(Value::as_object) {
                let Some(grade) = question_grade(item, self.key) else {
                    continue;
                };
                questions.entry(grade.number).or_insert(grade);
            }
        }

        Ok(GradingResult {
            total_grade: clamp_grade(total_grade, total_marks),
            max_marks: total_marks,
            overall_feedback: optional_string(
                object,
                &["overall_feedback", "feedback", "overallFeedback"],
            )
            .unwrap_or_default(),
            questions: questions.into_values().collect(),
            mode: GradingMode::Detailed,
        })
    }
}

/// Entries with unknown question numbers or non-numeric grades are dropped.
fn question_grade(item: &Map<String, Value>, key: &AnswerKey) -> Option<QuestionGrade> {
    let number = number_field(item, &["number", "question_number", "question"]).ok()?;
    if number.fract() != 0.0 || number < 1.0 || number > f64::from(u32::MAX) {
        return None;
    }
    let question = key.question(number as u32)?;
    let grade = number_field(item, &["grade", "marks", "score"]).ok()?;

    Some(QuestionGrade {
        number: question.number,
        grade: clamp_grade(grade, question.max_marks),
        max_marks: question.max_marks,
        feedback: optional_string(item, &["feedback", "comment"]).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::test_support::{
        answer_key, HangingReasoning, ScriptedReasoning, UnavailableReasoning,
    };

    const OPTIONS: CompletionOptions = CompletionOptions { max_tokens: 500, temperature: 0.0 };

    fn engine(reasoning: Arc<dyn ReasoningClient>, timeout: Duration) -> GradingEngine {
        GradingEngine::new(reasoning, timeout, 0.6, OPTIONS)
    }

    fn scripted(raw: &str) -> Arc<ScriptedReasoning> {
        Arc::new(ScriptedReasoning::new([raw]))
    }

    #[tokio::test]
    async fn timeout_falls_back_to_basic_fraction_within_bound() {
        let key = answer_key(&[20.0, 30.0], 50);
        let started = Instant::now();

        let result = engine(Arc::new(HangingReasoning), Duration::from_millis(50))
            .grade("Photosynthesis converts light energy.", &key)
            .await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(result.mode, GradingMode::Basic(BasicGradingReason::ReasoningUnavailable));
        assert_eq!(result.total_grade, 30.0);
        assert_eq!(result.max_marks, 50.0);
        assert!(result.overall_feedback.contains(DEGRADED_FEEDBACK));
        let grades: Vec<f64> = result.questions.iter().map(|question| question.grade).collect();
        assert_eq!(grades, vec![12.0, 18.0]);
    }

    #[tokio::test]
    async fn basic_total_matches_question_breakdown() {
        let key = answer_key(&[1.0; 7], 10);

        let result = engine(Arc::new(UnavailableReasoning), Duration::from_millis(50))
            .grade("Seven short answers.", &key)
            .await;

        assert!(result.questions.iter().all(|question| question.grade == 0.86));
        let summed: f64 = result.questions.iter().map(|question| question.grade).sum();
        assert_eq!(result.total_grade, round_marks(summed));
        assert_eq!(result.total_grade, 6.02);
    }

    #[tokio::test]
    async fn grades_on_max_marks_scale() {
        let key = answer_key(&[20.0, 30.0], 50);
        let reasoning = scripted(r#"{"total_grade": 45, "overall_feedback": "Strong work."}"#);

        let result = engine(reasoning.clone(), Duration::from_secs(5)).grade("answers", &key).await;

        assert_eq!(result.mode, GradingMode::Detailed);
        assert_eq!(result.total_grade, 45.0);
        assert_eq!(result.overall_feedback, "Strong work.");
        let prompt = reasoning.last_user_prompt().expect("prompt");
        assert!(prompt.contains("out of 50 marks, not a percentage"));
    }

    #[tokio::test]
    async fn clamps_out_of_range_grades() {
        let key = answer_key(&[20.0, 30.0], 50);

        let high = engine(scripted(r#"{"total_grade": 80}"#), Duration::from_secs(5))
            .grade("answers", &key)
            .await;
        let low = engine(scripted(r#"{"grade": -3}"#), Duration::from_secs(5))
            .grade("answers", &key)
            .await;

        assert_eq!(high.total_grade, 50.0);
        assert_eq!(low.total_grade, 0.0);
        assert_eq!(low.mode, GradingMode::Detailed);
    }

    #[tokio::test]
    async fn empty_submission_is_graded_without_reasoning() {
        let key = answer_key(&[20.0, 30.0], 50);
        let reasoning = scripted(r#"{"total_grade": 50}"#);

        let result = engine(reasoning.clone(), Duration::from_secs(5)).grade("", &key).await;

        assert_eq!(reasoning.calls(), 0);
        assert_eq!(result.mode, GradingMode::Basic(BasicGradingReason::EmptySubmission));
        assert!((0.0..=50.0).contains(&result.total_grade));
        assert_eq!(result.total_grade, 0.0);
        assert!(result.overall_feedback.contains(DEGRADED_FEEDBACK));
    }

    #[tokio::test]
    async fn manual_review_key_skips_reasoning() {
        let key = AnswerKey::degenerate(100);
        let reasoning = scripted(r#"{"total_grade": 100}"#);

        let result = engine(reasoning.clone(), Duration::from_secs(5)).grade("essay", &key).await;

        assert_eq!(reasoning.calls(), 0);
        assert_eq!(result.mode, GradingMode::Basic(BasicGradingReason::ManualReviewKey));
        assert_eq!(result.total_grade, 60.0);
    }

    #[tokio::test]
    async fn prose_and_code_fences_are_tolerated() {
        let key = answer_key(&[20.0, 30.0], 50);
        let raw = "Here is my evaluation.\n```json\n{\n  \"total_grade\": 33.5,\n  \"overall_feedback\": \"Good {overall}\",\n  \"questions\": [\n    {\"number\": 2, \"grade\": 40, \"feedback\": \"too generous\"},\n    {\"number\": 1, \"grade\": 12},\n    {\"number\": 7, \"grade\": 3}\n  ]\n}\n```";

        let result =
            engine(scripted(raw), Duration::from_secs(5)).grade("answers", &key).await;

        assert_eq!(result.mode, GradingMode::Detailed);
        assert_eq!(result.total_grade, 33.5);
        assert_eq!(result.overall_feedback, "Good {overall}");
        assert_eq!(result.questions.len(), 2);
        assert_eq!(result.questions[0].number, 1);
        assert_eq!(result.questions[0].grade, 12.0);
        assert_eq!(result.questions[1].grade, 30.0);
    }

    #[tokio::test]
    async fn retry_finds_later_object() {
        let key = answer_key(&[10.0], 10);
        let raw = r#"Thinking {"draft": true} ... final {"total_grade": 7}"#;

        let result = engine(scripted(raw), Duration::from_secs(5)).grade("answers", &key).await;

        assert_eq!(result.mode, GradingMode::Detailed);
        assert_eq!(result.total_grade, 7.0);
    }

    #[tokio::test]
    async fn non_numeric_grade_falls_back() {
        let key = answer_key(&[20.0, 30.0], 50);

        for raw in [r#"{"total_grade": "40"}"#, r#"{"overall_feedback": "no grade"}"#, "Great job!"] {
            let result = engine(scripted(raw), Duration::from_secs(5)).grade("answers", &key).await;
            assert_eq!(
                result.mode,
                GradingMode::Basic(BasicGradingReason::UnusableResponse),
                "unexpected mode for {raw}"
            );
            assert_eq!(result.total_grade, 30.0);
            assert!(result.is_degraded());
        }
    }

    #[tokio::test]
    async fn unavailable_reasoning_still_produces_grade() {
        let key = answer_key(&[25.0, 25.0], 50);

        let result = engine(Arc::new(UnavailableReasoning), Duration::from_secs(5))
            .grade("answers", &key)
            .await;

        assert!(result.is_degraded());
        assert_eq!(result.total_grade, 30.0);
        assert!(result.overall_feedback.contains(DEGRADED_FEEDBACK));
    }
}
