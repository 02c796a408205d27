use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::types::GradingModeKind;

pub(crate) const MANUAL_REVIEW_ANSWER: &str = "manual review required";

/// Marks are compared with this tolerance after rescaling.
const MARKS_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionKey {
    pub number: u32,
    pub ideal_answer: String,
    #[serde(default)]
    pub key_points: BTreeSet<String>,
    pub max_marks: f64,
    #[serde(default)]
    pub marking_criteria: BTreeSet<String>,
}

#[derive(Debug, Error, PartialEq)]
pub enum AnswerKeyError {
    #[error("answer key has no questions")]
    NoQuestions,
    #[error("total marks must be positive")]
    InvalidTotal,
    #[error("question number {0} is not a positive integer")]
    InvalidQuestionNumber(u32),
    #[error("question {0} appears more than once")]
    DuplicateQuestion(u32),
    #[error("question {0} has non-positive or non-finite max marks")]
    InvalidQuestionMarks(u32),
    #[error("question {0} has an empty ideal answer")]
    EmptyIdealAnswer(u32),
    #[error("question marks do not add up to a finite total")]
    UnboundedMarks,
}

/// Per-assignment rubric. Always has at least one question and its question marks
/// always sum to `total_marks`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "AnswerKeyRecord")]
pub struct AnswerKey {
    questions: Vec<QuestionKey>,
    total_marks: u32,
    requires_manual_review: bool,
}

#[derive(Deserialize)]
struct AnswerKeyRecord {
    questions: Vec<QuestionKey>,
    total_marks: u32,
    #[serde(default)]
    requires_manual_review: bool,
}

impl TryFrom<AnswerKeyRecord> for AnswerKey {
    type Error = AnswerKeyError;

    fn try_from(record: AnswerKeyRecord) -> Result<Self, Self::Error> {
        if record.requires_manual_review {
            return Ok(Self::degenerate(record.total_marks));
        }
        Self::new(record.questions, record.total_marks)
    }
}

impl AnswerKey {
    /// Builds a validated key. Question marks that do not add up to `total_marks`
    /// are rescaled proportionally.
    pub fn new(
        mut questions: Vec<QuestionKey>,
        total_marks: u32,
    ) -> Result<Self, AnswerKeyError> {
        if total_marks == 0 {
            return Err(AnswerKeyError::InvalidTotal);
        }
        if questions.is_empty() {
            return Err(AnswerKeyError::NoQuestions);
        }

        let mut seen = HashSet::new();
        for question in &mut questions {
            if question.number == 0 {
                return Err(AnswerKeyError::InvalidQuestionNumber(question.number));
            }
            if !seen.insert(question.number) {
                return Err(AnswerKeyError::DuplicateQuestion(question.number));
            }
            if !question.max_marks.is_finite() || question.max_marks <= 0.0 {
                return Err(AnswerKeyError::InvalidQuestionMarks(question.number));
            }
            question.ideal_answer = question.ideal_answer.trim().to_string();
            if question.ideal_answer.is_empty() {
                return Err(AnswerKeyError::EmptyIdealAnswer(question.number));
            }
            question.key_points = normalize_set(&question.key_points);
            question.marking_criteria = normalize_set(&question.marking_criteria);
        }

        let total = f64::from(total_marks);
        let sum: f64 = questions.iter().map(|question| question.max_marks).sum();
        if !sum.is_finite() {
            return Err(AnswerKeyError::UnboundedMarks);
        }
        if (sum - total).abs() > MARKS_EPSILON {
            let factor = total / sum;
            for question in &mut questions {
                question.max_marks *= factor;
            }
        }

        questions.sort_by_key(|question| question.number);

        Ok(Self { questions, total_marks, requires_manual_review: false })
    }

    /// Sentinel key used when synthesis is impossible.
    pub fn degenerate(total_marks: u32) -> Self {
        let total_marks = total_marks.max(1);
        Self {
            questions: vec![QuestionKey {
                number: 1,
                ideal_answer: MANUAL_REVIEW_ANSWER.to_string(),
                key_points: BTreeSet::new(),
                max_marks: f64::from(total_marks),
                marking_criteria: BTreeSet::new(),
            }],
            total_marks,
            requires_manual_review: true,
        }
    }

    pub fn questions(&self) -> &[QuestionKey] {
        &self.questions
    }

    pub fn total_marks(&self) -> u32 {
        self.total_marks
    }

    pub(crate) fn total_marks_f64(&self) -> f64 {
        f64::from(self.total_marks)
    }

    pub fn requires_manual_review(&self) -> bool {
        self.requires_manual_review
    }

    pub fn question(&self, number: u32) -> Option<&QuestionKey> {
        self.questions.iter().find(|question| question.number == number)
    }
}

fn normalize_set(items: &BTreeSet<String>) -> BTreeSet<String> {
    items.iter().map(|item| item.trim().to_string()).filter(|item| !item.is_empty()).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BasicGradingReason {
    ManualReviewKey,
    EmptySubmission,
    ReasoningUnavailable,
    UnusableResponse,
}

impl BasicGradingReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ManualReviewKey => "manual_review_key",
            Self::EmptySubmission => "empty_submission",
            Self::ReasoningUnavailable => "reasoning_unavailable",
            Self::UnusableResponse => "unusable_response",
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Self::ManualReviewKey => "the answer key for this assignment requires manual review",
            Self::EmptySubmission => "no readable content was found in the submission",
            Self::ReasoningUnavailable => "the evaluation service could not be reached",
            Self::UnusableResponse => "the evaluation service returned an unusable response",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "reason", rename_all = "snake_case")]
pub enum GradingMode {
    Detailed,
    Basic(BasicGradingReason),
}

impl GradingMode {
    pub fn kind(self) -> GradingModeKind {
        match self {
            Self::Detailed => GradingModeKind::Detailed,
            Self::Basic(_) => GradingModeKind::Basic,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Detailed => "detailed",
            Self::Basic(reason) => reason.as_str(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionGrade {
    pub number: u32,
    pub grade: f64,
    pub max_marks: f64,
    pub feedback: String,
}

/// Outcome of one grading attempt. `total_grade` is on the assignment's max-marks
/// scale and already clamped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradingResult {
    pub total_grade: f64,
    pub max_marks: f64,
    pub overall_feedback: String,
    pub questions: Vec<QuestionGrade>,
    pub mode: GradingMode,
}

impl GradingResult {
    pub fn is_degraded(&self) -> bool {
        matches!(self.mode, GradingMode::Basic(_))
    }
}

/// Clamps a grade into `[0, max_marks]`. Non-finite grades clamp to zero.
pub(crate) fn clamp_grade(grade: f64, max_marks: f64) -> f64 {
    let upper = if max_marks.is_finite() { max_marks.max(0.0) } else { 0.0 };
    if !grade.is_finite() {
        return 0.0;
    }
    grade.max(0.0).min(upper)
}

pub(crate) fn round_marks(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
