pub(crate) mod answer_keys;
pub(crate) mod assignments;
mod grading;
pub(crate) mod submissions;

pub(crate) use grading::grading_breakdown;
pub use grading::{GradingRepository, PgGradingRepository};
