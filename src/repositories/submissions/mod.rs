mod commands;
mod queries;
mod types;

pub(crate) use commands::{record_auto_grade, record_grading_failure};
pub(crate) use queries::{find_by_id, list_ungraded_assignment_ids, list_ungraded_ids};
pub(crate) use types::AutoGradeUpdate;
