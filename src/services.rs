pub(crate) mod answer_key;
pub(crate) mod coercion;
pub(crate) mod extraction;
pub(crate) mod grading_engine;
pub(crate) mod reasoning;
pub(crate) mod single_flight;
pub(crate) mod storage;
