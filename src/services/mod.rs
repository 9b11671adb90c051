pub(crate) mod access;
pub(crate) mod ai_grading;
pub(crate) mod answer_cache;
pub(crate) mod attempt_timer;
pub(crate) mod attempts;
pub(crate) mod exam_status;
pub(crate) mod grading;
pub(crate) mod ledger;
pub(crate) mod practice;
pub(crate) mod rubric;
