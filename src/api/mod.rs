pub(crate) mod attempts;
pub(crate) mod errors;
pub(crate) mod exams;
pub(crate) mod guards;
pub(crate) mod handlers;
pub(crate) mod problems;
pub(crate) mod router;
pub(crate) mod submissions;
pub(crate) mod users;
