//! Runtime pieces of the reading application.

pub mod readiness;
pub mod reading;
