//! API route modules.

pub mod jobs;
