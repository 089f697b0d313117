#![recursion_limit = "256"]

pub mod config;
pub mod digest;
pub mod error;
pub mod github;
pub mod job;
pub mod readme;
pub mod schema;
pub mod serve;
