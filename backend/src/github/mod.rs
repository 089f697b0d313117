pub mod clients;
pub mod host;
pub mod serve;
