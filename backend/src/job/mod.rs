pub mod model;
pub mod run;
pub mod serve;

#[cfg(test)]
mod tests;
