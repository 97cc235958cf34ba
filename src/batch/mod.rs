pub mod output;
pub mod runner;
