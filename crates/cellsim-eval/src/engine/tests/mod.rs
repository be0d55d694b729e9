mod common;
mod deletion;
mod parallel;
mod run_steps;
