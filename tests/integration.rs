#![cfg(feature = "integration")]

mod common;

#[path = "integration/build_local.rs"]
mod build_local;
#[path = "integration/run_local.rs"]
mod run_local;
