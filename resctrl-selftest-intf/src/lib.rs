// Copyright (c) Facebook, Inc. and its affiliates.
pub mod args;
pub mod params;
pub mod report;

pub use args::Args;
pub use params::{BwReport, FillOp, Params, RunParameters, Tolerances};
pub use report::{RunResult, Verdict, VerdictPolicy, VerdictReport};

/// fill-buf exits with this when the replacement benchmark can't be exec'd.
pub const EXEC_FAILED_CODE: i32 = 127;

/// Line fill-buf waits for on stdin before touching its buffer. It's sent
/// once the child is pinned and in its resource group.
pub const GO_AHEAD: &str = "go";

lazy_static::lazy_static! {
    pub static ref VERSION: &'static str = env!("CARGO_PKG_VERSION");
}
