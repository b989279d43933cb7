#![allow(dead_code)]

pub use pipewright_test_utils::builders;
pub use pipewright_test_utils::fake_executor;
pub use pipewright_test_utils::{init_tracing, push_trigger, scheduler_for, with_timeout};
