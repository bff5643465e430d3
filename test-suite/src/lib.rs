mod test_suite_runner;

pub use test_suite_runner::TestSuiteRunner;

/// Test suites of every probe module
pub fn modules() -> Vec<bpf_common::test_runner::TestSuite> {
    vec![file_system_monitor::test_suite::tests()]
}
