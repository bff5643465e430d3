use std::panic::AssertUnwindSafe;

use bpf_common::test_runner::{TestCase, TestReport, TestSuite};
use futures::FutureExt;
use libtest_mimic::{Arguments, Failed, Trial};
use tokio::sync::{mpsc, oneshot};

/// Level of the logs attached to failed tests, `trace` by default.
const LOG_LEVEL_VAR: &str = "TEST_SUITE_LOG";

pub struct TestSuiteRunner {
    tx_test: mpsc::Sender<TestRequest>,
}

struct TestRequest {
    test_case: TestCase,
    tx_reply: oneshot::Sender<Result<(), Failed>>,
}

impl TestSuiteRunner {
    /// Spawn the actual test runner in a background task. This is needed to run
    /// async tests from libtest_mimic.
    pub fn spawn() -> Self {
        // Writing to stdout would mess up the libtest output,
        // logs and panics go to a channel instead.
        let (tx_log, mut rx_log) = mpsc::unbounded_channel();
        replace_logger(tx_log.clone());
        replace_panic_hook(tx_log);
        let (tx_test, mut rx_test) = mpsc::channel::<TestRequest>(1);
        tokio::spawn(async move {
            while let Some(TestRequest {
                test_case,
                tx_reply,
            }) = rx_test.recv().await
            {
                // Panics in probe triggers count as failures
                let TestReport { success, mut lines } = AssertUnwindSafe(test_case.test)
                    .catch_unwind()
                    .await
                    .unwrap_or(TestReport {
                        success: false,
                        lines: vec![],
                    });

                // Logs of this test are only shown when it fails
                while let Ok(log) = rx_log.try_recv() {
                    lines.push(log);
                }

                let outcome = if success {
                    Ok(())
                } else {
                    Err(lines.join("\n").into())
                };
                if tx_reply.send(outcome).is_err() {
                    break;
                }
            }
        });

        Self { tx_test }
    }

    /// Run the test suites with libtest-mimic.
    pub async fn run_tests(&self, modules: Vec<TestSuite>) {
        let tests = modules
            .into_iter()
            .flat_map(|test_suite: TestSuite| {
                test_suite
                    .tests
                    .into_iter()
                    .map(move |test_case| (test_suite.name, test_case))
            })
            // Every trial forwards its test case to the background task
            .map(|(module_name, test_case)| {
                let test_name = format!("{}::{}", module_name, test_case.name);
                let (tx_reply, rx_reply) = oneshot::channel();
                let test_request = TestRequest {
                    tx_reply,
                    test_case,
                };
                let tx_test = self.tx_test.clone();
                let run_in_background = move || {
                    tx_test
                        .blocking_send(test_request)
                        .map_err(|_| "test runner failed to accept request")?;
                    rx_reply
                        .blocking_recv()
                        .map_err(|_| "test runner failed to send reply")?
                };
                Trial::test(test_name, run_in_background)
            })
            .collect();

        let args = Arguments::from_args();
        let conclusion = tokio::task::spawn_blocking(move || libtest_mimic::run(&args, tests))
            .await
            .expect("test runner task panicked");
        conclusion.exit();
    }
}

/// Forward log records over a channel, so they can be attached to the
/// report of the test which produced them.
fn replace_logger(tx_log: mpsc::UnboundedSender<String>) {
    struct ChannelLogger(mpsc::UnboundedSender<String>);

    impl log::Log for ChannelLogger {
        fn enabled(&self, _: &log::Metadata) -> bool {
            true
        }
        fn log(&self, record: &log::Record) {
            let _ = self.0.send(format!(
                "{}:{} -- {}",
                record.level(),
                record.target(),
                record.args()
            ));
        }
        fn flush(&self) {}
    }

    let level = std::env::var(LOG_LEVEL_VAR)
        .ok()
        .and_then(|level| level.parse().ok())
        .unwrap_or(log::LevelFilter::Trace);
    log::set_boxed_logger(Box::new(ChannelLogger(tx_log)))
        .map(|()| log::set_max_level(level))
        .expect("initializing logger failed");
}

/// Replace the panic hook with one which sends a message over the log channel
fn replace_panic_hook(tx_log: mpsc::UnboundedSender<String>) {
    if std::env::var("USE_NORMAL_PANIC_HANDLER").is_err() {
        std::panic::set_hook(Box::new(move |panic_info| {
            let panic_msg = if let Some(msg) = panic_info.payload().downcast_ref::<&str>() {
                msg.to_string()
            } else if let Some(msg) = panic_info.payload().downcast_ref::<String>() {
                msg.to_string()
            } else {
                "Unknown panic error\nRe-run exporting the USE_NORMAL_PANIC_HANDLER env variable"
                    .to_string()
            };
            let location = panic_info
                .location()
                .map(ToString::to_string)
                .unwrap_or_else(|| "unknown location".to_string());
            let _ = tx_log.send(format!("Panic: {panic_msg}\n  | at {location}"));
        }));
    }
}
