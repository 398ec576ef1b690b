//! HypervisorControl port - ハイパーバイザー操作
//!
//! Handlers talk to the hypervisor through a synchronous "run a command,
//! get its output lines" interface. They run on the FSM worker thread, so
//! blocking here only blocks the session that issued the command.

use std::collections::BTreeMap;

use tracing::debug;

use crate::domain::HvStatus;
use crate::fsm::{ActionContext, ActionError};
use crate::retry::RetryPolicy;

/// HypervisorControl は VM 操作コマンドを実行
///
/// # 設計原則
/// - 成功時は stdout の行を返す
/// - 失敗は `HvStatus` の負のコードで返す
/// - 再試行は呼び出し側（`exec_with_retry`）が決める
pub trait HypervisorControl: Send + Sync {
    fn exec(&self, args: &[&str]) -> Result<Vec<String>, HvStatus>;
}

/// Split `key<sep>value` lines into a map.
///
/// Only the first separator splits; keys and values are trimmed. Lines
/// without a separator are ignored.
pub fn parse_key_values(lines: &[String], sep: char) -> BTreeMap<String, String> {
    lines
        .iter()
        .filter_map(|line| line.split_once(sep))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .collect()
}

/// Run `args`, retrying failures per `policy`.
///
/// Backoff sleeps go through the action context, so stopping the machine
/// interrupts them.
pub fn exec_with_retry(
    hv: &dyn HypervisorControl,
    args: &[&str],
    policy: &RetryPolicy,
    ctx: &ActionContext,
) -> Result<Vec<String>, ActionError> {
    let mut attempts = 0;
    loop {
        ctx.checkpoint()?;
        attempts += 1;
        match hv.exec(args) {
            Ok(lines) => return Ok(lines),
            Err(status) if status.is_retryable() && policy.should_retry(attempts) => {
                let delay = policy.next_delay(attempts);
                debug!(command = ?args, attempts, %status, ?delay, "command failed; retrying");
                ctx.sleep(delay)?;
            }
            Err(status) => return Err(status.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::FsmBuilder;
    use crate::impls::SimulatedHypervisor;
    use rstest::rstest;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn splits_on_first_separator_and_trims() {
        let map = parse_key_values(
            &lines(&["Name:  demo", "State: running (since 10:42:01)", "garbage"]),
            ':',
        );
        assert_eq!(map.len(), 2);
        assert_eq!(map["Name"], "demo");
        assert_eq!(map["State"], "running (since 10:42:01)");
    }

    #[rstest]
    #[case('=', &["memory=1024", "cpus = 2"], &[("cpus", "2"), ("memory", "1024")])]
    #[case(':', &[":no key", "empty:"], &[("empty", "")])]
    fn separators(
        #[case] sep: char,
        #[case] raw: &[&str],
        #[case] expected: &[(&str, &str)],
    ) {
        let map = parse_key_values(&lines(raw), sep);
        let got: Vec<(&str, &str)> = map.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        assert_eq!(got, expected);
    }

    fn run_once(
        hv: Arc<SimulatedHypervisor>,
        args: &'static [&'static str],
    ) -> Result<Vec<String>, ActionError> {
        let result = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&result);
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(1),
            jitter: 0.0,
            ..RetryPolicy::default()
        };
        let fsm = FsmBuilder::new()
            .state(1, &[2])
            .action(
                2,
                move |ctx: &ActionContext| {
                    *slot.lock().unwrap() = Some(exec_with_retry(hv.as_ref(), args, &policy, ctx));
                    Ok(())
                },
                &[],
            )
            .build(1)
            .unwrap();
        assert!(fsm.goto(2));
        assert!(fsm.continue_once());
        let out = result.lock().unwrap().take().unwrap();
        out
    }

    #[test]
    fn transient_failures_are_retried() {
        let hv = Arc::new(SimulatedHypervisor::new());
        hv.fail_next("createvm", HvStatus::ExternalError, 2);
        assert!(run_once(Arc::clone(&hv), &["createvm", "vm"]).is_ok());
        assert_eq!(hv.history().len(), 3);
    }

    #[test]
    fn permanent_failures_are_not_retried() {
        let hv = Arc::new(SimulatedHypervisor::new());
        let err = run_once(Arc::clone(&hv), &["showvminfo", "ghost"]).unwrap_err();
        assert_eq!(err, ActionError::from(HvStatus::NotFound));
        assert_eq!(hv.history().len(), 1);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let hv = Arc::new(SimulatedHypervisor::new());
        hv.fail_next("createvm", HvStatus::IoError, 10);
        let err = run_once(Arc::clone(&hv), &["createvm", "vm"]).unwrap_err();
        assert_eq!(err, ActionError::from(HvStatus::IoError));
        assert_eq!(hv.history().len(), 4);
    }
}
