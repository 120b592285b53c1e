use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

use crate::command::request::RetryPolicy;
use crate::command::result::ExecutionResult;
use crate::error::ExecResult;

/// Delay before retry number `attempt` (0-based): exponential growth from
/// the initial delay, optionally capped.
pub(crate) fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let factor = policy.backoff.max(1.0).powi(attempt as i32);
    let delay = policy.initial_delay.mul_f64(factor);
    match policy.max_delay {
        Some(cap) => delay.min(cap),
        None => delay,
    }
}

/// Drive `op` under the retry policy.
///
/// An attempt counts as failed when the adapter returns a retryable error
/// or a result with a non-zero exit code. The last outcome is returned
/// verbatim once the budget is exhausted; converting a final non-zero exit
/// into `CommandFailed` is the dispatcher's job, so nothrow semantics stay
/// out of the retry loop.
pub(crate) async fn execute_with_retry<F, Fut>(
    policy: Option<&RetryPolicy>,
    op: F,
) -> ExecResult<ExecutionResult>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = ExecResult<ExecutionResult>>,
{
    let Some(policy) = policy else {
        return op(0).await;
    };

    let mut attempt = 0u32;
    loop {
        let outcome = op(attempt).await;
        let failed = match &outcome {
            Ok(result) => !result.is_success(),
            Err(err) => err.is_retryable(policy.retry_on_timeout),
        };

        if !failed || attempt >= policy.max_retries {
            return outcome;
        }

        let delay = backoff_delay(policy, attempt);
        tracing::debug!(
            attempt = attempt + 1,
            max = policy.max_retries,
            ?delay,
            "command attempt failed, retrying after backoff"
        );
        sleep(delay).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterKind;
    use crate::command::result::Target;
    use crate::error::ExecError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn result_with_code(code: i32) -> ExecutionResult {
        let mut result = ExecutionResult::new("true", AdapterKind::Local, Target::Local);
        result.output.exit_code = code;
        result
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries).initial_delay(Duration::from_millis(1))
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::new(5)
            .initial_delay(Duration::from_millis(100))
            .max_delay(Duration::from_millis(350));
        assert_eq!(backoff_delay(&policy, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(&policy, 1), Duration::from_millis(200));
        assert_eq!(backoff_delay(&policy, 2), Duration::from_millis(350));
        assert_eq!(backoff_delay(&policy, 3), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = fast_policy(3);
        let outcome = execute_with_retry(Some(&policy), |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Ok(result_with_code(1))
                } else {
                    Ok(result_with_code(0))
                }
            }
        })
        .await
        .unwrap();
        assert!(outcome.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn attempts_bounded_by_budget() {
        let calls = AtomicU32::new(0);
        let policy = fast_policy(2);
        let outcome = execute_with_retry(Some(&policy), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(result_with_code(7)) }
        })
        .await
        .unwrap();
        assert_eq!(outcome.exit_code(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3); // max_retries + 1
    }

    #[tokio::test]
    async fn timeout_not_retried_by_default() {
        let calls = AtomicU32::new(0);
        let policy = fast_policy(3);
        let outcome = execute_with_retry(Some(&policy), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                Err(ExecError::Timeout {
                    limit: Duration::from_millis(10),
                    elapsed: Duration::from_millis(12),
                })
            }
        })
        .await;
        assert!(matches!(outcome, Err(ExecError::Timeout { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_retried_when_opted_in() {
        let calls = AtomicU32::new(0);
        let mut policy = fast_policy(2);
        policy.retry_on_timeout = true;
        let _ = execute_with_retry(Some(&policy), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                Err(ExecError::Timeout {
                    limit: Duration::from_millis(10),
                    elapsed: Duration::from_millis(12),
                })
            }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn auth_errors_surface_immediately() {
        let calls = AtomicU32::new(0);
        let policy = fast_policy(3);
        let outcome = execute_with_retry(Some(&policy), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(ExecError::AuthenticationFailed("denied".into())) }
        })
        .await;
        assert!(matches!(outcome, Err(ExecError::AuthenticationFailed(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
