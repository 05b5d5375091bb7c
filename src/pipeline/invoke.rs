use std::any::Any;
use std::future::Future;
use std::time::Duration;

use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use crate::plugin::PluginError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CallError {
    TimedOut,
    Failed(String),
}

/// Runs one hook call on its own task so a panic or a hang stays contained.
/// On timeout the call's token is cancelled and the task aborted; the caller
/// moves on without waiting for it.
pub(crate) async fn call_with_budget<T, F>(
    budget: Duration,
    cancel: &CancellationToken,
    call: F,
) -> Result<T, CallError>
where
    F: Future<Output = Result<T, PluginError>> + Send + 'static,
    T: Send + 'static,
{
    let mut task = tokio::spawn(call);
    match tokio::time::timeout(budget, &mut task).await {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(err))) => Err(CallError::Failed(err.to_string())),
        Ok(Err(err)) => Err(CallError::Failed(join_failure(err))),
        Err(_) => {
            cancel.cancel();
            task.abort();
            Err(CallError::TimedOut)
        }
    }
}

fn join_failure(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    format!("panicked: {}", panic_message(err.into_panic()))
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(_) => "unknown panic".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_value_within_budget() {
        let cancel = CancellationToken::new();
        let result = call_with_budget(Duration::from_secs(1), &cancel, async { Ok(7_u32) }).await;
        assert_eq!(result, Ok(7));
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn maps_plugin_errors_to_failures() {
        let cancel = CancellationToken::new();
        let result: Result<(), _> = call_with_budget(Duration::from_secs(1), &cancel, async {
            Err(PluginError::Runtime("bad input".to_string()))
        })
        .await;
        assert_eq!(result, Err(CallError::Failed("bad input".to_string())));
    }

    #[tokio::test]
    async fn contains_panics() {
        let cancel = CancellationToken::new();
        let result: Result<(), _> = call_with_budget(Duration::from_secs(1), &cancel, async {
            panic!("plugin exploded");
        })
        .await;
        assert_eq!(
            result,
            Err(CallError::Failed("panicked: plugin exploded".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancels_token_on_timeout() {
        let cancel = CancellationToken::new();
        let result: Result<(), _> = call_with_budget(Duration::from_millis(50), &cancel, async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;
        assert_eq!(result, Err(CallError::TimedOut));
        assert!(cancel.is_cancelled());
    }
}
