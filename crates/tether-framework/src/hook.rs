//! Isolation of user hooks run from background cleanup.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use thiserror::Error;

/// Why a destroy hook or timeout callback did not complete.
#[derive(Debug, Error)]
pub(crate) enum HookFailure {
    #[error("{0:#}")]
    Failed(anyhow::Error),

    #[error("panicked: {0}")]
    Panicked(String),
}

/// Awaits `hook`, turning both an error and a panic into a [`HookFailure`].
pub(crate) async fn run_hook<F>(hook: F) -> Result<(), HookFailure>
where
    F: Future<Output = anyhow::Result<()>>,
{
    match AssertUnwindSafe(hook).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(HookFailure::Failed(e)),
        Err(payload) => Err(HookFailure::Panicked(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn explode() -> anyhow::Result<()> {
        panic!("boom")
    }

    #[tokio::test]
    async fn test_hook_ok() {
        assert!(run_hook(async { Ok(()) }).await.is_ok());
    }

    #[tokio::test]
    async fn test_hook_error_is_captured() {
        let failure = run_hook(async { Err(anyhow::anyhow!("disk full")) })
            .await
            .unwrap_err();
        assert!(matches!(failure, HookFailure::Failed(_)));
        assert_eq!(failure.to_string(), "disk full");
    }

    #[tokio::test]
    async fn test_hook_panic_is_captured() {
        let failure = run_hook(explode()).await.unwrap_err();
        assert_eq!(failure.to_string(), "panicked: boom");
    }
}
