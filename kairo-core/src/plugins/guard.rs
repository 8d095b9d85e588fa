use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use crate::error::{KairoError, KairoResult};

/// Awaits a plugin hook, turning a panic inside it into an execution error
/// attributed to `plugin_id`.
pub(crate) async fn contain_panic<T, F>(plugin_id: &str, hook: F) -> KairoResult<T>
where
    F: Future<Output = KairoResult<T>>,
{
    match AssertUnwindSafe(hook).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(KairoError::execution(
            plugin_id,
            format!("panicked: {}", panic_message(payload.as_ref())),
        )),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_panic_becomes_error() {
        let result: KairoResult<()> = contain_panic("boom", async { panic!("kaboom") }).await;
        let err = result.unwrap_err();
        assert!(matches!(err, KairoError::PluginExecutionFailed { .. }));
        assert!(err.to_string().contains("kaboom"));
    }

    #[tokio::test]
    async fn test_ok_passes_through() {
        let result = contain_panic("fine", async { Ok(7) }).await.unwrap();
        assert_eq!(result, 7);
    }
}
