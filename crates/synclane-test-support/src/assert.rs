//! Assertions shared by integration suites.

use std::fmt::Debug;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tokio::sync::watch;

/// Assert every element equals the first.
///
/// # Panics
///
/// Panics when two elements differ.
pub fn assert_all_equal<T: PartialEq + Debug>(values: &[T]) {
    if let Some((first, rest)) = values.split_first() {
        for (index, value) in rest.iter().enumerate() {
            assert_eq!(value, first, "element {} differs from the first", index + 1);
        }
    }
}

/// Wait until the watched value satisfies `ready`, returning a copy of it.
///
/// # Errors
///
/// Returns an error when `timeout` elapses or the sender is dropped first.
pub async fn wait_for<S, F>(receiver: &mut watch::Receiver<S>, timeout: Duration, ready: F) -> Result<S>
where
    S: Clone,
    F: FnMut(&S) -> bool,
{
    let waited = tokio::time::timeout(timeout, receiver.wait_for(ready))
        .await
        .map_err(|_| anyhow!("condition not reached within {timeout:?}"))?;
    let value = waited.map_err(|_| anyhow!("watched value was dropped"))?;
    Ok(value.clone())
}

/// Poll `check` until it holds, yielding to other tasks between attempts.
///
/// # Errors
///
/// Returns an error when `timeout` elapses first.
pub async fn eventually<F>(timeout: Duration, mut check: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(timeout, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .map_err(|_| anyhow!("condition not reached within {timeout:?}"))
}
