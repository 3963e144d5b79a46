//! Waiting helpers for asynchronous state.
//!
//! All waits are bounded by [`WAIT_TIMEOUT`] and panic with the supplied
//! description when it expires. Under a paused tokio clock the bound is
//! virtual time.

use call_session::actors::{ControllerStatus, SessionControllerHandle, SessionView};
use std::time::Duration;
use tokio::sync::watch;

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Wait until the published view satisfies `predicate`.
///
/// # Panics
///
/// Panics on timeout or when the negotiator is gone before the predicate
/// held.
pub async fn wait_for_view<F>(
    view: &mut watch::Receiver<SessionView>,
    what: &str,
    mut predicate: F,
) -> SessionView
where
    F: FnMut(&SessionView) -> bool,
{
    let outcome = tokio::time::timeout(WAIT_TIMEOUT, view.wait_for(|v| predicate(v)))
        .await
        .map(|waited| waited.map(|current| (*current).clone()));

    match outcome {
        Ok(Ok(current)) => current,
        Ok(Err(_)) => {
            let last = view.borrow().clone();
            if predicate(&last) {
                return last;
            }
            panic!("negotiator exited before: {what}; last view: {last:?}")
        }
        Err(_) => panic!("timed out waiting for: {what}; last view: {:?}", view.borrow()),
    }
}

/// Poll `condition` until it holds.
///
/// # Panics
///
/// Panics on timeout.
pub async fn wait_until<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll the controller until its status satisfies `predicate`.
///
/// # Panics
///
/// Panics on timeout or when the controller stops answering.
pub async fn wait_for_status<F>(
    controller: &SessionControllerHandle,
    what: &str,
    mut predicate: F,
) -> ControllerStatus
where
    F: FnMut(&ControllerStatus) -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    loop {
        let status = controller
            .status()
            .await
            .expect("controller stopped answering");
        if predicate(&status) {
            return status;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {what}; last status: {status:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
