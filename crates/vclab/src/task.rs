//! Waiting on asynchronous backend tasks.

use std::time::Duration;

use log::debug;

use crate::backend::Backend;
use crate::error::{DriverError, DriverResult, FaultKind};
use crate::retry::{retry_until, Attempt};
use crate::types::{TaskRef, TaskStatus};

/// Interval between task status reads.
pub(crate) const TASK_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Block until `task` reaches a terminal state or `timeout` elapses.
///
/// Success returns the optional task result. A reported fault whose kind
/// is in `swallow` is treated as no-op success; any other fault is
/// surfaced to the caller verbatim.
pub async fn wait_for_task(
    backend: &dyn Backend,
    task: &TaskRef,
    what: &str,
    timeout: Duration,
    swallow: &[FaultKind],
) -> DriverResult<Option<String>> {
    debug!("waiting for {what} (task {})", task.id);
    retry_until(timeout, TASK_POLL_INTERVAL, what, move || async move {
        match backend.task_status(task).await {
            Ok(TaskStatus::Succeeded(result)) => Ok(result),
            Ok(TaskStatus::Failed(fault)) => {
                if swallow.contains(&fault.kind) {
                    debug!(
                        "{what}: fault {:?} ('{}') treated as no-op success",
                        fault.kind, fault.message
                    );
                    Ok(None)
                } else {
                    Err(Attempt::Fatal(DriverError::fault(fault.kind, fault.message)))
                }
            }
            Ok(_) => Err(Attempt::Transient(DriverError::other(format!(
                "{what} still in progress"
            )))),
            Err(err) => Err(Attempt::Transient(err)),
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DriverErrorKind;
    use crate::testing::FakeBackend;
    use crate::types::BackendFault;
    use std::sync::Arc;

    fn task() -> TaskRef {
        TaskRef::new("task-1")
    }

    #[tokio::test]
    async fn test_success_returns_result() {
        let backend = Arc::new(FakeBackend::new());
        backend.script_task("task-1", TaskStatus::Succeeded(Some("vm-9".into())));
        let result = wait_for_task(
            backend.as_ref(),
            &task(),
            "clone",
            Duration::from_secs(1),
            &[],
        )
        .await
        .unwrap();
        assert_eq!(result.as_deref(), Some("vm-9"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_through_running_states() {
        let backend = Arc::new(FakeBackend::new());
        backend.script_task_sequence(
            "task-1",
            vec![
                TaskStatus::Queued,
                TaskStatus::Running,
                TaskStatus::Succeeded(None),
            ],
        );
        let result = wait_for_task(
            backend.as_ref(),
            &task(),
            "power on",
            Duration::from_secs(30),
            &[],
        )
        .await
        .unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_fault_in_allow_list_is_swallowed() {
        let backend = Arc::new(FakeBackend::new());
        backend.script_task(
            "task-1",
            TaskStatus::Failed(BackendFault {
                kind: FaultKind::InvalidPowerState,
                message: "already powered on".into(),
            }),
        );
        wait_for_task(
            backend.as_ref(),
            &task(),
            "power on",
            Duration::from_secs(1),
            &[FaultKind::InvalidPowerState],
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_fault_outside_allow_list_propagates() {
        let backend = Arc::new(FakeBackend::new());
        backend.script_task(
            "task-1",
            TaskStatus::Failed(BackendFault {
                kind: FaultKind::DuplicateName,
                message: "name taken".into(),
            }),
        );
        let err = wait_for_task(
            backend.as_ref(),
            &task(),
            "clone",
            Duration::from_secs(1),
            &[FaultKind::InvalidPowerState],
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Fault(FaultKind::DuplicateName));
        assert!(err.message.contains("name taken"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_terminal_times_out() {
        let backend = Arc::new(FakeBackend::new());
        backend.script_task("task-1", TaskStatus::Running);
        let err = wait_for_task(
            backend.as_ref(),
            &task(),
            "revert",
            Duration::from_secs(2),
            &[],
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Timeout);
    }
}
