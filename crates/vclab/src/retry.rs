//! Deadline-bounded retry primitive shared by every polling operation:
//! IP acquisition, remote command execution, chunked uploads, and task
//! completion all run through [`retry_until`] so deadline semantics and
//! error wrapping stay consistent.

use std::future::Future;
use std::time::Duration;

use log::debug;
use tokio::time::{sleep, Instant};

use crate::error::{DriverError, DriverErrorKind, DriverResult};

/// Outcome of a single attempt inside [`retry_until`].
#[derive(Debug)]
pub enum Attempt {
    /// Retry after the poll interval, until the deadline.
    Transient(DriverError),
    /// Abort the loop immediately with this error.
    Fatal(DriverError),
}

/// Invoke `action` until it succeeds, aborts, or `deadline` elapses.
///
/// The deadline is wall-clock, measured from loop entry. A zero deadline
/// means exactly one attempt with no wait. Nothing is cached between
/// attempts. On expiry the last transient failure is carried in the
/// `Timeout` error's details.
pub async fn retry_until<T, F, Fut>(
    deadline: Duration,
    interval: Duration,
    what: &str,
    mut action: F,
) -> DriverResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Attempt>>,
{
    let started = Instant::now();
    let mut last: Option<DriverError> = None;
    loop {
        match action().await {
            Ok(value) => return Ok(value),
            Err(Attempt::Fatal(err)) => return Err(err),
            Err(Attempt::Transient(err)) => {
                debug!("{what}: attempt failed: {err}");
                last = Some(err);
            }
        }
        if started.elapsed() >= deadline {
            break;
        }
        sleep(interval).await;
    }
    let message = format!(
        "{what} did not complete within {} seconds",
        deadline.as_secs()
    );
    Err(match last {
        Some(cause) => DriverError::with_details(DriverErrorKind::Timeout, message, cause.to_string()),
        None => DriverError::timeout(message),
    })
}
