use std::{future::Future, time::Duration};

/// Applies a Tokio `timeout` when `dur` is set, otherwise awaits the future normally.
pub(crate) async fn timeout_opt<T, F>(
    dur: Option<Duration>,
    fut: F,
) -> Result<T, tokio::time::error::Elapsed>
where
    F: Future<Output = T>,
{
    match dur {
        Some(dur) => tokio::time::timeout(dur, fut).await,
        None => Ok(fut.await),
    }
}

/// A sleep that never fires when `dur` is `None`. Re-arm with [`IdleTimer::reset`].
pub(crate) struct IdleTimer {
    dur: Option<Duration>,
    sleep: std::pin::Pin<Box<tokio::time::Sleep>>,
}

impl IdleTimer {
    pub(crate) fn new(dur: Option<Duration>) -> Self {
        // An unset timer still needs a `Sleep` to keep the type uniform; it is never polled.
        let initial = dur.unwrap_or(Duration::from_secs(3600));
        Self {
            dur,
            sleep: Box::pin(tokio::time::sleep(initial)),
        }
    }

    pub(crate) fn reset(&mut self) {
        if let Some(dur) = self.dur {
            self.sleep
                .as_mut()
                .reset(tokio::time::Instant::now() + dur);
        }
    }

    pub(crate) async fn expired(&mut self) {
        match self.dur {
            Some(_) => self.sleep.as_mut().await,
            None => std::future::pending().await,
        }
    }
}
