use std::{future::Future, pin::Pin, task::Poll};

use backoff::backoff::Backoff;
use futures::{Stream, TryStream};
use pin_project::pin_project;
use tokio::time::{sleep, Instant, Sleep};

/// Applies a [`Backoff`] policy to a [`Stream`]
///
/// After any [`Err`] is emitted, the stream is paused for
/// [`Backoff::next_backoff`]. The [`Backoff`] is [`reset`](`Backoff::reset`)
/// on any [`Ok`] value.
///
/// If [`Backoff::next_backoff`] returns [`None`] then the backing stream is
/// given up on, and closed.
#[pin_project]
pub struct StreamBackoff<S, B> {
    #[pin]
    stream: S,
    backoff: B,
    #[pin]
    state: State,
}

#[pin_project(project = StreamBackoffStateProj)]
// It's expected to have relatively few but long-lived `StreamBackoff`s in a
// project, so we would rather have cheaper sleeps than a smaller
// `StreamBackoff`.
#[allow(clippy::large_enum_variant)]
enum State {
    BackingOff(#[pin] Sleep),
    GivenUp,
    Awake,
}

impl<S: TryStream, B: Backoff> StreamBackoff<S, B> {
    pub fn new(stream: S, backoff: B) -> Self {
        Self {
            stream,
            backoff,
            state: State::Awake,
        }
    }
}

impl<S: TryStream, B: Backoff> Stream for StreamBackoff<S, B> {
    type Item = Result<S::Ok, S::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        match this.state.as_mut().project() {
            StreamBackoffStateProj::BackingOff(mut backoff_sleep) => match backoff_sleep.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    tracing::debug!(deadline = ?backoff_sleep.deadline(), "Backoff complete, waking up");
                    this.state.set(State::Awake)
                }
                Poll::Pending => {
                    let deadline = backoff_sleep.deadline();
                    tracing::trace!(
                        ?deadline,
                        remaining_duration = ?deadline.saturating_duration_since(Instant::now()),
                        "Still waiting for backoff sleep to complete"
                    );
                    return Poll::Pending;
                }
            },
            StreamBackoffStateProj::GivenUp => {
                tracing::debug!("Backoff has given up, stream is closed");
                return Poll::Ready(None);
            }
            StreamBackoffStateProj::Awake => {}
        }

        let next_item = this.stream.try_poll_next(cx);
        match &next_item {
            Poll::Ready(Some(Err(_))) => {
                if let Some(backoff_duration) = this.backoff.next_backoff() {
                    let backoff_sleep = sleep(backoff_duration);
                    tracing::debug!(
                        deadline = ?backoff_sleep.deadline(),
                        duration = ?backoff_duration,
                        "Error received, backing off"
                    );
                    this.state.set(State::BackingOff(backoff_sleep));
                } else {
                    tracing::debug!("Error received, giving up");
                    this.state.set(State::GivenUp);
                }
            }
            Poll::Ready(_) => {
                tracing::trace!("Non-error received, resetting backoff");
                this.backoff.reset();
            }
            Poll::Pending => {}
        }
        next_item
    }
}

#[cfg(test)]
mod tests {
    use super::StreamBackoff;
    use backoff::backoff::{Backoff, Constant, Stop};
    use futures::{channel::mpsc, poll, stream, StreamExt};
    use std::{pin::pin, task::Poll, time::Duration};

    #[tokio::test]
    async fn stream_should_back_off() {
        tokio::time::pause();
        let tick = Duration::from_secs(1);
        let rx = stream::iter([Ok(0), Ok(1), Err(2), Ok(3), Ok(4)]);
        let mut backoff_stream = pin!(StreamBackoff::new(rx, Constant::new(tick)));
        assert_eq!(poll!(backoff_stream.next()), Poll::Ready(Some(Ok(0))));
        assert_eq!(poll!(backoff_stream.next()), Poll::Ready(Some(Ok(1))));
        assert_eq!(poll!(backoff_stream.next()), Poll::Ready(Some(Err(2))));
        // an error pauses the stream for the backoff duration
        assert_eq!(poll!(backoff_stream.next()), Poll::Pending);
        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(poll!(backoff_stream.next()), Poll::Pending);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(poll!(backoff_stream.next()), Poll::Ready(Some(Ok(3))));
        assert_eq!(poll!(backoff_stream.next()), Poll::Ready(Some(Ok(4))));
        assert_eq!(poll!(backoff_stream.next()), Poll::Ready(None));
    }

    #[tokio::test]
    async fn backoff_time_uses_pending_duration_correctly() {
        tokio::time::pause();
        let (mut tx, rx) = mpsc::unbounded::<Result<u8, u8>>();
        let mut backoff_stream = pin!(StreamBackoff::new(rx, Constant::new(Duration::from_secs(5))));
        tx.start_send(Err(0)).unwrap();
        assert_eq!(poll!(backoff_stream.next()), Poll::Ready(Some(Err(0))));
        // the sender can keep producing while we are backing off
        tx.start_send(Ok(1)).unwrap();
        assert_eq!(poll!(backoff_stream.next()), Poll::Pending);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(poll!(backoff_stream.next()), Poll::Ready(Some(Ok(1))));
    }

    #[tokio::test]
    async fn giving_up_closes_the_stream() {
        struct NoRetry;
        impl Backoff for NoRetry {
            fn next_backoff(&mut self) -> Option<Duration> {
                Stop {}.next_backoff()
            }
        }
        let rx = stream::iter([Ok(0), Err(1), Ok(2)]);
        let backoff_stream = StreamBackoff::new(rx, NoRetry);
        assert_eq!(
            backoff_stream.collect::<Vec<_>>().await,
            vec![Ok(0), Err(1)]
        );
    }
}
