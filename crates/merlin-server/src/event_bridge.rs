use std::convert::Infallible;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, Stream};
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use merlin_core::events::{encode, heartbeat, StreamEvent};

/// Turns the coordinator's event channel into an event-stream body.
///
/// A `: ping` comment is written after every `interval` without an event.
/// The stream ends after the first terminal event or when the sender side
/// goes away. Dropping the stream drops the receiver, which the coordinator
/// treats as a cancellation.
pub fn event_stream(
    rx: mpsc::Receiver<StreamEvent>,
    interval: Duration,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    stream::unfold(Some((rx, ticker)), |state| async move {
        let (mut rx, mut ticker): (mpsc::Receiver<StreamEvent>, Interval) = state?;
        tokio::select! {
            event = rx.recv() => {
                let event = event?;
                let frame = encode(&event);
                if event.is_terminal() {
                    tracing::debug!(kind = event.kind(), "event stream finished");
                    return Some((Ok(frame), None));
                }
                ticker.reset();
                Some((Ok(frame), Some((rx, ticker))))
            }
            _ = ticker.tick() => Some((Ok(heartbeat()), Some((rx, ticker)))),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use merlin_core::events::{DonePayload, ErrorCode};

    fn text(frame: &Bytes) -> &str {
        std::str::from_utf8(frame).unwrap()
    }

    #[tokio::test]
    async fn forwards_until_terminal_event() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(StreamEvent::token("The ")).await.unwrap();
        tx.send(StreamEvent::token("door.")).await.unwrap();
        tx.send(StreamEvent::Done(DonePayload::default()))
            .await
            .unwrap();
        tx.send(StreamEvent::token("ignored")).await.unwrap();

        let frames: Vec<Bytes> = event_stream(rx, Duration::from_secs(15))
            .map(|frame| frame.unwrap())
            .collect()
            .await;
        assert_eq!(frames.len(), 3);
        assert!(text(&frames[0]).starts_with("event: token\n"));
        assert!(text(&frames[2]).starts_with("event: done\n"));
    }

    #[tokio::test]
    async fn ends_when_sender_dropped() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(StreamEvent::token("partial")).await.unwrap();
        drop(tx);
        let frames: Vec<_> = event_stream(rx, Duration::from_secs(15)).collect().await;
        assert_eq!(frames.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pings_while_idle() {
        let (tx, rx) = mpsc::channel(8);
        let mut stream = Box::pin(event_stream(rx, Duration::from_secs(15)));

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(text(&first), ": ping\n\n");

        tx.send(StreamEvent::error(ErrorCode::Cancelled, "turn cancelled"))
            .await
            .unwrap();
        let last = stream.next().await.unwrap().unwrap();
        assert!(text(&last).starts_with("event: error\n"));
        assert!(stream.next().await.is_none());
    }
}
