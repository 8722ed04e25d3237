//! Byte-counted I/O and periodic progress reporting.
//!
//! `CountingReader`/`CountingWriter` wrap an inner stream and record bytes
//! moved through it behind a mutex so a `Ticker` running on another task
//! can sample the total without synchronizing with the I/O itself. `Ticker`
//! turns those samples into a steady stream of `Progress` events on a
//! channel until cancelled or the evaluator reports a terminal error.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Shared counter a `CountingReader`/`CountingWriter` updates and a
/// `Ticker` samples. Cloneable so both sides can hold a handle.
#[derive(Clone, Default)]
pub struct Counter(Arc<Mutex<u64>>);

impl Counter {
    pub fn new() -> Counter {
        Counter::default()
    }

    fn add(&self, n: u64) {
        let mut total = self.0.lock().expect("counter mutex poisoned");
        *total += n;
    }

    /// Current cumulative total.
    pub fn total(&self) -> u64 {
        *self.0.lock().expect("counter mutex poisoned")
    }
}

/// Wraps an `AsyncRead`, adding every byte successfully read to `counter`.
pub struct CountingReader<R> {
    inner: R,
    counter: Counter,
}

impl<R> CountingReader<R> {
    pub fn new(inner: R, counter: Counter) -> CountingReader<R> {
        CountingReader { inner, counter }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CountingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let read = buf.filled().len() - before;
            if read > 0 {
                self.counter.add(read as u64);
            }
        }
        poll
    }
}

/// Wraps an `AsyncWrite`, adding every byte successfully written to
/// `counter`.
pub struct CountingWriter<W> {
    inner: W,
    counter: Counter,
}

impl<W> CountingWriter<W> {
    pub fn new(inner: W, counter: Counter) -> CountingWriter<W> {
        CountingWriter { inner, counter }
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for CountingWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(written)) = &poll {
            self.counter.add(*written as u64);
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// One tick of progress: the cumulative total observed so far, and the
/// delta since the previous tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Progress {
    pub total: u64,
    pub delta: u64,
}

/// Samples a `Counter` on a fixed interval and forwards `Progress` events
/// to `sink` until `cancel` fires, at which point it emits one final
/// sample and closes the sink by dropping its end.
pub struct Ticker {
    counter: Counter,
    interval: Duration,
    cancel: CancellationToken,
}

impl Ticker {
    pub fn new(counter: Counter, interval: Duration, cancel: CancellationToken) -> Ticker {
        Ticker {
            counter,
            interval,
            cancel,
        }
    }

    /// Run the ticker to completion, sending every sample on `sink`. A
    /// closed receiver ends the loop early, same as cancellation.
    pub async fn run(self, sink: mpsc::Sender<Progress>) {
        let mut last = 0u64;
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    let total = self.counter.total();
                    let delta = total.saturating_sub(last);
                    last = total;
                    if sink.send(Progress { total, delta }).await.is_err() {
                        return;
                    }
                }
            }
        }
        let total = self.counter.total();
        let delta = total.saturating_sub(last);
        let _ = sink.send(Progress { total, delta }).await;
    }
}
