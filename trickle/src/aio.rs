//! Cooperative stream wrappers for tokio I/O.
//!
//! [`Throttled`] implements the tokio I/O traits over any wrapped stream,
//! pacing transfers with one capacity source per direction. Where the
//! blocking wrappers park the thread, these suspend only the calling task:
//! a computed wait becomes a timer the poll functions drive, so other
//! tasks on the scheduler keep running.
//!
//! The admission shapes match the blocking side. Reads reserve up to the
//! buffer length and attempt only the granted prefix; writes reserve their
//! full length; buffered refills and vectored writes, whose size is not
//! known up front, drain the bucket first and true up afterwards. In every
//! case the amount recorded is the amount that actually moved.
//!
//! Cancelling a task that is suspended on admission abandons the
//! reservation: nothing was recorded, and the next operation starts its
//! own admission from fresh state.

use std::future::Future;
use std::io::{self, IoSlice, SeekFrom};
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use pin_project::pin_project;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncSeek, AsyncWrite, ReadBuf};
use tokio::time::{self, Duration, Instant, Sleep};

use trickle_throttle::{Admission, Throttle};

use crate::config::{Config, ConversionError};

fn admission_error(err: trickle_throttle::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, err)
}

/// What a gate's timer, when armed, is waiting for.
#[derive(Debug, Clone, Copy)]
enum WaitState {
    Idle,
    /// An admission wait; the grant is honored on wake without re-check.
    Admit { granted: u64 },
    /// A full drain ahead of an operation of unknown size.
    Drain,
}

/// One direction's admission state: the throttle plus a lazily created
/// timer that turns computed waits into task suspension.
#[derive(Debug)]
struct Gate {
    throttle: Throttle,
    sleep: Option<Pin<Box<Sleep>>>,
    state: WaitState,
}

impl Gate {
    fn new(throttle: Throttle) -> Self {
        Self {
            throttle,
            sleep: None,
            state: WaitState::Idle,
        }
    }

    /// Arm the timer `ticks` from now. The timer is created on first use
    /// so that wrapper construction needs no runtime context.
    fn arm(&mut self, ticks: u64) {
        let deadline = Instant::now() + Duration::from_micros(ticks);
        match self.sleep.as_mut() {
            Some(sleep) => sleep.as_mut().reset(deadline),
            None => self.sleep = Some(Box::pin(time::sleep_until(deadline))),
        }
    }

    fn poll_timer(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        match self.sleep.as_mut() {
            Some(sleep) => sleep.as_mut().poll(cx),
            None => Poll::Ready(()),
        }
    }

    /// Drive an admission request for `min..=max` units to completion,
    /// suspending this task while capacity accrues.
    fn poll_admit(&mut self, cx: &mut Context<'_>, min: u64, max: u64) -> Poll<io::Result<u64>> {
        if let WaitState::Admit { granted } = self.state {
            ready!(self.poll_timer(cx));
            self.state = WaitState::Idle;
            return Poll::Ready(Ok(granted));
        }
        // A drain left over from a cancelled operation is abandoned here;
        // it never committed anything.
        self.state = WaitState::Idle;

        match self.throttle.admit(min, max).map_err(admission_error)? {
            Admission::Ready(granted) => Poll::Ready(Ok(granted)),
            Admission::Wait { ticks, granted } => {
                self.arm(ticks);
                self.state = WaitState::Admit { granted };
                ready!(self.poll_timer(cx));
                self.state = WaitState::Idle;
                Poll::Ready(Ok(granted))
            }
        }
    }

    /// Drive a full drain to completion, the admission step for transfers
    /// whose size is unknown until they finish.
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if matches!(self.state, WaitState::Drain) {
            ready!(self.poll_timer(cx));
            self.state = WaitState::Idle;
            return Poll::Ready(());
        }
        self.state = WaitState::Idle;

        let ticks = self.throttle.drain_ticks();
        if ticks == 0 {
            return Poll::Ready(());
        }
        self.arm(ticks);
        self.state = WaitState::Drain;
        ready!(self.poll_timer(cx));
        self.state = WaitState::Idle;
        Poll::Ready(())
    }
}

/// A tokio byte stream paced by one throttle per direction.
///
/// Implements [`AsyncRead`], [`AsyncWrite`], [`AsyncBufRead`] and
/// [`AsyncSeek`] whenever the wrapped stream does, so it composes with
/// `tokio::io::copy` and the `AsyncReadExt`/`AsyncWriteExt` adapters
/// unchanged.
#[pin_project]
#[derive(Debug)]
pub struct Throttled<T> {
    #[pin]
    inner: T,
    read: Gate,
    write: Gate,
}

impl<T> Throttled<T> {
    /// Wrap `inner`, pacing each direction as `config` dictates.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured rates do not fit the throttle
    /// core's range.
    pub fn new(inner: T, config: &Config) -> Result<Self, ConversionError> {
        Ok(Self::from_parts(
            inner,
            config.read_throttle()?,
            config.write_throttle()?,
        ))
    }

    /// Wrap `inner` with explicit per-direction throttles. The two must be
    /// independent instances; sharing one would leak each direction's
    /// bookkeeping into the other.
    pub fn from_parts(inner: T, read: Throttle, write: Throttle) -> Self {
        Self {
            inner,
            read: Gate::new(read),
            write: Gate::new(write),
        }
    }

    /// Wrap `inner`, pacing only reads.
    pub fn reader(inner: T, read: Throttle) -> Self {
        Self::from_parts(inner, read, Throttle::unlimited())
    }

    /// Wrap `inner`, pacing only writes.
    pub fn writer(inner: T, write: Throttle) -> Self {
        Self::from_parts(inner, Throttle::unlimited(), write)
    }

    /// A reference to the wrapped stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// A mutable reference to the wrapped stream. Transfers made directly
    /// on it bypass the throttles.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Unwrap, discarding the throttle state.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Bytes ever received through this wrapper.
    pub fn total_read(&self) -> u64 {
        self.read.throttle.total()
    }

    /// Bytes ever sent through this wrapper.
    pub fn total_written(&self) -> u64 {
        self.write.throttle.total()
    }
}

impl<T: AsyncRead> AsyncRead for Throttled<T> {
    #[allow(clippy::cast_possible_truncation)]
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        if buf.remaining() == 0 {
            return this.inner.poll_read(cx, buf);
        }

        let granted = ready!(this.read.poll_admit(cx, 1, buf.remaining() as u64))?;
        // The caller may present a different buffer on a later poll; cap
        // the grant to what is in front of us now.
        let granted = granted.min(buf.remaining() as u64) as usize;

        let mut limited = buf.take(granted);
        ready!(this.inner.poll_read(cx, &mut limited))?;
        let n = limited.filled().len();

        // SAFETY: the inner read initialized `n` bytes of the region that
        // `limited` borrowed from `buf`.
        unsafe { buf.assume_init(n) };
        buf.advance(n);
        this.read.throttle.record(n as u64);
        Poll::Ready(Ok(()))
    }
}

impl<T: AsyncWrite> AsyncWrite for Throttled<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        if buf.is_empty() {
            return this.inner.poll_write(cx, buf);
        }

        let len = buf.len() as u64;
        ready!(this.write.poll_admit(cx, len, len))?;
        let n = ready!(this.inner.poll_write(cx, buf))?;
        this.write.throttle.record(n as u64);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        // A gathered write's accepted size is unknown until the inner call
        // returns; clear the bucket first, record the truth after.
        ready!(this.write.poll_drain(cx));
        let n = ready!(this.inner.poll_write_vectored(cx, bufs))?;
        this.write.throttle.record(n as u64);
        Poll::Ready(Ok(n))
    }
}

impl<T: AsyncBufRead> AsyncBufRead for Throttled<T> {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        let this = self.project();
        // The refill's size is unknown until it happens; clear the bucket
        // so any amount is admissible, then true up in `consume`.
        ready!(this.read.poll_drain(cx));
        this.inner.poll_fill_buf(cx)
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        let this = self.project();
        this.read.throttle.record(amt as u64);
        this.inner.consume(amt);
    }
}

impl<T: AsyncSeek> AsyncSeek for Throttled<T> {
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        self.project().inner.start_seek(position)
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        self.project().inner.poll_complete(cx)
    }
}
