//! Thread-blocking stream wrappers.
//!
//! [`Throttled`] decorates any `std::io` byte stream with a pair of
//! capacity sources, one per direction, and waits out admission by
//! blocking the calling thread. The admission shape depends on what is
//! known about an operation's size up front:
//!
//! - writes know their size: the full length is reserved before the
//!   transfer and the amount actually written is recorded after;
//! - reads know only an upper bound: between one byte and the buffer
//!   length is reserved and only the granted prefix is attempted;
//! - buffered refills ([`BufRead::fill_buf`]) have no bound at all: the
//!   bucket is drained fully before the refill and consumption is
//!   recorded as the caller takes bytes out.
//!
//! Recording the actual amount rather than the requested one is what keeps
//! observed throughput at the configured rate across short transfers.

use std::fs::File;
use std::io::{self, BufRead, Read, Seek, SeekFrom, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

use trickle_throttle::{Clock, RealClock, Throttle};

use crate::config::{Config, ConversionError};

/// A byte stream paced by one throttle per direction.
///
/// A single wrapper instance is meant for single-owner use; the capacity
/// sources are not internally synchronized.
#[derive(Debug)]
pub struct Throttled<T, C = RealClock> {
    inner: T,
    read: Throttle<C>,
    write: Throttle<C>,
}

impl<T> Throttled<T> {
    /// Wrap `inner`, pacing each direction as `config` dictates.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured rates do not fit the throttle
    /// core's range.
    pub fn new(inner: T, config: &Config) -> Result<Self, ConversionError> {
        Ok(Self {
            inner,
            read: config.read_throttle()?,
            write: config.write_throttle()?,
        })
    }

    /// Wrap `inner`, pacing only reads.
    pub fn reader(inner: T, read: Throttle) -> Self {
        Self::from_parts(inner, read, Throttle::unlimited())
    }

    /// Wrap `inner`, pacing only writes.
    pub fn writer(inner: T, write: Throttle) -> Self {
        Self::from_parts(inner, Throttle::unlimited(), write)
    }
}

impl<T, C> Throttled<T, C> {
    /// Wrap `inner` with explicit per-direction throttles. The two must be
    /// independent instances; sharing one would leak each direction's
    /// bookkeeping into the other.
    pub fn from_parts(inner: T, read: Throttle<C>, write: Throttle<C>) -> Self {
        Self { inner, read, write }
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
}

impl<T, C> Throttled<T, C>
where
    C: Clock,
{
    /// Bytes ever received through this wrapper.
    pub fn total_read(&self) -> u64 {
        self.read.total()
    }

    /// Bytes ever sent through this wrapper.
    pub fn total_written(&self) -> u64 {
        self.write.total()
    }
}

fn admission_error(err: trickle_throttle::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, err)
}

impl<T, C> Read for Throttled<T, C>
where
    T: Read,
    C: Clock,
{
    #[allow(clippy::cast_possible_truncation)]
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return self.inner.read(buf);
        }
        let granted = self
            .read
            .blocking_reserve(1, buf.len() as u64)
            .map_err(admission_error)?;
        let upto = granted.min(buf.len() as u64) as usize;
        let n = self.inner.read(&mut buf[..upto])?;
        self.read.record(n as u64);
        Ok(n)
    }
}

impl<T, C> Write for Throttled<T, C>
where
    T: Write,
    C: Clock,
{
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return self.inner.write(buf);
        }
        let len = buf.len() as u64;
        self.write
            .blocking_reserve(len, len)
            .map_err(admission_error)?;
        let n = self.inner.write(buf)?;
        self.write.record(n as u64);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<T, C> BufRead for Throttled<T, C>
where
    T: BufRead,
    C: Clock,
{
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        // The refill's size is unknown until it happens; clear the bucket
        // so any amount is admissible, then true up in `consume`.
        self.read.blocking_drain();
        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.read.record(amt as u64);
        self.inner.consume(amt);
    }
}

impl<T, C> Seek for Throttled<T, C>
where
    T: Seek,
{
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

impl<C> Throttled<TcpStream, C> {
    /// See [`TcpStream::peer_addr`].
    ///
    /// # Errors
    ///
    /// Propagates the underlying socket error.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    /// See [`TcpStream::local_addr`].
    ///
    /// # Errors
    ///
    /// Propagates the underlying socket error.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// See [`TcpStream::set_read_timeout`]. Stream timeouts are not
    /// coordinated with admission waits; a short timeout may fire while
    /// the throttle is still paying down a burst.
    ///
    /// # Errors
    ///
    /// Propagates the underlying socket error.
    pub fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        self.inner.set_read_timeout(dur)
    }

    /// See [`TcpStream::set_write_timeout`].
    ///
    /// # Errors
    ///
    /// Propagates the underlying socket error.
    pub fn set_write_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        self.inner.set_write_timeout(dur)
    }

    /// See [`TcpStream::set_nodelay`].
    ///
    /// # Errors
    ///
    /// Propagates the underlying socket error.
    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.inner.set_nodelay(nodelay)
    }

    /// See [`TcpStream::shutdown`].
    ///
    /// # Errors
    ///
    /// Propagates the underlying socket error.
    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        self.inner.shutdown(how)
    }
}

impl<C> Throttled<File, C> {
    /// See [`File::sync_all`].
    ///
    /// # Errors
    ///
    /// Propagates the underlying file error.
    pub fn sync_all(&self) -> io::Result<()> {
        self.inner.sync_all()
    }

    /// See [`File::metadata`].
    ///
    /// # Errors
    ///
    /// Propagates the underlying file error.
    pub fn metadata(&self) -> io::Result<std::fs::Metadata> {
        self.inner.metadata()
    }
}
