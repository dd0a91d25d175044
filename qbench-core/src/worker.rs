//! # Stream workers
//!
//! One worker owns one stream for its whole life. Workers never share
//! anything but [`Stats`], and a worker's failure never reaches past its own
//! stream. The error is logged and counted, then handed back to whoever joins
//! the task.
//!
//! Workers are generic over tokio's `AsyncRead`/`AsyncWrite` so the quinn
//! stream halves plug in directly.
use std::{io, sync::Arc};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace, warn};

use crate::{
    error::{Error, Result},
    metrics::{ACTIVE_STREAMS, GaugeGuard, STREAMS},
    stats::Stats,
};

/// smallest receive buffer used by the echo workload, bigger messages get a
/// buffer of their own length
pub const PING_RECV_BUF: usize = 8 * 1024;
/// byte the echo workload fills its message with
pub const PING_FILL: u8 = b'a';

/// What a worker does with its stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    /// server side: read whatever arrives and write it back
    Echo {
        /// max bytes per read
        read_buf: usize,
    },
    /// client side: send `body` bytes, wait for all `body` bytes to return
    Bench {
        /// payload length
        body: usize,
    },
    /// client side: send `msg` bytes, take whatever one read returns
    Ping {
        /// message length
        msg: usize,
    },
}

/// Owns one stream's two halves
#[derive(Debug)]
pub struct StreamWorker<R, W> {
    id: u64,
    recv: R,
    send: W,
    stats: Arc<Stats>,
}

impl<R, W> StreamWorker<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// new worker for stream `id`
    pub fn new(id: u64, recv: R, send: W, stats: Arc<Stats>) -> Self {
        Self {
            id,
            recv,
            send,
            stats,
        }
    }

    /// Drive `job` until the stream fails or the peer finishes it.
    ///
    /// Returns `Ok` only for an orderly finish of an echo stream; every other
    /// ending is the error that ended it.
    pub async fn run(self, job: Job) -> Result<()> {
        let StreamWorker {
            id,
            mut recv,
            mut send,
            stats,
        } = self;
        STREAMS.inc();
        let _active = GaugeGuard::new(&ACTIVE_STREAMS);
        trace!(stream = id, ?job, "stream worker started");

        let res = match job {
            Job::Echo { read_buf } => echo(&mut recv, &mut send, read_buf, &stats).await,
            Job::Bench { body } => bench(&mut recv, &mut send, body, &stats).await,
            Job::Ping { msg } => ping(&mut recv, &mut send, msg, &stats).await,
        };

        match &res {
            Ok(()) => debug!(stream = id, "stream finished"),
            Err(err) => {
                err.count();
                if err.is_clean_close() {
                    debug!(stream = id, %err, "stream closed");
                } else {
                    warn!(stream = id, %err, "stream failed");
                }
            }
        }
        res
    }
}

/// Write all of `buf`, issuing as many writes as the transport needs.
///
/// Any write error ends the loop; partial progress is not retried beyond
/// continuing from where the last write stopped.
pub async fn write_full<W>(send: &mut W, buf: &[u8]) -> io::Result<usize>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut sent = 0;
    while sent < buf.len() {
        match send.write(&buf[sent..]).await? {
            0 => return Err(io::ErrorKind::WriteZero.into()),
            n => sent += n,
        }
    }
    Ok(sent)
}

/// read, record, write back, repeat
pub async fn echo<R, W>(recv: &mut R, send: &mut W, read_buf: usize, stats: &Stats) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0; read_buf];
    loop {
        let n = recv.read(&mut buf).await.map_err(Error::Read)?;
        if n == 0 {
            // peer is done sending, finish our side too
            send.shutdown().await.map_err(Error::Write)?;
            return Ok(());
        }
        stats.add(n as u64, 1);
        write_full(send, &buf[..n]).await.map_err(Error::Write)?;
    }
}

/// fixed payload out, exactly as many bytes back, repeat
pub async fn bench<R, W>(recv: &mut R, send: &mut W, body: usize, stats: &Stats) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let payload = vec![0; body];
    let mut buf = vec![0; body];
    loop {
        write_full(send, &payload).await.map_err(Error::Write)?;
        recv.read_exact(&mut buf).await.map_err(Error::Read)?;
        stats.add(body as u64, 1);
    }
}

/// message out, one read back, record both, repeat.
///
/// The receive buffer holds at least a whole message so reads keep pace with
/// writes. A smaller buffer lets unread echo pile up until flow control stalls
/// both ends.
pub async fn ping<R, W>(recv: &mut R, send: &mut W, msg: usize, stats: &Stats) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let message = vec![PING_FILL; msg];
    let mut buf = vec![0; msg.max(PING_RECV_BUF)];
    loop {
        let written = write_full(send, &message).await.map_err(Error::Write)?;
        // best-effort: whatever one read gives us, the rest of the echo
        // shows up in later reads
        let read = recv.read(&mut buf).await.map_err(Error::Read)?;
        if read == 0 {
            return Err(Error::Finished);
        }
        stats.add((written + read) as u64, 1);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        pin::Pin,
        task::{Context, Poll},
    };

    use rand::{Rng, RngCore};
    use tokio::io::{AsyncReadExt, duplex, split};
    use tokio_test::io::Builder;

    use super::*;
    use crate::stats::Snapshot;

    /// accepts at most `max` bytes per write call
    struct Trickle<W> {
        inner: W,
        max: usize,
    }

    impl<W: AsyncWrite + Unpin> AsyncWrite for Trickle<W> {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let len = buf.len().min(self.max);
            Pin::new(&mut self.inner).poll_write(cx, &buf[..len])
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    #[tokio::test]
    async fn write_full_accumulates_partial_writes() {
        let mut send = Trickle {
            inner: Builder::new().write(b"hello world").build(),
            max: 3,
        };
        let n = write_full(&mut send, b"hello world").await.unwrap();
        assert_eq!(n, 11);
    }

    #[tokio::test]
    async fn write_full_stops_on_error() {
        let mut mock = Builder::new()
            .write(b"abc")
            .write_error(io::Error::from(io::ErrorKind::BrokenPipe))
            .build();
        let err = write_full(&mut mock, b"abcdef").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn write_full_preserves_bytes_under_fragmentation() {
        let mut rng = rand::thread_rng();
        for _ in 0..16 {
            let len = rng.gen_range(1..200_000);
            let mut payload = vec![0; len];
            rng.fill_bytes(&mut payload);
            let max = rng.gen_range(1..4096);
            let (client, mut server) = duplex(rng.gen_range(1..8192));

            let expected = payload.clone();
            let reader = tokio::spawn(async move {
                let mut got = Vec::new();
                server.read_to_end(&mut got).await.unwrap();
                got
            });

            let mut send = Trickle { inner: client, max };
            assert_eq!(write_full(&mut send, &payload).await.unwrap(), len);
            send.shutdown().await.unwrap();
            drop(send);

            assert_eq!(reader.await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn echo_writes_back_what_it_reads() {
        let mock = Builder::new()
            .read(b"ping")
            .write(b"pi")
            .write(b"ng")
            .read(b"again")
            .write(b"again")
            .build();
        let (mut recv, mut send) = split(mock);
        let stats = Stats::new();

        echo(&mut recv, &mut send, 64, &stats).await.unwrap();
        assert_eq!(
            stats.snapshot(),
            Snapshot {
                bytes: 9,
                messages: 2
            }
        );
    }

    #[tokio::test]
    async fn echo_read_error_ends_the_stream() {
        let mock = Builder::new()
            .read(b"one")
            .write(b"one")
            .read_error(io::Error::from(io::ErrorKind::ConnectionReset))
            .build();
        let (mut recv, mut send) = split(mock);
        let stats = Stats::new();

        let err = echo(&mut recv, &mut send, 64, &stats).await.unwrap_err();
        assert!(matches!(err, Error::Read(_)));
        assert_eq!(stats.snapshot().bytes, 3);
    }

    #[tokio::test]
    async fn echo_write_error_ends_the_stream() {
        let mock = Builder::new()
            .read(b"data")
            .write_error(io::Error::from(io::ErrorKind::BrokenPipe))
            .build();
        let (mut recv, mut send) = split(mock);
        let stats = Stats::new();

        let err = echo(&mut recv, &mut send, 64, &stats).await.unwrap_err();
        assert!(matches!(err, Error::Write(_)));
        // the read was recorded before the write failed
        assert_eq!(stats.snapshot().messages, 1);
    }

    #[tokio::test]
    async fn bench_round_trips_until_the_peer_goes_away() {
        let (client, server) = duplex(1024);
        let stats = Arc::new(Stats::new());

        // echo half a dozen payloads in small pieces, then hang up
        let peer = tokio::spawn(async move {
            let (mut recv, mut send) = split(server);
            let mut buf = [0u8; 100];
            let mut echoed = 0;
            while echoed < 6 * 512 {
                let n = recv.read(&mut buf).await.unwrap();
                write_full(&mut send, &buf[..n]).await.unwrap();
                echoed += n;
            }
        });

        let (recv, send) = split(client);
        let err = StreamWorker::new(0, recv, send, Arc::clone(&stats))
            .run(Job::Bench { body: 512 })
            .await
            .unwrap_err();
        peer.await.unwrap();

        // peer left after exactly six echoes, the seventh round trip fails on
        // either the write or the read depending on when the peer drops
        assert!(matches!(err, Error::Read(_) | Error::Write(_)), "{err:?}");
        assert_eq!(
            stats.snapshot(),
            Snapshot {
                bytes: 6 * 512,
                messages: 6
            }
        );
    }

    #[tokio::test]
    async fn ping_records_written_plus_read() {
        let mock = Builder::new()
            .write(&[PING_FILL; 4])
            .read(&[PING_FILL; 3])
            .write(&[PING_FILL; 4])
            .read(&[PING_FILL; 5])
            .write(&[PING_FILL; 4])
            .build();
        let (mut recv, mut send) = split(mock);
        let stats = Stats::new();

        // mock runs out of reads, which is eof
        let err = ping(&mut recv, &mut send, 4, &stats).await.unwrap_err();
        assert!(matches!(err, Error::Finished));
        assert_eq!(
            stats.snapshot(),
            Snapshot {
                bytes: (4 + 3) + (4 + 5),
                messages: 2
            }
        );
    }

    #[tokio::test]
    async fn ping_drains_a_whole_large_message_per_read() {
        let msg = 4 * PING_RECV_BUF;
        let mock = Builder::new()
            .write(&vec![PING_FILL; msg])
            .read(&vec![PING_FILL; msg])
            .write(&vec![PING_FILL; msg])
            .read(&vec![PING_FILL; msg])
            .write(&vec![PING_FILL; msg])
            .build();
        let (mut recv, mut send) = split(mock);
        let stats = Stats::new();

        // any echo left unread would stay queued in the mock and fail the test
        let err = ping(&mut recv, &mut send, msg, &stats).await.unwrap_err();
        assert!(matches!(err, Error::Finished));
        assert_eq!(
            stats.snapshot(),
            Snapshot {
                bytes: 4 * msg as u64,
                messages: 2
            }
        );
    }

    #[tokio::test]
    async fn ping_running_total_never_decreases() {
        let (client, server) = duplex(64 * 1024);
        let stats = Arc::new(Stats::new());
        let (srecv, ssend) = split(server);
        let echo_task = tokio::spawn(
            StreamWorker::new(1, srecv, ssend, Arc::new(Stats::new())).run(Job::Echo {
                read_buf: 64 * 1024,
            }),
        );

        let (recv, send) = split(client);
        let pinger = tokio::spawn(
            StreamWorker::new(1, recv, send, Arc::clone(&stats)).run(Job::Ping { msg: 1024 }),
        );

        let mut last = 0;
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while last < 64 * 1024 {
                tokio::task::yield_now().await;
                let now = stats.snapshot().bytes;
                assert!(now >= last);
                last = now;
            }
        })
        .await
        .expect("ping workload made progress");
        pinger.abort();
        echo_task.abort();
    }
}
