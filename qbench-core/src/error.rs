//! # Errors
//!
//! Every failure in qbench is one of these variants, and every variant has
//! exactly one [`Scope`]. The scope decides how far the failure reaches:
//! a stream error only ends that stream, a session error closes one session,
//! a listener error is logged and forgotten, and a startup error ends the run.
use std::{io, net::SocketAddr, time::Duration};

use crate::metrics::ERRORS;

/// How far an error is allowed to propagate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// abort the role, the process exits non-zero
    Startup,
    /// logged, the listener keeps accepting
    Listener,
    /// the owning session is closed, other sessions are untouched
    Session,
    /// only the stream's worker exits
    Stream,
}

impl Scope {
    /// label used for the `qbench_errors` metric
    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Startup => "startup",
            Scope::Listener => "listener",
            Scope::Session => "session",
            Scope::Stream => "stream",
        }
    }
}

/// qbench errors
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// self-signed certificate could not be made
    #[error("credential generation failed: {0}")]
    Credential(#[from] credential::Error),
    /// TLS config rejected our parameters
    #[error("tls configuration error: {0}")]
    Tls(String),
    /// host:port did not resolve to anything usable
    #[error("failed to resolve {addr}: {reason}")]
    Resolve {
        /// address as given
        addr: String,
        /// resolver message
        reason: String,
    },
    /// endpoint could not bind its UDP socket
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// address we tried to bind
        addr: SocketAddr,
        /// underlying socket error
        #[source]
        source: io::Error,
    },
    /// connection attempt failed
    #[error("failed to dial {addr}: {reason}")]
    Dial {
        /// peer address
        addr: SocketAddr,
        /// why the handshake failed
        reason: String,
    },
    /// connection attempt didn't finish in time
    #[error("timed out dialing {addr} after {timeout:?}")]
    DialTimeout {
        /// peer address
        addr: SocketAddr,
        /// how long we waited
        timeout: Duration,
    },
    /// client could not open one of its streams
    #[error("failed to open stream {index}: {source}")]
    OpenStream {
        /// which of the P streams failed
        index: usize,
        /// session error
        #[source]
        source: quinn::ConnectionError,
    },
    /// an incoming connection failed its handshake
    #[error("incoming connection from {remote} failed: {source}")]
    Incoming {
        /// remote address of the attempt
        remote: SocketAddr,
        /// handshake error
        #[source]
        source: quinn::ConnectionError,
    },
    /// the session stopped handing out new streams
    #[error("session accept stream failed: {0}")]
    AcceptStream(#[source] quinn::ConnectionError),
    /// read failed on a stream
    #[error("stream read failed: {0}")]
    Read(#[source] io::Error),
    /// write failed on a stream
    #[error("stream write failed: {0}")]
    Write(#[source] io::Error),
    /// the peer finished its side of the stream
    #[error("stream finished by peer")]
    Finished,
}

impl Error {
    /// which scope this error ends
    pub fn scope(&self) -> Scope {
        match self {
            Error::Credential(_)
            | Error::Tls(_)
            | Error::Resolve { .. }
            | Error::Bind { .. }
            | Error::Dial { .. }
            | Error::DialTimeout { .. }
            | Error::OpenStream { .. } => Scope::Startup,
            Error::Incoming { .. } => Scope::Listener,
            Error::AcceptStream(_) => Scope::Session,
            Error::Read(_) | Error::Write(_) | Error::Finished => Scope::Stream,
        }
    }

    /// true when the peer (or our own shutdown) closed things in an orderly way
    pub fn is_clean_close(&self) -> bool {
        match self {
            Error::Finished => true,
            Error::AcceptStream(err) => is_closed(err),
            Error::Read(err) | Error::Write(err) => matches!(
                err.kind(),
                io::ErrorKind::NotConnected
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }

    /// bump the error counter for this error's scope
    pub fn count(&self) {
        ERRORS.with_label_values(&[self.scope().as_str()]).inc();
    }
}

fn is_closed(err: &quinn::ConnectionError) -> bool {
    matches!(
        err,
        quinn::ConnectionError::ApplicationClosed(_) | quinn::ConnectionError::LocallyClosed
    )
}

/// Result alias with [`Error`]
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_table() {
        let read = Error::Read(io::Error::from(io::ErrorKind::ConnectionReset));
        assert_eq!(read.scope(), Scope::Stream);
        assert_eq!(Error::Finished.scope(), Scope::Stream);
        assert_eq!(
            Error::AcceptStream(quinn::ConnectionError::TimedOut).scope(),
            Scope::Session
        );
        assert_eq!(
            Error::Incoming {
                remote: "127.0.0.1:1".parse().unwrap(),
                source: quinn::ConnectionError::TimedOut,
            }
            .scope(),
            Scope::Listener
        );
        assert_eq!(
            Error::DialTimeout {
                addr: "127.0.0.1:1".parse().unwrap(),
                timeout: Duration::from_secs(1),
            }
            .scope(),
            Scope::Startup
        );
    }

    #[test]
    fn clean_close() {
        assert!(Error::Finished.is_clean_close());
        assert!(Error::AcceptStream(quinn::ConnectionError::LocallyClosed).is_clean_close());
        assert!(!Error::AcceptStream(quinn::ConnectionError::TimedOut).is_clean_close());
        assert!(!Error::Write(io::Error::from(io::ErrorKind::WriteZero)).is_clean_close());
    }

    #[test]
    fn counted_by_scope() {
        let before = ERRORS.with_label_values(&["session"]).get();
        Error::AcceptStream(quinn::ConnectionError::TimedOut).count();
        assert!(ERRORS.with_label_values(&["session"]).get() > before);
    }
}
