//! One-shot payload exchange over an established TLS stream.
//!
//! A payload ends where its sender closes the write half with a TLS
//! `close_notify`. The whole read, from the first byte to EOF, is bounded
//! by the read timeout and the whole write by the write timeout.

use std::{io, time::Duration};

use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::{timeout, timeout_at, Instant},
};

const CHUNK_SIZE: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("payload not received within {0:?}")]
    ReadTimeout(Duration),

    #[error("write did not complete within {0:?}")]
    WriteTimeout(Duration),

    #[error("payload exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("read failed after {received} bytes: {source}")]
    Read {
        received: usize,
        #[source]
        source:   io::Error,
    },

    #[error("write failed: {0}")]
    Write(#[source] io::Error),
}

/// Reads until the peer closes its write half, or fails. A peer that
/// trickles bytes cannot stretch the read past `read_timeout`.
pub async fn read_payload<S>(
    stream: &mut S,
    limit: usize,
    read_timeout: Duration,
) -> Result<Vec<u8>, StreamError>
where
    S: AsyncRead + Unpin,
{
    let mut payload = Vec::new();
    let mut chunk = vec![0u8; CHUNK_SIZE];
    let deadline = Instant::now() + read_timeout;

    loop {
        let n = match timeout_at(deadline, stream.read(&mut chunk)).await {
            Err(_) => return Err(StreamError::ReadTimeout(read_timeout)),
            Ok(Err(source)) => {
                return Err(StreamError::Read {
                    received: payload.len(),
                    source,
                })
            }
            Ok(Ok(n)) => n,
        };

        if n == 0 {
            return Ok(payload);
        }
        if payload.len() + n > limit {
            return Err(StreamError::TooLarge { limit });
        }
        payload.extend_from_slice(&chunk[..n]);
    }
}

/// Writes `payload`, then closes the write half.
pub async fn write_payload<S>(
    stream: &mut S,
    payload: &[u8],
    write_timeout: Duration,
) -> Result<(), StreamError>
where
    S: AsyncWrite + Unpin,
{
    let write = async {
        stream.write_all(payload).await?;
        stream.flush().await?;
        stream.shutdown().await
    };

    match timeout(write_timeout, write).await {
        Err(_) => Err(StreamError::WriteTimeout(write_timeout)),
        Ok(Err(source)) => Err(StreamError::Write(source)),
        Ok(Ok(())) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(100);

    #[tokio::test]
    async fn reads_until_peer_closes() {
        let (mut near, mut far) = tokio::io::duplex(64);
        tokio::spawn(async move {
            write_payload(&mut far, b"hello, keyward", SHORT).await.unwrap();
        });

        let payload = read_payload(&mut near, 1024, SHORT).await.unwrap();
        assert_eq!(payload, b"hello, keyward");
    }

    #[tokio::test]
    async fn oversized_payload_is_refused() {
        let (mut near, mut far) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let _ = write_payload(&mut far, &[7u8; 200], SHORT).await;
        });

        let err = read_payload(&mut near, 100, SHORT).await.unwrap_err();
        assert!(matches!(err, StreamError::TooLarge { limit: 100 }), "{err:?}");
    }

    #[tokio::test]
    async fn silent_peer_times_out_the_read() {
        let (mut near, _far) = tokio::io::duplex(64);
        let err = read_payload(&mut near, 1024, SHORT).await.unwrap_err();
        assert!(matches!(err, StreamError::ReadTimeout(_)), "{err:?}");
    }

    #[tokio::test]
    async fn trickling_peer_cannot_extend_the_read() {
        let (mut near, mut far) = tokio::io::duplex(64);
        tokio::spawn(async move {
            for _ in 0..20 {
                tokio::time::sleep(Duration::from_millis(30)).await;
                if far.write_all(b"x").await.is_err() {
                    return;
                }
            }
            let _ = far.shutdown().await;
        });

        let started = std::time::Instant::now();
        let err = read_payload(&mut near, 1024, SHORT).await.unwrap_err();
        assert!(matches!(err, StreamError::ReadTimeout(_)), "{err:?}");
        assert!(started.elapsed() < Duration::from_millis(400), "{:?}", started.elapsed());
    }

    #[tokio::test]
    async fn stalled_peer_times_out_the_write() {
        let (mut near, _far) = tokio::io::duplex(16);
        let err = write_payload(&mut near, &[0u8; 4096], SHORT).await.unwrap_err();
        assert!(matches!(err, StreamError::WriteTimeout(_)), "{err:?}");
    }
}
