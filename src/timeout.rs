//! Reading with an overall deadline.

use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Instant;

/// An asynchronous source that hands out up to `max` bytes per call.
///
/// An empty result means nothing was available; it is not an error.
#[async_trait(?Send)]
pub trait ReadSome {
    async fn read_some(&mut self, max: usize) -> io::Result<Vec<u8>>;
}

#[async_trait(?Send)]
impl<R> ReadSome for R
where
    R: AsyncRead + Unpin,
{
    async fn read_some(&mut self, max: usize) -> io::Result<Vec<u8>> {
        let mut buffer = vec![0u8; max];
        let n = self.read(&mut buffer).await?;
        buffer.truncate(n);
        Ok(buffer)
    }
}

/// Collect up to `n` bytes from `reader`, one byte at a time, for at most
/// `timeout`.
///
/// Returns whatever arrived: possibly fewer than `n` bytes, possibly none.
/// Running out of time is not an error; I/O errors from the reader are.
pub async fn read_with_timeout<R>(reader: &mut R, n: usize, timeout: Duration) -> io::Result<Vec<u8>>
where
    R: ReadSome + ?Sized,
{
    let start = Instant::now();
    let mut data = Vec::with_capacity(n);

    while data.len() < n {
        let Some(remaining) = timeout.checked_sub(start.elapsed()).filter(|r| !r.is_zero()) else {
            break;
        };
        match tokio::time::timeout(remaining, reader.read_some(1)).await {
            Ok(chunk) => {
                let chunk = chunk?;
                if chunk.is_empty() {
                    tokio::task::yield_now().await;
                }
                data.extend_from_slice(&chunk);
            }
            Err(_) => break,
        }
    }

    Ok(data)
}
