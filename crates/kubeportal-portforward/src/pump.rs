use std::sync::atomic::{
    AtomicU64,
    Ordering,
};
use std::sync::Arc;

use tokio::io::{
    AsyncRead,
    AsyncReadExt,
    AsyncWrite,
    AsyncWriteExt,
};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ForwardError;

pub const BUFFER_SIZE: usize = 65536;

/// Bridges one accepted client socket and one upstream stream.
///
/// Two copiers run concurrently; the connection completes as soon as
/// either direction hits EOF or an error. Every relayed chunk is added
/// to `bytes_transferred` so throughput is observable while the
/// connection is still open. Cancellation breaks both copiers out of
/// blocked reads; the streams are closed on return.
pub async fn pump<U>(
    client: TcpStream, upstream: U, bytes_transferred: Arc<AtomicU64>, cancel: CancellationToken,
) -> Result<(), ForwardError>
where
    U: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut client_reader, mut client_writer) = client.into_split();
    let (mut upstream_reader, mut upstream_writer) = tokio::io::split(upstream);

    let client_to_upstream = copy_half(
        &mut client_reader,
        &mut upstream_writer,
        bytes_transferred.clone(),
        cancel.clone(),
    );
    let upstream_to_client = copy_half(
        &mut upstream_reader,
        &mut client_writer,
        bytes_transferred,
        cancel,
    );

    tokio::select! {
        result = client_to_upstream => result,
        result = upstream_to_client => result,
    }
}

async fn copy_half<R, W>(
    reader: &mut R, writer: &mut W, bytes_transferred: Arc<AtomicU64>, cancel: CancellationToken,
) -> Result<(), ForwardError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("stream copier cancelled");
                break;
            }
            read = reader.read(&mut buffer) => match read {
                Ok(0) => break,
                Ok(n) => {
                    writer.write_all(&buffer[..n]).await?;
                    bytes_transferred.fetch_add(n as u64, Ordering::Relaxed);
                }
                Err(e) => return Err(ForwardError::Io(e)),
            }
        }
    }

    let _ = writer.shutdown().await;
    Ok(())
}
