//! Bidirectional byte pump binding a client stream to an upstream stream.
//!
//! Ported from the reference `forward_stream`/`relay_stream` pair: two
//! copy directions share a single set-once stop flag and re-check it on
//! every bounded-read timeout, so an idle direction still notices its
//! peer's EOF within one timeout window.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::trace;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// Size of each read chunk. The reference value is small (1 KiB);
/// implementers may choose anywhere up to 64 KiB.
const CHUNK_SIZE: usize = 1024;

/// Bounded-read timeout: on expiry we only recheck the stop flag.
const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Copies `reader -> writer` until EOF, a read/write error, or `stop` is
/// observed set. Always sets `stop` before returning so the peer
/// direction unblocks on its next timeout tick.
async fn forward_stream<R, W>(mut reader: R, mut writer: W, stop: Arc<AtomicBool>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; CHUNK_SIZE];
    while !stop.load(Ordering::Relaxed) {
        let n = match timeout(READ_TIMEOUT, reader.read(&mut buf)).await {
            Ok(Ok(0)) => {
                trace!("relay: read 0 bytes, direction closed");
                break;
            }
            Ok(Ok(n)) => n,
            Ok(Err(_)) => break,
            Err(_) => continue, // read timed out, recheck stop flag
        };

        if writer.write_all(&buf[..n]).await.is_err() {
            break;
        }
        if writer.flush().await.is_err() {
            break;
        }
    }
    stop.store(true, Ordering::Relaxed);
}

/// Relays bytes between `local` and `remote` concurrently until either
/// direction reaches EOF or an I/O error, then shuts both streams down.
///
/// `local` and `remote` are split into independent read/write halves so
/// both directions can run concurrently on a single stream.
pub async fn relay_stream<A, B>(mut local: A, mut remote: B)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let stop = Arc::new(AtomicBool::new(false));

    let (local_rx, local_tx) = tokio::io::split(&mut local);
    let (remote_rx, remote_tx) = tokio::io::split(&mut remote);

    let to_remote = forward_stream(local_rx, remote_tx, stop.clone());
    let to_local = forward_stream(remote_rx, local_tx, stop);

    tokio::join!(to_remote, to_local);

    let _ = local.shutdown().await;
    let _ = remote.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn relays_bytes_in_order() {
        let (mut client_a, client_b) = duplex(64);
        let (remote_a, mut remote_b) = duplex(64);

        let relay = tokio::spawn(async move {
            relay_stream(client_b, remote_a).await;
        });

        client_a.write_all(b"hello upstream").await.unwrap();
        let mut buf = [0u8; 14];
        remote_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello upstream");

        remote_b.write_all(b"hello client!!").await.unwrap();
        let mut buf2 = [0u8; 14];
        client_a.read_exact(&mut buf2).await.unwrap();
        assert_eq!(&buf2, b"hello client!!");

        drop(client_a);
        drop(remote_b);
        relay.await.unwrap();
    }

    #[tokio::test]
    async fn eof_on_one_side_terminates_relay() {
        let (client_a, client_b) = duplex(64);
        let (remote_a, remote_b) = duplex(64);

        let relay = tokio::spawn(async move {
            relay_stream(client_b, remote_a).await;
        });

        // Closing the client's side should cause the relay to complete
        // promptly instead of hanging, once the remote side also closes.
        drop(client_a);
        drop(remote_b);

        tokio::time::timeout(Duration::from_secs(3), relay)
            .await
            .expect("relay should terminate on EOF")
            .unwrap();
    }
}
