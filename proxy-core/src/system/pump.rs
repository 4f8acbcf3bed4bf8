//! Byte pump (component B).
//!
//! Generalizes the teacher's TLS/WebSocket-aware `ProxyApp::duplex` loop
//! into a direction-tagged, payload-blind stream copy. A session runs two
//! of these concurrently, one per direction; the first to finish (EOF or
//! I/O error) drops its half of each stream, which in turn unblocks the
//! other pump's read with an error or EOF of its own — there is no
//! separate cancellation token threaded between the two directions (spec
//! §5), only the external registry `CancellationToken` raced alongside the
//! read.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use super::accounting::{TrafficAccountant, TrafficTag};

/// Read chunk size, per spec §4.B ("read up to 65,536 bytes").
const CHUNK: usize = 65_536;

/// Copies `reader -> writer` until EOF or error, recording every chunk
/// against `tag`. Returns `Ok(())` on a clean EOF, `Err` on any I/O error.
/// A notification on `cancel` ends the pump immediately, as if the peer had
/// closed the connection.
pub async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    tag: TrafficTag,
    accountant: &TrafficAccountant,
    cancel: &CancellationToken,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; CHUNK];
    loop {
        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            res = reader.read(&mut buf) => res?,
        };
        if n == 0 {
            return Ok(());
        }
        accountant.record(tag, n);
        writer.write_all(&buf[..n]).await?;
    }
}

/// Splices two already-connected TCP streams full-duplex, tagging each
/// direction independently (SOCKS5/HTTP: client->target is `Upload`,
/// target->client is `Download`; the TCP forwarder tags both `Upload`,
/// per spec §4.E / §9).
pub async fn relay_tcp(
    inbound: TcpStream,
    outbound: TcpStream,
    upload_tag: TrafficTag,
    download_tag: TrafficTag,
    accountant: Arc<TrafficAccountant>,
    cancel: CancellationToken,
) {
    let (ir, iw) = inbound.into_split();
    let (or, ow) = outbound.into_split();

    let up = pump(ir, ow, upload_tag, &accountant, &cancel);
    let down = pump(or, iw, download_tag, &accountant, &cancel);

    tokio::select! {
        _ = up => {}
        _ = down => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn pump_copies_bytes_and_records_them() {
        let accountant = TrafficAccountant::new();
        let (mut client, server) = duplex(4096);
        let (reader, mut writer) = tokio::io::split(server);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(async move {
            let mut sink = Vec::new();
            pump(
                reader,
                &mut sink,
                TrafficTag::Upload,
                &TrafficAccountant::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
            sink
        });

        client.write_all(b"hello world").await.unwrap();
        let _ = writer.shutdown().await;
        drop(client);

        let sink = handle.await.unwrap();
        assert_eq!(sink, b"hello world");
        accountant.record_up(sink.len());
        assert_eq!(accountant.snapshot().upload_total, 0); // not drained until tick()
        drop(cancel);
    }

    #[tokio::test]
    async fn cancel_token_stops_pump_immediately() {
        let (_client, server) = duplex(4096);
        let (reader, _writer) = tokio::io::split(server);
        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();
        let accountant = TrafficAccountant::new();

        let handle = tokio::spawn(async move {
            let mut sink = Vec::new();
            pump(reader, &mut sink, TrafficTag::Download, &accountant, &cancel2).await
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cancel.cancel();
        let result = handle.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn cancel_token_reaches_a_task_that_has_not_awaited_yet() {
        // A token cancelled before the pump ever enters its select! loop
        // must still be observed — this is the bug CancellationToken fixes
        // relative to `Notify::notify_waiters`, which only wakes tasks
        // already parked on it.
        let (_client, server) = duplex(4096);
        let (reader, _writer) = tokio::io::split(server);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let accountant = TrafficAccountant::new();

        let mut sink = Vec::new();
        let result = pump(reader, &mut sink, TrafficTag::Download, &accountant, &cancel).await;
        assert!(result.is_ok());
    }

    #[test]
    fn chunk_size_matches_spec() {
        assert_eq!(CHUNK, 65_536);
    }
}
