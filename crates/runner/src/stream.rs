use std::io;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::capture::{Capture, Pushed, Stream};

/// Chunk size used when no delimiter is configured.
pub const BLOCK_SIZE: usize = 140;

/// Reads `reader` until EOF, storing one chunk per delimiter-terminated
/// segment (or per block when `delimiter` is `None`). Once the line limit
/// is hit, `overflow` is cancelled and the remainder is drained unstored.
pub(crate) async fn read_stream_chunks<R: AsyncRead + Unpin>(
    reader: R,
    stream: Stream,
    delimiter: Option<u8>,
    capture: Arc<Capture>,
    max_lines: usize,
    overflow: CancellationToken,
) -> io::Result<()> {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let n = match delimiter {
            Some(delimiter) => reader.read_until(delimiter, &mut buf).await?,
            None => {
                buf.resize(BLOCK_SIZE, 0);
                let n = reader.read(&mut buf).await?;
                buf.truncate(n);
                n
            }
        };
        if n == 0 {
            break;
        }
        let chunk = String::from_utf8_lossy(&buf).to_string();
        if let Pushed::OverLimit = capture.push(stream, chunk, max_lines) {
            overflow.cancel();
        }
    }
    Ok(())
}
