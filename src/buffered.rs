//! Buffered byte duplex.
//!
//! The SSH channel delivers payload in small frames; buffering both halves
//! keeps the message codec from issuing one syscall-sized write per field.
//! The codec flushes after every complete message, so no background flush
//! is needed.

use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter, ReadHalf, WriteHalf};

pub const READ_BUFFER_SIZE: usize = 128 * 1024;
pub const WRITE_BUFFER_SIZE: usize = 128 * 1024;

pub type BufferedReader<S> = BufReader<ReadHalf<S>>;
pub type BufferedWriter<S> = BufWriter<WriteHalf<S>>;

/// Split a duplex stream into buffered read/write halves.
pub fn split<S>(stream: S) -> (BufferedReader<S>, BufferedWriter<S>)
where
    S: AsyncRead + AsyncWrite,
{
    let (read_half, write_half) = tokio::io::split(stream);
    (
        BufReader::with_capacity(READ_BUFFER_SIZE, read_half),
        BufWriter::with_capacity(WRITE_BUFFER_SIZE, write_half),
    )
}
