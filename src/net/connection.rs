// TCP connection handler
// Line-delimited JSON framing over one client socket

use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::constants::MAX_LINE_BYTES;

/// Represents a single TCP connection to a client
pub struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
    peer_addr: SocketAddr,
    /// Bytes of the line being assembled
    partial: Vec<u8>,
    max_line: usize,
}

impl Connection {
    pub fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Self::with_max_line(stream, peer_addr, MAX_LINE_BYTES)
    }

    pub fn with_max_line(stream: TcpStream, peer_addr: SocketAddr, max_line: usize) -> Self {
        let (read_half, write_half) = stream.into_split();
        Connection {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            peer_addr,
            partial: Vec::new(),
            max_line,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Next frame, without the line terminator. `None` on EOF.
    ///
    /// Cancel-safe, so it can sit in a `select!` next to the outbound queue:
    /// bytes already read stay in the partial line. A line longer than the
    /// limit is an `InvalidData` error.
    pub async fn read_line(&mut self) -> io::Result<Option<String>> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                // EOF; a trailing unterminated line still counts
                if self.partial.is_empty() {
                    return Ok(None);
                }
                let line = std::mem::take(&mut self.partial);
                return decode_line(line).map(Some);
            }

            let (used, done) = match available.iter().position(|&b| b == b'\n') {
                Some(i) => {
                    self.partial.extend_from_slice(&available[..i]);
                    (i + 1, true)
                }
                None => {
                    self.partial.extend_from_slice(available);
                    (available.len(), false)
                }
            };
            self.reader.consume(used);

            if self.partial.len() > self.max_line {
                self.partial.clear();
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("line exceeds {} bytes", self.max_line),
                ));
            }
            if done {
                let line = std::mem::take(&mut self.partial);
                return decode_line(line).map(Some);
            }
        }
    }

    /// Write one frame followed by a newline
    pub async fn write_line(&mut self, frame: &str) -> io::Result<()> {
        self.writer.write_all(frame.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}

fn decode_line(mut line: Vec<u8>) -> io::Result<String> {
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
