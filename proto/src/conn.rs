use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::{Buf, BytesMut};
use krypton_misc::time::now_millis;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter, ReadHalf, WriteHalf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::Mutex;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};

use crate::frame::RawFrame;
use crate::packet::Packet;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

enum ReadStream {
    Plain(OwnedReadHalf),
    Tls(ReadHalf<TlsStream<TcpStream>>),
    Gone,
}

enum WriteStream {
    Plain(BufWriter<OwnedWriteHalf>),
    Tls(BufWriter<WriteHalf<TlsStream<TcpStream>>>),
    Gone,
}

struct ConnReader {
    stream: ReadStream,
    buffer: BytesMut,
}

struct ConnWriter {
    stream: WriteStream,
}

/// One bidirectional packet stream.
///
/// Reads happen only from the owning reader task through [`recv`]; writes
/// from any task are serialized by the internal send mutex, so frames from
/// concurrent producers can never interleave on the wire.
///
/// [`recv`]: Connection::recv
/// [`send`]: Connection::send
pub struct Connection {
    reader: Mutex<ConnReader>,
    writer: Mutex<ConnWriter>,

    last_activity: AtomicU64,
    tls: AtomicBool,
}

impl Connection {
    /// The read buffer size, default is 32KiB. Most clipboard traffic is
    /// small text; the buffer grows on demand for images.
    const BUFFER_SIZE: usize = 32 << 10;

    pub fn new(socket: TcpStream) -> Connection {
        let (read, write) = socket.into_split();
        Connection {
            reader: Mutex::new(ConnReader {
                stream: ReadStream::Plain(read),
                buffer: BytesMut::with_capacity(Self::BUFFER_SIZE),
            }),
            writer: Mutex::new(ConnWriter {
                stream: WriteStream::Plain(BufWriter::new(write)),
            }),
            last_activity: AtomicU64::new(now_millis()),
            tls: AtomicBool::new(false),
        }
    }

    /// Connects to `addr` ("host:port") with a 10s timeout.
    pub async fn dial(addr: &str) -> Result<Connection> {
        let addr = Self::parse_addr(addr).await?;
        let connect = TcpStream::connect(addr);
        let stream = tokio::time::timeout(DIAL_TIMEOUT, connect)
            .await
            .with_context(|| format!("connect to '{addr}' timed out"))?
            .with_context(|| format!("connect to '{addr}'"))?;
        Ok(Self::new(stream))
    }

    async fn parse_addr(addr: &str) -> Result<SocketAddr> {
        if let Ok(addr) = addr.parse::<SocketAddr>() {
            return Ok(addr);
        }

        let addrs: Vec<SocketAddr> = lookup_host(addr)
            .await
            .with_context(|| format!("lookup host '{addr}'"))?
            .collect();

        let mut lookup_result: Option<SocketAddr> = None;
        for addr in addrs {
            if addr.is_ipv4() {
                lookup_result = Some(addr);
                break;
            }
            lookup_result = Some(addr);
        }
        match lookup_result {
            Some(addr) => Ok(addr),
            None => bail!("lookup host '{addr}' did not have result"),
        }
    }

    /// Reads the next packet. Returns `None` on clean EOF. Framing and
    /// decoding failures are errors and must terminate the connection.
    ///
    /// Only the task owning this connection's read side may call this.
    pub async fn recv(&self) -> Result<Option<Packet>> {
        let mut reader = self.reader.lock().await;
        loop {
            let mut buf = Cursor::new(&reader.buffer[..]);
            if let Some((frame, len)) = RawFrame::parse(&mut buf)? {
                reader.buffer.advance(len);
                self.touch();
                let packet = Packet::decode(frame)?;
                return Ok(Some(packet));
            }

            let read = reader.read_buf().await.context("read data from peer")?;
            if read == 0 {
                // The remote closed the connection. For this to be a clean
                // shutdown, there should be no data left in the read
                // buffer; a partial frame means the peer died mid-send.
                if reader.buffer.is_empty() {
                    return Ok(None);
                }
                bail!("connection reset by peer");
            }
        }
    }

    /// Like [`recv`](Connection::recv) but treats EOF as an error.
    pub async fn must_recv(&self) -> Result<Packet> {
        match self.recv().await? {
            Some(packet) => Ok(packet),
            None => bail!("connection was closed by peer"),
        }
    }

    pub async fn send(&self, packet: &Packet) -> Result<()> {
        let frame = packet.encode()?;
        let mut writer = self.writer.lock().await;
        match &mut writer.stream {
            WriteStream::Plain(stream) => {
                frame.write_to(stream).await?;
                stream.flush().await.context("flush tcp stream")?;
            }
            WriteStream::Tls(stream) => {
                frame.write_to(stream).await?;
                stream.flush().await.context("flush tls stream")?;
            }
            WriteStream::Gone => bail!("connection is closed"),
        }
        self.touch();
        Ok(())
    }

    /// Server-side STARTTLS: wraps the plaintext socket with the acceptor.
    ///
    /// Must be called from the reader task directly after the upgrade
    /// request was read, with no other I/O in flight and nothing buffered;
    /// it replaces the underlying stream atomically under both locks.
    pub async fn upgrade_server(&self, acceptor: &TlsAcceptor) -> Result<()> {
        let mut reader = self.reader.lock().await;
        let mut writer = self.writer.lock().await;
        if !reader.buffer.is_empty() {
            bail!("unexpected data buffered before tls handshake");
        }

        let stream = Self::take_plain(&mut *reader, &mut *writer)?;
        let stream = acceptor
            .accept(stream)
            .await
            .context("server tls handshake")?;
        Self::install_tls(&mut *reader, &mut *writer, stream.into());
        self.tls.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Client-side STARTTLS counterpart of [`upgrade_server`].
    ///
    /// [`upgrade_server`]: Connection::upgrade_server
    pub async fn upgrade_client(
        &self,
        connector: &TlsConnector,
        server_name: ServerName<'static>,
    ) -> Result<()> {
        let mut reader = self.reader.lock().await;
        let mut writer = self.writer.lock().await;
        if !reader.buffer.is_empty() {
            bail!("unexpected data buffered before tls handshake");
        }

        let stream = Self::take_plain(&mut *reader, &mut *writer)?;
        let stream = connector
            .connect(server_name, stream)
            .await
            .context("client tls handshake")?;
        Self::install_tls(&mut *reader, &mut *writer, stream.into());
        self.tls.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn take_plain(reader: &mut ConnReader, writer: &mut ConnWriter) -> Result<TcpStream> {
        let read = std::mem::replace(&mut reader.stream, ReadStream::Gone);
        let write = std::mem::replace(&mut writer.stream, WriteStream::Gone);
        let (read, write) = match (read, write) {
            (ReadStream::Plain(read), WriteStream::Plain(write)) => (read, write),
            _ => bail!("connection already upgraded to tls"),
        };
        // The write buffer is flushed after every send, so dropping the
        // BufWriter here loses nothing.
        let write = write.into_inner();
        read.reunite(write).context("reunite tcp stream halves")
    }

    fn install_tls(reader: &mut ConnReader, writer: &mut ConnWriter, stream: TlsStream<TcpStream>) {
        let (read, write) = tokio::io::split(stream);
        reader.stream = ReadStream::Tls(read);
        writer.stream = WriteStream::Tls(BufWriter::new(write));
    }

    /// Shuts down the write side. The reader observes EOF afterwards.
    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        match &mut writer.stream {
            WriteStream::Plain(stream) => {
                let _ = stream.shutdown().await;
            }
            WriteStream::Tls(stream) => {
                let _ = stream.shutdown().await;
            }
            WriteStream::Gone => {}
        }
        writer.stream = WriteStream::Gone;
    }

    /// Unix millis of the last successful send or recv. Read without
    /// locking by the stale-session sweeper; slightly stale values are
    /// acceptable there.
    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    pub fn is_tls(&self) -> bool {
        self.tls.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        self.last_activity.store(now_millis(), Ordering::Relaxed);
    }
}

impl ConnReader {
    async fn read_buf(&mut self) -> std::io::Result<usize> {
        match &mut self.stream {
            ReadStream::Plain(stream) => stream.read_buf(&mut self.buffer).await,
            ReadStream::Tls(stream) => stream.read_buf(&mut self.buffer).await,
            ReadStream::Gone => Ok(0),
        }
    }
}
