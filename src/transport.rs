//! TCP and TLS transport shared by the relay client and server.

use std::{
    fs,
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs},
    path::PathBuf,
    time::Duration,
};

use native_tls::{Certificate, Identity, TlsAcceptor, TlsConnector, TlsStream};

/// Client-side TLS options.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsOptions {
    /// Domain name presented during the TLS handshake.
    pub domain: String,
    /// Extra PEM root certificate trusted when verifying the server.
    pub ca_path: Option<PathBuf>,
    /// Skip certificate validation when true (intended for tests).
    pub insecure_skip_verify: bool,
}

impl TlsOptions {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            ca_path: None,
            insecure_skip_verify: false,
        }
    }

    fn connector(&self) -> io::Result<TlsConnector> {
        let mut builder = TlsConnector::builder();
        if let Some(path) = &self.ca_path {
            let pem = fs::read(path)?;
            let cert = Certificate::from_pem(&pem).map_err(io::Error::other)?;
            builder.add_root_certificate(cert);
        }
        if self.insecure_skip_verify {
            builder.danger_accept_invalid_certs(true);
            builder.danger_accept_invalid_hostnames(true);
        }
        builder.build().map_err(io::Error::other)
    }
}

/// Server certificate chain and private key, both PEM encoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsIdentity {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl TlsIdentity {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        }
    }

    /// Load the key material and build an acceptor.
    pub fn acceptor(&self) -> io::Result<TlsAcceptor> {
        let cert = fs::read(&self.cert_path)?;
        let key = fs::read(&self.key_path)?;
        let identity = Identity::from_pkcs8(&cert, &key).map_err(io::Error::other)?;
        TlsAcceptor::new(identity).map_err(io::Error::other)
    }
}

/// An established relay connection.
pub enum RelayStream {
    PlainTcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl RelayStream {
    fn tcp(&self) -> &TcpStream {
        match self {
            RelayStream::PlainTcp(stream) => stream,
            RelayStream::Tls(stream) => stream.get_ref(),
        }
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.tcp().set_read_timeout(timeout)
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.tcp().set_write_timeout(timeout)
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().peer_addr()
    }

    /// Close both directions, sending a TLS close-notify first when needed.
    pub fn shutdown(&mut self) -> io::Result<()> {
        if let RelayStream::Tls(stream) = self {
            stream.shutdown()?;
        }
        self.tcp().shutdown(Shutdown::Both)
    }
}

impl Read for RelayStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            RelayStream::PlainTcp(stream) => stream.read(buf),
            RelayStream::Tls(stream) => stream.read(buf),
        }
    }
}

impl Write for RelayStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            RelayStream::PlainTcp(stream) => stream.write(buf),
            RelayStream::Tls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            RelayStream::PlainTcp(stream) => stream.flush(),
            RelayStream::Tls(stream) => stream.flush(),
        }
    }
}

impl std::fmt::Debug for RelayStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            RelayStream::PlainTcp(_) => "tcp",
            RelayStream::Tls(_) => "tls",
        };
        f.debug_struct("RelayStream")
            .field("kind", &kind)
            .field("peer", &self.peer_addr().ok())
            .finish()
    }
}

fn connect_tcp(address: &str, timeout: Duration) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in address.to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                stream.set_nonblocking(false)?;
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("{address} did not resolve to any socket address"),
        )
    }))
}

/// Connect to `address` (`host:port`), wrapping in TLS when configured.
///
/// The TLS handshake is bounded by `timeout` as well.
pub fn connect(address: &str, tls: Option<&TlsOptions>, timeout: Duration) -> io::Result<RelayStream> {
    let stream = connect_tcp(address, timeout)?;
    let Some(tls) = tls else {
        return Ok(RelayStream::PlainTcp(stream));
    };
    let connector = tls.connector()?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    let stream = connector
        .connect(&tls.domain, stream)
        .map_err(io::Error::other)?;
    let tcp_ref = stream.get_ref();
    tcp_ref.set_read_timeout(None)?;
    tcp_ref.set_write_timeout(None)?;
    Ok(RelayStream::Tls(Box::new(stream)))
}

/// Complete the server side of a freshly accepted connection.
pub fn accept(
    stream: TcpStream,
    acceptor: Option<&TlsAcceptor>,
    timeout: Duration,
) -> io::Result<RelayStream> {
    stream.set_nonblocking(false)?;
    let Some(acceptor) = acceptor else {
        return Ok(RelayStream::PlainTcp(stream));
    };
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    let stream = acceptor.accept(stream).map_err(io::Error::other)?;
    Ok(RelayStream::Tls(Box::new(stream)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::{net::TcpListener, sync::mpsc, thread, time::Instant};

    #[rstest]
    fn plain_connect_reaches_listener() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind ephemeral listener");
        let addr = listener.local_addr().unwrap().to_string();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept connection");
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).expect("read ping");
            buf
        });
        let mut stream = connect(&addr, None, Duration::from_secs(1)).expect("connect");
        stream.write_all(b"ping").expect("write");
        assert_eq!(&server.join().unwrap(), b"ping");
    }

    #[rstest]
    fn unresolvable_address_is_an_error() {
        assert!(connect("not-an-address", None, Duration::from_millis(100)).is_err());
    }

    #[rstest]
    fn tls_handshake_respects_timeout() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind ephemeral listener");
        let addr = listener.local_addr().unwrap().to_string();
        let (accepted_tx, accepted_rx) = mpsc::channel();
        thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept connection");
            accepted_tx.send(()).expect("signal accepted");
            // Hold the socket open without speaking TLS.
            thread::sleep(Duration::from_secs(2));
            drop(stream);
        });

        let mut tls = TlsOptions::new("localhost");
        tls.insecure_skip_verify = true;
        let start = Instant::now();
        let result = connect(&addr, Some(&tls), Duration::from_millis(250));
        let elapsed = start.elapsed();
        accepted_rx
            .recv_timeout(Duration::from_secs(1))
            .expect("connection must be accepted");
        assert!(result.is_err(), "handshake should fail for stalled peer");
        assert!(elapsed < Duration::from_secs(2), "elapsed {elapsed:?}");
    }

    #[rstest]
    fn missing_identity_files_fail_to_load() {
        let identity = TlsIdentity::new("/nonexistent/cert.pem", "/nonexistent/key.pem");
        assert!(identity.acceptor().is_err());
    }
}
