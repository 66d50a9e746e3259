use std::io::{self, Read as _};
use std::os::fd::RawFd;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConnection, IoState, ServerConnection};

use crate::error::Error;
use crate::metrics;

/// A TLS session handed to a socket before it is attached.
///
/// The caller builds the underlying rustls connection with credentials,
/// ALPN, and policy already assigned; the socket only drives the record
/// machine against its descriptor. Server (inbound) or client (outbound).
pub enum TlsSession {
    Server(ServerConnection),
    Client(ClientConnection),
}

impl TlsSession {
    /// Build a server-side session from a prepared rustls config.
    pub fn server(config: Arc<rustls::ServerConfig>) -> Result<Self, Error> {
        Ok(TlsSession::Server(ServerConnection::new(config)?))
    }

    /// Build a client-side session from a prepared rustls config and the
    /// name to verify the peer against.
    pub fn client(
        config: Arc<rustls::ClientConfig>,
        name: ServerName<'static>,
    ) -> Result<Self, Error> {
        Ok(TlsSession::Client(ClientConnection::new(config, name)?))
    }

    pub(crate) fn read_tls(&mut self, rd: &mut dyn io::Read) -> io::Result<usize> {
        match self {
            TlsSession::Server(c) => c.read_tls(rd),
            TlsSession::Client(c) => c.read_tls(rd),
        }
    }

    pub(crate) fn write_tls(&mut self, wr: &mut dyn io::Write) -> io::Result<usize> {
        match self {
            TlsSession::Server(c) => c.write_tls(wr),
            TlsSession::Client(c) => c.write_tls(wr),
        }
    }

    pub(crate) fn process_new_packets(&mut self) -> Result<IoState, rustls::Error> {
        match self {
            TlsSession::Server(c) => c.process_new_packets(),
            TlsSession::Client(c) => c.process_new_packets(),
        }
    }

    pub(crate) fn reader(&mut self) -> rustls::Reader<'_> {
        match self {
            TlsSession::Server(c) => c.reader(),
            TlsSession::Client(c) => c.reader(),
        }
    }

    pub(crate) fn writer(&mut self) -> rustls::Writer<'_> {
        match self {
            TlsSession::Server(c) => c.writer(),
            TlsSession::Client(c) => c.writer(),
        }
    }

    pub(crate) fn wants_write(&self) -> bool {
        match self {
            TlsSession::Server(c) => c.wants_write(),
            TlsSession::Client(c) => c.wants_write(),
        }
    }

    pub(crate) fn is_handshaking(&self) -> bool {
        match self {
            TlsSession::Server(c) => c.is_handshaking(),
            TlsSession::Client(c) => c.is_handshaking(),
        }
    }

    pub(crate) fn send_close_notify(&mut self) {
        match self {
            TlsSession::Server(c) => c.send_close_notify(),
            TlsSession::Client(c) => c.send_close_notify(),
        }
    }
}

/// Per-socket TLS state: the session plus direction-specific progress flags.
pub(crate) struct Tls {
    pub session: TlsSession,
    /// Handshake not yet complete.
    pub handshaking: bool,
    /// Our close_notify has been queued into the session.
    pub shutdown_sent: bool,
}

impl Tls {
    pub(crate) fn new(session: TlsSession) -> Self {
        let handshaking = session.is_handshaking();
        Tls {
            session,
            handshaking,
            shutdown_sent: false,
        }
    }

    /// Queue our close_notify exactly once.
    pub(crate) fn queue_close_notify(&mut self) {
        if !self.shutdown_sent {
            self.session.send_close_notify();
            self.shutdown_sent = true;
        }
    }

    /// Flush pending TLS output to the descriptor.
    ///
    /// Returns `Ok(true)` when the session has nothing more to write,
    /// `Ok(false)` when the descriptor would block with output remaining.
    pub(crate) fn flush(&mut self, fd: RawFd) -> io::Result<bool> {
        let mut out = FdIo { fd };
        while self.session.wants_write() {
            match self.session.write_tls(&mut out) {
                Ok(0) => return Ok(false),
                Ok(n) => {
                    metrics::BYTES_SENT.add(n as u64);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Drain decrypted plaintext into `buf`. Returns the number of bytes
    /// read; `Ok(0)` means no plaintext is currently available or the peer
    /// has cleanly closed (the caller distinguishes via the io state).
    pub(crate) fn read_plaintext(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.session.reader().read(buf) {
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            // A peer that vanishes without close_notify still counts as
            // end-of-stream at this layer; the transport read reports the
            // hard error.
            Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(0),
            Err(e) => Err(e),
        }
    }
}

/// Non-blocking reader/writer over a raw descriptor for the rustls
/// transport callbacks. `WouldBlock` passes through untouched.
pub(crate) struct FdIo {
    pub fd: RawFd,
}

impl io::Read for FdIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::read(
                self.fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

impl io::Write for FdIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::write(
                self.fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
    use std::io::Write as _;

    fn test_cert() -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let key = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());
        let cert_der = CertificateDer::from(cert.cert);
        (vec![cert_der], key.into())
    }

    fn session_pair() -> (Tls, Tls) {
        let (certs, key) = test_cert();

        let server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs.clone(), key)
            .unwrap();

        let mut roots = rustls::RootCertStore::empty();
        for cert in &certs {
            roots.add(cert.clone()).unwrap();
        }
        let client_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        let server = TlsSession::server(Arc::new(server_config)).unwrap();
        let client = TlsSession::client(
            Arc::new(client_config),
            ServerName::try_from("localhost").unwrap(),
        )
        .unwrap();
        (Tls::new(server), Tls::new(client))
    }

    /// Move pending TLS output from `from` into `to` through memory.
    fn pump(from: &mut Tls, to: &mut Tls) -> usize {
        let mut wire = Vec::new();
        while from.session.wants_write() {
            from.session.write_tls(&mut wire).unwrap();
        }
        if wire.is_empty() {
            return 0;
        }
        let mut cursor = io::Cursor::new(&wire[..]);
        while (cursor.position() as usize) < wire.len() {
            to.session.read_tls(&mut cursor).unwrap();
            to.session.process_new_packets().unwrap();
        }
        wire.len()
    }

    fn complete_handshake(client: &mut Tls, server: &mut Tls) {
        for _ in 0..10 {
            pump(client, server);
            pump(server, client);
            if !client.session.is_handshaking() && !server.session.is_handshaking() {
                return;
            }
        }
        panic!("handshake did not converge");
    }

    #[test]
    fn handshake_and_round_trip() {
        let (mut server, mut client) = session_pair();
        assert!(client.handshaking);
        assert!(server.handshaking);

        complete_handshake(&mut client, &mut server);

        client.session.writer().write_all(b"ping").unwrap();
        pump(&mut client, &mut server);

        let mut plain = [0u8; 16];
        let n = server.read_plaintext(&mut plain).unwrap();
        assert_eq!(&plain[..n], b"ping");
    }

    #[test]
    fn plaintext_read_would_block_is_zero() {
        let (mut server, mut client) = session_pair();
        complete_handshake(&mut client, &mut server);

        let mut plain = [0u8; 16];
        assert_eq!(server.read_plaintext(&mut plain).unwrap(), 0);
    }

    #[test]
    fn close_notify_is_queued_once() {
        let (mut server, mut client) = session_pair();
        complete_handshake(&mut client, &mut server);

        client.queue_close_notify();
        assert!(client.shutdown_sent);
        assert!(client.session.wants_write());
        client.queue_close_notify();

        pump(&mut client, &mut server);
        let state = server.session.process_new_packets().unwrap();
        assert!(state.peer_has_closed());
    }
}
