// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TLS and DTLS layering over established transports.
//!
//! Stream TLS (over TCP and adopted streams) runs on rustls, pumped from
//! the readiness loop: socket bytes feed `read_tls`, decrypted plaintext
//! flows into the connection's framing buffer, and pending handshake or
//! application records flush through `write_tls` until the socket pushes
//! back.
//!
//! Datagram TLS is a pluggable capability: the [`DtlsProvider`] trait
//! carries session construction and the server-side cookie exchange, and
//! the mux owns the orchestration around it (per-peer socket cloning,
//! session hand-over, listener restart). No DTLS engine ships here.
//!
//! Key-material export uses the standard TLS exporter interface; the SRTP
//! and DTLS-over-SCTP labels are fixed by their RFCs.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConfig, ServerConnection};

use crate::error::{Error, ErrorKind, Result};
use crate::mux::options::{CertOptions, Tri};
use crate::pool::TlsParams;

/// RFC 5764 exporter label for SRTP key material.
const SRTP_EXPORTER_LABEL: &[u8] = b"EXTRACTOR-dtls_srtp";
/// RFC 6083 exporter label for DTLS-over-SCTP.
const SCTP_EXPORTER_LABEL: &[u8] = b"EXPORTER_DTLS_OVER_SCTP";

// ============================================================================
// Raw-fd I/O adapter
// ============================================================================

/// Borrow a descriptor as `Read`/`Write` for the rustls record pump.
pub(crate) struct FdIo(pub RawFd);

impl Read for FdIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(self.0, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

impl Write for FdIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe { libc::write(self.0, buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ============================================================================
// DTLS provider seam
// ============================================================================

/// Handshake progress of a datagram security session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DtlsHandshake {
    Done,
    WantRead,
    WantWrite,
    Failed(String),
}

/// Outcome of one cookie-listen step on a DTLS server socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieListen {
    /// Cookie exchange still in flight; stay on the listener.
    NeedMore,
    /// Peer presented a valid cookie; hand the session to a cloned socket.
    Verified(SocketAddr),
}

/// One datagram security session (DTLS over UDP or SCTP).
pub trait DtlsSession {
    fn handshake_step(&mut self, fd: RawFd) -> DtlsHandshake;
    fn is_handshaking(&self) -> bool;
    /// Decrypt available application data; `Ok(0)` with `closed` semantics
    /// is signalled through an empty read after `is_closed`.
    fn read_plaintext(&mut self, fd: RawFd, out: &mut Vec<u8>) -> Result<usize>;
    fn write_plaintext(&mut self, fd: RawFd, bytes: &[u8]) -> Result<usize>;
    fn shutdown(&mut self, fd: RawFd);
    fn export_keying_material(
        &self,
        label: &[u8],
        context: Option<&[u8]>,
        out: &mut [u8],
    ) -> Result<()>;
}

/// Factory for datagram security sessions plus the server cookie exchange.
pub trait DtlsProvider {
    fn server_session(&mut self, params: &TlsParams) -> Result<Box<dyn DtlsSession>>;
    fn client_session(&mut self, params: &TlsParams) -> Result<Box<dyn DtlsSession>>;
    /// Drive one round of the stateless cookie exchange on the listening
    /// socket. `Verified` means the next handshake step belongs to a
    /// per-peer socket connected to the returned address.
    fn cookie_listen(
        &mut self,
        session: &mut dyn DtlsSession,
        fd: RawFd,
    ) -> Result<CookieListen>;
}

// ============================================================================
// Session
// ============================================================================

/// A security session layered over one connection.
pub enum TlsSession {
    StreamClient(Box<ClientConnection>),
    StreamServer(Box<ServerConnection>),
    Datagram(Box<dyn DtlsSession>),
}

impl std::fmt::Debug for TlsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsSession::StreamClient(_) => f.write_str("TlsSession::StreamClient"),
            TlsSession::StreamServer(_) => f.write_str("TlsSession::StreamServer"),
            TlsSession::Datagram(_) => f.write_str("TlsSession::Datagram"),
        }
    }
}

impl TlsSession {
    pub fn is_handshaking(&self) -> bool {
        match self {
            TlsSession::StreamClient(c) => c.is_handshaking(),
            TlsSession::StreamServer(c) => c.is_handshaking(),
            TlsSession::Datagram(d) => d.is_handshaking(),
        }
    }

    pub fn wants_write(&self) -> bool {
        match self {
            TlsSession::StreamClient(c) => c.wants_write(),
            TlsSession::StreamServer(c) => c.wants_write(),
            TlsSession::Datagram(_) => false,
        }
    }

    /// Feed socket bytes through the session; returns decrypted plaintext
    /// and whether the peer closed (TLS close_notify or transport EOF).
    pub fn pump_read(&mut self, fd: RawFd) -> Result<(Vec<u8>, bool)> {
        match self {
            TlsSession::StreamClient(c) => pump_read_common(&mut **c, fd),
            TlsSession::StreamServer(c) => pump_read_common(&mut **c, fd),
            TlsSession::Datagram(d) => {
                let mut out = Vec::new();
                let n = d.read_plaintext(fd, &mut out)?;
                Ok((out, n == 0 && !d.is_handshaking()))
            }
        }
    }

    /// Flush pending records to the socket. Returns true when the socket
    /// pushed back (write readiness should be awaited).
    pub fn pump_write(&mut self, fd: RawFd) -> Result<bool> {
        let mut io = FdIo(fd);
        let conn: &mut dyn io_write_pump::WritePump = match self {
            TlsSession::StreamClient(c) => &mut **c,
            TlsSession::StreamServer(c) => &mut **c,
            TlsSession::Datagram(_) => return Ok(false),
        };
        while conn.pump_wants_write() {
            match conn.pump_write_tls(&mut io) {
                Ok(0) => return Ok(true),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::from(e)),
            }
        }
        Ok(false)
    }

    /// Encrypt and send application bytes. The byte count reported is the
    /// plaintext length; records are flushed as far as the socket allows.
    pub fn write_plain(&mut self, fd: RawFd, bytes: &[u8]) -> Result<usize> {
        match self {
            TlsSession::StreamClient(c) => {
                c.writer().write_all(bytes).map_err(Error::from)?;
            }
            TlsSession::StreamServer(c) => {
                c.writer().write_all(bytes).map_err(Error::from)?;
            }
            TlsSession::Datagram(d) => return d.write_plaintext(fd, bytes),
        }
        self.pump_write(fd)?;
        Ok(bytes.len())
    }

    /// Queue a close_notify and flush it best-effort.
    pub fn begin_shutdown(&mut self, fd: RawFd) {
        match self {
            TlsSession::StreamClient(c) => c.send_close_notify(),
            TlsSession::StreamServer(c) => c.send_close_notify(),
            TlsSession::Datagram(d) => {
                d.shutdown(fd);
                return;
            }
        }
        let _ = self.pump_write(fd);
    }

    /// Standard TLS keying-material exporter.
    pub fn export_keying_material(
        &self,
        label: &[u8],
        context: Option<&[u8]>,
        len: usize,
    ) -> Result<Vec<u8>> {
        let map_err = |e: rustls::Error| {
            Error::new(ErrorKind::General, format!("keying-material export failed: {}", e))
        };
        match self {
            TlsSession::StreamClient(c) => c
                .export_keying_material(vec![0u8; len], label, context)
                .map_err(map_err),
            TlsSession::StreamServer(c) => c
                .export_keying_material(vec![0u8; len], label, context)
                .map_err(map_err),
            TlsSession::Datagram(d) => {
                let mut out = vec![0u8; len];
                d.export_keying_material(label, context, &mut out)?;
                Ok(out)
            }
        }
    }

    /// SRTP master keys and salts (RFC 5764 exporter split).
    pub fn export_srtp_keys_and_salts(&self) -> Result<SrtpKeysAndSalts> {
        let material = self.export_keying_material(SRTP_EXPORTER_LABEL, None, 60)?;
        let mut keys = SrtpKeysAndSalts::default();
        keys.client_key.copy_from_slice(&material[0..16]);
        keys.server_key.copy_from_slice(&material[16..32]);
        keys.client_salt.copy_from_slice(&material[32..46]);
        keys.server_salt.copy_from_slice(&material[46..60]);
        Ok(keys)
    }

    /// Shared key for DTLS-over-SCTP (RFC 6083).
    pub fn export_sctp_key(&self) -> Result<Vec<u8>> {
        self.export_keying_material(SCTP_EXPORTER_LABEL, None, 64)
    }
}

/// SRTP master key material, split per RFC 5764 §4.2.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SrtpKeysAndSalts {
    pub client_key: [u8; 16],
    pub server_key: [u8; 16],
    pub client_salt: [u8; 14],
    pub server_salt: [u8; 14],
}

fn pump_read_common<D>(
    conn: &mut rustls::ConnectionCommon<D>,
    fd: RawFd,
) -> Result<(Vec<u8>, bool)> {
    let mut io = FdIo(fd);
    let mut closed = false;
    match conn.read_tls(&mut io) {
        Ok(0) => closed = true,
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
        Err(e) => return Err(Error::from(e)),
    }
    let state = conn
        .process_new_packets()
        .map_err(|e| Error::new(ErrorKind::Protocol, format!("TLS record error: {}", e)))?;
    if state.peer_has_closed() {
        closed = true;
    }
    let mut plaintext = Vec::new();
    let available = state.plaintext_bytes_to_read();
    if available > 0 {
        plaintext.resize(available, 0);
        conn.reader()
            .read_exact(&mut plaintext)
            .map_err(Error::from)?;
    }
    Ok((plaintext, closed))
}

/// Object-safe shim over the two rustls connection types for the write pump.
mod io_write_pump {
    use std::io;

    pub trait WritePump {
        fn pump_wants_write(&self) -> bool;
        fn pump_write_tls(&mut self, io: &mut dyn io::Write) -> io::Result<usize>;
    }

    impl WritePump for rustls::ClientConnection {
        fn pump_wants_write(&self) -> bool {
            self.wants_write()
        }

        fn pump_write_tls(&mut self, io: &mut dyn io::Write) -> io::Result<usize> {
            self.write_tls(io)
        }
    }

    impl WritePump for rustls::ServerConnection {
        fn pump_wants_write(&self) -> bool {
            self.wants_write()
        }

        fn pump_write_tls(&mut self, io: &mut dyn io::Write) -> io::Result<usize> {
            self.write_tls(io)
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Merge per-connection overrides over the process-wide certificate set.
pub(crate) fn effective_certs(defaults: &CertOptions, params: &TlsParams) -> CertOptions {
    CertOptions {
        key_file: params.key_file.clone().or_else(|| defaults.key_file.clone()),
        cert_file: params.cert_file.clone().or_else(|| defaults.cert_file.clone()),
        ca_list_file: params
            .ca_list_file
            .clone()
            .or_else(|| defaults.ca_list_file.clone()),
        cipher_list: params
            .cipher_list
            .clone()
            .or_else(|| defaults.cipher_list.clone()),
        password: params.password.clone().or_else(|| defaults.password.clone()),
    }
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        Error::new(
            ErrorKind::InvalidArgument,
            format!("cannot open certificate file {}: {}", path, e),
        )
    })?;
    let certs: std::result::Result<Vec<_>, _> = rustls_pemfile::certs(&mut BufReader::new(file)).collect();
    let certs = certs.map_err(|e| {
        Error::new(
            ErrorKind::InvalidArgument,
            format!("malformed certificate file {}: {}", path, e),
        )
    })?;
    if certs.is_empty() {
        return Err(Error::new(
            ErrorKind::InvalidArgument,
            format!("no certificates found in {}", path),
        ));
    }
    Ok(certs)
}

fn load_key(path: &str, password: Option<&str>) -> Result<PrivateKeyDer<'static>> {
    if password.is_some() {
        log::warn!(
            "[MUX] encrypted private keys are not supported by the TLS engine; \
             decrypt {} offline",
            path
        );
    }
    let file = File::open(path).map_err(|e| {
        Error::new(
            ErrorKind::InvalidArgument,
            format!("cannot open private key file {}: {}", path, e),
        )
    })?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| {
            Error::new(
                ErrorKind::InvalidArgument,
                format!("malformed private key file {}: {}", path, e),
            )
        })?
        .ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidArgument,
                format!("no private key found in {}", path),
            )
        })
}

fn warn_unsupported_versions(versions: &crate::mux::options::SslVersions) {
    for (name, tri) in [
        ("SSLv2", versions.sslv2),
        ("SSLv3", versions.sslv3),
        ("TLSv1", versions.tlsv1),
        ("TLSv1.1", versions.tlsv1_1),
    ] {
        if tri == Tri::Yes {
            log::warn!("[MUX] {} was requested but the TLS engine does not offer it", name);
        }
    }
}

/// Build the server-side session for one connection.
pub(crate) fn server_session(
    defaults: &CertOptions,
    params: &TlsParams,
) -> Result<TlsSession> {
    let certs = effective_certs(defaults, params);
    if let Some(v) = params.versions.as_ref() {
        warn_unsupported_versions(v);
    }
    let cert_file = certs.cert_file.as_deref().ok_or_else(|| {
        Error::new(ErrorKind::InvalidArgument, "server TLS requires a certificate file")
    })?;
    let key_file = certs.key_file.as_deref().ok_or_else(|| {
        Error::new(ErrorKind::InvalidArgument, "server TLS requires a private key file")
    })?;
    let chain = load_certs(cert_file)?;
    let key = load_key(key_file, certs.password.as_deref())?;
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|e| Error::new(ErrorKind::InvalidArgument, format!("TLS server setup: {}", e)))?;
    config.alpn_protocols = params.alpn.clone();
    let conn = ServerConnection::new(Arc::new(config))
        .map_err(|e| Error::new(ErrorKind::General, format!("TLS server session: {}", e)))?;
    Ok(TlsSession::StreamServer(Box::new(conn)))
}

/// Build the client-side session for one connection.
///
/// `verify_peer` follows the process configuration; the trust store is the
/// configured CA list file (system roots are not consulted).
pub(crate) fn client_session(
    defaults: &CertOptions,
    params: &TlsParams,
    verify_peer: bool,
    session_resumption: bool,
    peer: &str,
) -> Result<TlsSession> {
    let certs = effective_certs(defaults, params);
    if let Some(v) = params.versions.as_ref() {
        warn_unsupported_versions(v);
    }
    let builder = if verify_peer {
        let mut roots = RootCertStore::empty();
        if let Some(ca_file) = certs.ca_list_file.as_deref() {
            for cert in load_certs(ca_file)? {
                roots.add(cert).map_err(|e| {
                    Error::new(
                        ErrorKind::InvalidArgument,
                        format!("bad CA certificate in {}: {}", ca_file, e),
                    )
                })?;
            }
        }
        ClientConfig::builder().with_root_certificates(roots)
    } else {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
    };
    let mut config = match (certs.cert_file.as_deref(), certs.key_file.as_deref()) {
        (Some(cert_file), Some(key_file)) => {
            let chain = load_certs(cert_file)?;
            let key = load_key(key_file, certs.password.as_deref())?;
            builder.with_client_auth_cert(chain, key).map_err(|e| {
                Error::new(ErrorKind::InvalidArgument, format!("TLS client cert: {}", e))
            })?
        }
        _ => builder.with_no_client_auth(),
    };
    config.alpn_protocols = params.alpn.clone();
    if !session_resumption {
        config.resumption = rustls::client::Resumption::disabled();
    }

    let host = params
        .tls_hostname
        .clone()
        .unwrap_or_else(|| peer.to_string());
    let server_name = ServerName::try_from(host.clone()).map_err(|_| {
        Error::new(
            ErrorKind::Hostname,
            format!("{} is not a valid TLS server name", host),
        )
    })?;
    let conn = ClientConnection::new(Arc::new(config), server_name)
        .map_err(|e| Error::new(ErrorKind::General, format!("TLS client session: {}", e)))?;
    Ok(TlsSession::StreamClient(Box::new(conn)))
}

// ============================================================================
// No-verification certificate verifier (closed deployments)
// ============================================================================

#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_certs_prefers_connection_overrides() {
        let defaults = CertOptions {
            key_file: Some("proc.key".into()),
            cert_file: Some("proc.crt".into()),
            ca_list_file: Some("proc-ca.pem".into()),
            cipher_list: None,
            password: None,
        };
        let mut params = TlsParams::default();
        params.key_file = Some("conn.key".into());
        let merged = effective_certs(&defaults, &params);
        assert_eq!(merged.key_file.as_deref(), Some("conn.key"));
        assert_eq!(merged.cert_file.as_deref(), Some("proc.crt"));
        assert_eq!(merged.ca_list_file.as_deref(), Some("proc-ca.pem"));
    }

    #[test]
    fn test_server_session_requires_material() {
        let err = server_session(&CertOptions::default(), &TlsParams::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_client_session_without_verification() {
        let session = client_session(
            &CertOptions::default(),
            &TlsParams::default(),
            false,
            true,
            "127.0.0.1",
        )
        .unwrap();
        assert!(session.is_handshaking());
        // a fresh client wants to send its hello
        assert!(session.wants_write());
    }

    #[test]
    fn test_bad_hostname_is_hostname_error() {
        let err = client_session(
            &CertOptions::default(),
            &TlsParams::default(),
            false,
            true,
            "not a hostname",
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Hostname);
    }
}
