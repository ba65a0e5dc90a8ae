/*
 * net.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Postino, an IMAP maildir retrieval agent.
 *
 * Postino is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Postino is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Postino.  If not, see <http://www.gnu.org/licenses/>.
 */

//! TLS connection helpers: wrap TcpStream with rustls (implicit TLS), with
//! certificate fingerprint pinning for self-signed IMAP servers.
//!
//! A pinned SHA-1 leaf fingerprint overrides PKI verification entirely;
//! without a pin, the default host verification path is unchanged. Every
//! chain certificate's fingerprint is logged either way.

use std::fmt::Write as _;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream as TokioTlsStream;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::client::WebPkiServerVerifier;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, Error as TlsError, RootCertStore,
    SignatureScheme,
};
use tokio_rustls::TlsConnector;

/// Build a root certificate store: platform native certs first, then
/// webpki-roots as fallback.
fn build_root_store() -> RootCertStore {
    let mut root_store = RootCertStore::empty();
    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            for cert in certs {
                let _ = root_store.add(cert);
            }
        }
        Err(_) => {}
    }
    if root_store.is_empty() {
        root_store.roots = webpki_roots::TLS_SERVER_ROOTS.iter().cloned().collect();
    }
    root_store
}

/// SHA-1 of DER bytes as 40-character uppercase hex.
pub fn sha1_fingerprint(der: &[u8]) -> String {
    let digest = Sha1::digest(der);
    let mut out = String::with_capacity(40);
    for b in digest {
        let _ = write!(out, "{:02X}", b);
    }
    out
}

/// Pinned-leaf decision: None when no pin is configured, otherwise whether
/// the leaf fingerprint matches. When Some, PKI is not consulted.
fn pin_decision(pinned: &str, leaf: &str) -> Option<bool> {
    if pinned.is_empty() {
        None
    } else {
        Some(pinned.eq_ignore_ascii_case(leaf))
    }
}

/// Certificate verifier with optional SHA-1 leaf pinning. Logs every chain
/// fingerprint (position 1 = leaf) and delegates to the default webpki
/// verifier unless the pin decides.
#[derive(Debug)]
pub struct FingerprintVerifier {
    default: Arc<WebPkiServerVerifier>,
    fingerprint: String,
}

impl FingerprintVerifier {
    /// `fingerprint` is uppercase or lowercase hex; empty disables pinning.
    pub fn new(fingerprint: &str) -> io::Result<Self> {
        let roots = Arc::new(build_root_store());
        let default = WebPkiServerVerifier::builder(roots)
            .build()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        Ok(Self {
            default,
            fingerprint: fingerprint.to_ascii_uppercase(),
        })
    }
}

impl ServerCertVerifier for FingerprintVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        let leaf = sha1_fingerprint(end_entity.as_ref());
        log::info!("SHA1 fingerprint of certificate (position 1): {}", leaf);
        for (i, cert) in intermediates.iter().enumerate() {
            log::info!(
                "SHA1 fingerprint of certificate (position {}): {}",
                i + 2,
                sha1_fingerprint(cert.as_ref())
            );
        }

        match pin_decision(&self.fingerprint, &leaf) {
            Some(true) => {
                log::info!("fingerprint matches, authentication finished");
                return Ok(ServerCertVerified::assertion());
            }
            Some(false) => {
                log::error!(
                    "given fingerprint {} does not match the one of the certificate: {}",
                    self.fingerprint,
                    leaf
                );
                return Err(TlsError::InvalidCertificate(
                    CertificateError::ApplicationVerificationFailure,
                ));
            }
            None => {}
        }

        self.default
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
            .map_err(|e| {
                log::error!("certificate verification failed: {}", e);
                e
            })
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        self.default.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        self.default.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.default.supported_verify_schemes()
    }
}

fn client_config(fingerprint: &str) -> io::Result<Arc<ClientConfig>> {
    let verifier = Arc::new(FingerprintVerifier::new(fingerprint)?);
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Async TLS stream (tokio-rustls client stream over TcpStream).
pub struct TlsStreamWrapper {
    inner: TokioTlsStream<TcpStream>,
}

impl TlsStreamWrapper {
    /// Connect with implicit TLS (IMAPS 993): TCP connect then immediate
    /// handshake. The verifier logs chain fingerprints and applies the pin.
    pub async fn connect_implicit_tls(
        host: &str,
        port: u16,
        fingerprint: &str,
    ) -> io::Result<Self> {
        let addr = format!("{}:{}", host, port);
        log::info!("connecting to {} ...", addr);
        let tcp = TcpStream::connect(&addr).await?;
        log::info!("{} connected", host);
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid host name"))?;
        let connector = TlsConnector::from(client_config(fingerprint)?);
        log::info!("shaking hands with {} ...", host);
        let tls = connector.connect(server_name, tcp).await?;
        log::info!("handshake completed");
        Ok(Self { inner: tls })
    }
}

impl AsyncRead for TlsStreamWrapper {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TlsStreamWrapper {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Plain TCP stream, for `ssl = no` sessions and tests.
pub struct PlainStream {
    inner: TcpStream,
}

impl PlainStream {
    pub async fn connect(host: &str, port: u16) -> io::Result<Self> {
        let addr = format!("{}:{}", host, port);
        log::info!("connecting to {} ...", addr);
        let tcp = TcpStream::connect(&addr).await?;
        log::info!("{} connected", host);
        Ok(Self { inner: tcp })
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        Self { inner: stream }
    }
}

impl AsyncRead for PlainStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PlainStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha1_fingerprint_known_answer() {
        assert_eq!(
            sha1_fingerprint(b"abc"),
            "A9993E364706816ABA3E25717850C26C9CD0D89D"
        );
        assert_eq!(sha1_fingerprint(b"abc").len(), 40);
    }

    #[test]
    fn no_pin_defers_to_pki() {
        assert_eq!(pin_decision("", "A9993E364706816ABA3E25717850C26C9CD0D89D"), None);
    }

    #[test]
    fn pin_match_is_case_insensitive() {
        let fp = sha1_fingerprint(b"leaf certificate");
        assert_eq!(pin_decision(&fp.to_ascii_lowercase(), &fp), Some(true));
    }

    #[test]
    fn pin_mismatch_rejects_without_pki() {
        let fp = sha1_fingerprint(b"leaf certificate");
        let mut wrong = fp.clone().into_bytes();
        // One hex character off.
        wrong[0] = if wrong[0] == b'A' { b'B' } else { b'A' };
        let wrong = String::from_utf8(wrong).unwrap();
        assert_eq!(pin_decision(&wrong, &fp), Some(false));
    }
}
