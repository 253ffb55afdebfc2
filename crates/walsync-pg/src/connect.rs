//! Shared Postgres connection utilities with TLS support.

use std::sync::Arc;

use rustls::ClientConfig;
use tokio_postgres::Client;
use tokio_postgres_rustls_improved::MakeRustlsConnect;
use tracing::warn;
use walsync_config::{ConnectionConfig, SslMode};

use crate::error::{PgError, PgResult};

/// Connect to Postgres with TLS settings taken from `ssl_mode`.
/// Spawns the connection task and returns only the client; dropping the
/// client ends the task and closes the socket.
pub async fn connect_postgres(config: &ConnectionConfig) -> PgResult<Client> {
    let pg_config = pg_config(config);

    match tls_client_config(config.ssl_mode)? {
        Some(tls) => {
            let connector = MakeRustlsConnect::new((*tls).clone());
            let (client, connection) = pg_config
                .connect(connector)
                .await
                .map_err(|e| PgError::Connection(e.to_string()))?;

            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::error!(error = %e, "Postgres connection error");
                }
            });

            Ok(client)
        }
        None => {
            let (client, connection) = pg_config
                .connect(tokio_postgres::NoTls)
                .await
                .map_err(|e| PgError::Connection(e.to_string()))?;

            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::error!(error = %e, "Postgres connection error");
                }
            });

            Ok(client)
        }
    }
}

fn pg_config(config: &ConnectionConfig) -> tokio_postgres::Config {
    let mut pg = tokio_postgres::Config::new();
    pg.host(&config.host)
        .port(config.port)
        .user(&config.user)
        .dbname(&config.database)
        .application_name("walsync");
    if !config.password.is_empty() {
        pg.password(&config.password);
    }
    if config.ssl_mode.is_enabled() {
        pg.ssl_mode(tokio_postgres::config::SslMode::Require);
    }
    pg
}

/// rustls client configuration for `mode`, or `None` when TLS is disabled.
///
/// Shared by the SQL connections and the raw replication socket so both
/// negotiate TLS identically.
pub(crate) fn tls_client_config(mode: SslMode) -> PgResult<Option<Arc<ClientConfig>>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let config = match mode {
        SslMode::Disable => return Ok(None),
        SslMode::Require => {
            warn!("sslmode=require does not verify the server certificate");
            ClientConfig::builder_with_provider(provider.clone())
                .with_safe_default_protocol_versions()
                .map_err(|e| PgError::Tls(format!("TLS config error: {}", e)))?
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(danger::NoCertificateVerification::new(
                    provider,
                )))
                .with_no_client_auth()
        }
        SslMode::VerifyFull => ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| PgError::Tls(format!("TLS config error: {}", e)))?
            .with_root_certificates(root_certs())
            .with_no_client_auth(),
    };

    Ok(Some(Arc::new(config)))
}

/// Get root certificates from webpki-roots.
fn root_certs() -> rustls::RootCertStore {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    roots
}

/// Certificate verifier for `sslmode=require`: the channel is encrypted but
/// the server's identity is not checked. Signatures are still verified.
mod danger {
    use std::sync::Arc;

    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::CryptoProvider;
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error, SignatureScheme};

    #[derive(Debug)]
    pub struct NoCertificateVerification(Arc<CryptoProvider>);

    impl NoCertificateVerification {
        pub fn new(provider: Arc<CryptoProvider>) -> Self {
            Self(provider)
        }
    }

    impl ServerCertVerifier for NoCertificateVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_disabled() {
        assert!(tls_client_config(SslMode::Disable).unwrap().is_none());
    }

    #[test]
    fn test_tls_modes_build() {
        assert!(tls_client_config(SslMode::Require).unwrap().is_some());
        assert!(tls_client_config(SslMode::VerifyFull).unwrap().is_some());
    }

    #[test]
    fn test_pg_config_carries_parameters() {
        let config = ConnectionConfig::new("db", 6543, "app", "", "shop", SslMode::Disable).unwrap();
        let pg = pg_config(&config);
        assert_eq!(pg.get_ports(), &[6543]);
        assert_eq!(pg.get_user(), Some("app"));
        assert_eq!(pg.get_dbname(), Some("shop"));
        assert!(pg.get_password().is_none());
    }
}
