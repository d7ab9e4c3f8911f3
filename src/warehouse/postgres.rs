//! tokio-postgres backed warehouse sessions
//!
//! Redshift speaks the PostgreSQL v3 protocol, so sessions are plain
//! tokio-postgres clients. Each statement runs inside its own transaction so
//! results can be pulled from a named portal in fixed-size batches.

use crate::cli::config::{SslModeSetting, WarehouseConfig};
use crate::errors::{BridgeError, Result};
use crate::warehouse::types::{CellValue, ColumnDescriptor, Row};
use crate::warehouse::{Connector, CursorRequest, RowCursor, UpstreamCancel, WarehouseSession};
use async_trait::async_trait;
use rustls::{ClientConfig, RootCertStore};
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::config::SslMode;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Config, NoTls, Portal, Transaction};
use tokio_postgres_rustls::MakeRustlsConnect;

/// Opens tokio-postgres sessions against one warehouse endpoint
pub struct PgConnector {
    config: Config,
    target: String,
    tls: Option<MakeRustlsConnect>,
    next_id: AtomicU64,
    read_only: bool,
}

impl PgConnector {
    /// Build connector from warehouse settings; no network I/O happens here
    pub fn new(settings: &WarehouseConfig) -> Result<Self> {
        let mut config = Config::new();
        config
            .host(&settings.host)
            .port(settings.port)
            .dbname(&settings.database)
            .user(&settings.user)
            .application_name(&settings.application_name)
            .connect_timeout(Duration::from_secs(settings.connect_timeout_sec.max(1)));
        if let Some(password) = settings.password.as_deref() {
            config.password(password);
        }

        let tls = match settings.sslmode {
            SslModeSetting::Disable => {
                config.ssl_mode(SslMode::Disable);
                None
            }
            SslModeSetting::Prefer => {
                config.ssl_mode(SslMode::Prefer);
                Some(build_tls_connector(settings.ssl_root_cert.as_deref())?)
            }
            SslModeSetting::Require => {
                config.ssl_mode(SslMode::Require);
                Some(build_tls_connector(settings.ssl_root_cert.as_deref())?)
            }
        };

        Ok(Self {
            config,
            target: format!(
                "{}@{}:{}/{}",
                settings.user, settings.host, settings.port, settings.database
            ),
            tls,
            next_id: AtomicU64::new(0),
            read_only: false,
        })
    }

    /// Open every statement transaction as READ ONLY
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }
}

#[async_trait]
impl Connector for PgConnector {
    async fn connect(&self) -> Result<Box<dyn WarehouseSession>> {
        let session_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let connect_error = |err: tokio_postgres::Error| {
            BridgeError::Connection(format!("could not connect to {}: {}", self.target, err))
        };

        let client = match &self.tls {
            None => {
                let (client, connection) = self.config.connect(NoTls).await.map_err(connect_error)?;
                drive(session_id, connection);
                client
            }
            Some(tls) => {
                let (client, connection) = self
                    .config
                    .connect(tls.clone())
                    .await
                    .map_err(connect_error)?;
                drive(session_id, connection);
                client
            }
        };

        let cancel = PgCancel {
            token: client.cancel_token(),
            tls: self.tls.clone(),
        };
        Ok(Box::new(PgSession {
            client,
            cancel,
            read_only: self.read_only,
        }))
    }

    fn target(&self) -> String {
        self.target.clone()
    }
}

fn drive<F>(session_id: u64, connection: F)
where
    F: Future<Output = std::result::Result<(), tokio_postgres::Error>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            tracing::warn!(session_id, error = %err, "warehouse connection terminated");
        }
    });
}

/// Classify a tokio-postgres failure
pub(crate) fn translate(err: tokio_postgres::Error) -> BridgeError {
    if let Some(db) = err.as_db_error() {
        let code = db.code().code();
        // Class 08 and admin/crash shutdowns mean the session is gone
        if code.starts_with("08") || matches!(code, "57P01" | "57P02" | "57P03") {
            return BridgeError::Connection(db.message().to_string());
        }
        return BridgeError::Query {
            message: db.message().to_string(),
            sqlstate: Some(code.to_string()),
        };
    }
    if err.is_closed() {
        return BridgeError::Connection("warehouse session closed".to_string());
    }
    let io_failure = std::error::Error::source(&err)
        .map(|source| source.is::<std::io::Error>())
        .unwrap_or(false);
    if io_failure {
        return BridgeError::Connection(err.to_string());
    }
    BridgeError::query(err.to_string())
}

struct PgSession {
    client: Client,
    cancel: PgCancel,
    read_only: bool,
}

#[async_trait]
impl WarehouseSession for PgSession {
    async fn open_cursor<'s>(
        &'s mut self,
        request: CursorRequest<'_>,
    ) -> Result<Box<dyn RowCursor + 's>> {
        let transaction = if self.read_only {
            self.client.build_transaction().read_only(true).start().await
        } else {
            self.client.transaction().await
        }
        .map_err(translate)?;

        if let Some(timeout) = request.statement_timeout {
            let millis = timeout.as_millis().clamp(1, i32::MAX as u128);
            transaction
                .batch_execute(&format!("SET LOCAL statement_timeout TO {}", millis))
                .await
                .map_err(translate)?;
        }

        let statement = transaction.prepare(request.sql).await.map_err(translate)?;
        let params: Vec<&(dyn ToSql + Sync)> = request
            .params
            .iter()
            .map(|param| param as &(dyn ToSql + Sync))
            .collect();
        let portal = transaction
            .bind(&statement, &params)
            .await
            .map_err(translate)?;

        let columns = statement
            .columns()
            .iter()
            .map(|column| ColumnDescriptor::new(column.name(), column.type_().name()))
            .collect();

        Ok(Box::new(PgCursor {
            transaction,
            portal,
            columns,
            exhausted: false,
        }))
    }

    fn cancel_handle(&self) -> Box<dyn UpstreamCancel> {
        Box::new(self.cancel.clone())
    }

    async fn ping(&mut self) -> Result<()> {
        self.client
            .simple_query("SELECT 1")
            .await
            .map(|_| ())
            .map_err(translate)
    }

    fn is_closed(&self) -> bool {
        self.client.is_closed()
    }
}

struct PgCursor<'s> {
    transaction: Transaction<'s>,
    portal: Portal,
    columns: Vec<ColumnDescriptor>,
    exhausted: bool,
}

fn decode_row(row: &tokio_postgres::Row) -> Result<Row> {
    (0..row.len())
        .map(|index| {
            row.try_get::<_, CellValue>(index).map_err(|err| {
                BridgeError::Internal(format!(
                    "cannot decode column '{}': {}",
                    row.columns()[index].name(),
                    err
                ))
            })
        })
        .collect()
}

#[async_trait]
impl<'s> RowCursor for PgCursor<'s> {
    fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    async fn fetch(&mut self, max_rows: usize) -> Result<Vec<Row>> {
        if self.exhausted || max_rows == 0 {
            return Ok(Vec::new());
        }
        let limit = i32::try_from(max_rows).unwrap_or(i32::MAX);
        let rows = self
            .transaction
            .query_portal(&self.portal, limit)
            .await
            .map_err(translate)?;
        if rows.len() < limit as usize {
            self.exhausted = true;
        }
        rows.iter().map(decode_row).collect()
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let cursor = *self;
        drop(cursor.portal);
        cursor.transaction.commit().await.map_err(translate)
    }
}

#[derive(Clone)]
struct PgCancel {
    token: tokio_postgres::CancelToken,
    tls: Option<MakeRustlsConnect>,
}

#[async_trait]
impl UpstreamCancel for PgCancel {
    async fn cancel(&self) -> Result<()> {
        let result = match &self.tls {
            None => self.token.cancel_query(NoTls).await,
            Some(tls) => self.token.cancel_query(tls.clone()).await,
        };
        result.map_err(translate)
    }
}

fn build_tls_connector(extra_root: Option<&Path>) -> Result<MakeRustlsConnect> {
    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for err in &native.errors {
        tracing::debug!(error = %err, "skipping unreadable native certificate");
    }
    for cert in native.certs {
        // Individual malformed system certs are not fatal
        let _ = roots.add(cert);
    }

    if let Some(path) = extra_root {
        let pem = std::fs::read(path).map_err(|err| {
            BridgeError::Config(format!("cannot read ssl_root_cert {}: {}", path.display(), err))
        })?;
        let mut reader = std::io::Cursor::new(pem);
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert.map_err(|err| {
                BridgeError::Config(format!("invalid certificate in {}: {}", path.display(), err))
            })?;
            roots
                .add(cert)
                .map_err(|err| BridgeError::Config(format!("rejected root certificate: {}", err)))?;
        }
    }

    if roots.is_empty() {
        return Err(BridgeError::Config(
            "no root certificates available for TLS".to_string(),
        ));
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let tls_config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|err| BridgeError::Config(format!("TLS setup failed: {}", err)))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(MakeRustlsConnect::new(tls_config))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_settings() -> WarehouseConfig {
        WarehouseConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            database: "dev".to_string(),
            user: "analyst".to_string(),
            password: Some("hunter2".to_string()),
            sslmode: SslModeSetting::Disable,
            connect_timeout_sec: 1,
            ..WarehouseConfig::default()
        }
    }

    #[test]
    fn test_target_never_contains_password() {
        let connector = PgConnector::new(&plain_settings()).unwrap();
        assert_eq!(connector.target(), "analyst@127.0.0.1:1/dev");
        assert!(!connector.target().contains("hunter2"));
    }

    #[test]
    fn test_read_only_flag_defaults_off() {
        let connector = PgConnector::new(&plain_settings()).unwrap();
        assert!(!connector.is_read_only());
        assert!(connector.with_read_only(true).is_read_only());
    }

    #[tokio::test]
    async fn test_unreachable_warehouse_is_connection_error() {
        let connector = PgConnector::new(&plain_settings()).unwrap();
        let err = match connector.connect().await {
            Ok(_) => panic!("nothing listens on port 1"),
            Err(err) => err,
        };
        assert!(matches!(err, BridgeError::Connection(_)));
        assert!(!err.to_string().contains("hunter2"));
    }

    #[test]
    fn test_missing_root_cert_file_is_config_error() {
        let mut settings = plain_settings();
        settings.sslmode = SslModeSetting::Require;
        settings.ssl_root_cert = Some("/nonexistent/root.pem".into());
        assert!(matches!(
            PgConnector::new(&settings),
            Err(BridgeError::Config(_))
        ));
    }
}
