//! SFTP sessions over `ssh2`.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use ssh2::{ErrorCode, Session, Sftp};

use crate::error::{self, RemoteError};
use crate::session::{RemoteSession, SessionFactory};

const SFTP_NO_SUCH_FILE: i32 = 2;
const DIR_MODE: i32 = 0o755;

/// Credentials for one endpoint.
#[derive(Clone, PartialEq, Eq)]
pub enum SftpAuth {
    Password(String),
    PrivateKey {
        path: PathBuf,
        passphrase: Option<String>,
    },
}

impl std::fmt::Debug for SftpAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(***)"),
            Self::PrivateKey { path, .. } => {
                f.debug_struct("PrivateKey").field("path", path).finish_non_exhaustive()
            }
        }
    }
}

/// Connection settings for one SFTP endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SftpEndpoint {
    /// Label used in logs and errors (`origin`, `destination`).
    pub name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub auth: SftpAuth,
    /// Applies to the TCP connect and to every blocking SSH call.
    pub timeout: Duration,
}

/// Opens authenticated SFTP sessions for one endpoint.
pub struct SftpSessionFactory {
    endpoint: SftpEndpoint,
}

impl SftpSessionFactory {
    #[must_use]
    pub fn new(endpoint: SftpEndpoint) -> Self {
        Self { endpoint }
    }

    fn connect_error(&self, message: impl Into<String>) -> RemoteError {
        RemoteError::Connect {
            endpoint: self.endpoint.name.clone(),
            message: message.into(),
        }
    }

    fn open_tcp(&self) -> error::Result<TcpStream> {
        let ep = &self.endpoint;
        let addrs = (ep.host.as_str(), ep.port)
            .to_socket_addrs()
            .map_err(|e| self.connect_error(format!("resolve {}:{}: {e}", ep.host, ep.port)))?;
        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, ep.timeout) {
                Ok(tcp) => {
                    tcp.set_read_timeout(Some(ep.timeout))
                        .and_then(|()| tcp.set_write_timeout(Some(ep.timeout)))
                        .map_err(|e| self.connect_error(e.to_string()))?;
                    return Ok(tcp);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(self.connect_error(last_err.map_or_else(
            || format!("no address for {}:{}", ep.host, ep.port),
            |e| e.to_string(),
        )))
    }

    fn authenticate(&self, session: &Session) -> error::Result<()> {
        let ep = &self.endpoint;
        let result = match &ep.auth {
            SftpAuth::Password(password) => session.userauth_password(&ep.user, password),
            SftpAuth::PrivateKey { path, passphrase } => {
                session.userauth_pubkey_file(&ep.user, None, path, passphrase.as_deref())
            }
        };
        let auth_error = |message: String| RemoteError::Auth {
            endpoint: ep.name.clone(),
            message,
        };
        result.map_err(|e| auth_error(e.message().to_owned()))?;
        if !session.authenticated() {
            return Err(auth_error(format!("user {} not authenticated", ep.user)));
        }
        Ok(())
    }
}

impl SessionFactory for SftpSessionFactory {
    fn endpoint(&self) -> &str {
        &self.endpoint.name
    }

    fn connect(&self) -> error::Result<Box<dyn RemoteSession>> {
        let tcp = self.open_tcp()?;
        let mut session = Session::new().map_err(|e| self.connect_error(e.message()))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(u32::try_from(self.endpoint.timeout.as_millis()).unwrap_or(u32::MAX));
        session
            .handshake()
            .map_err(|e| self.connect_error(format!("handshake: {}", e.message())))?;
        self.authenticate(&session)?;
        let sftp = session
            .sftp()
            .map_err(|e| self.connect_error(format!("sftp subsystem: {}", e.message())))?;
        tracing::debug!(
            endpoint = %self.endpoint.name,
            host = %self.endpoint.host,
            port = self.endpoint.port,
            "SFTP session established"
        );
        Ok(Box::new(SftpSession {
            _session: session,
            sftp,
        }))
    }
}

struct SftpSession {
    // Keeps the SSH transport alive for as long as the SFTP channel.
    _session: Session,
    sftp: Sftp,
}

/// Map an `ssh2` error on `path` to the transport taxonomy.
fn map_error(path: &str, err: &ssh2::Error) -> RemoteError {
    match err.code() {
        ErrorCode::SFTP(SFTP_NO_SUCH_FILE) => RemoteError::NotFound(path.to_owned()),
        ErrorCode::SFTP(code) => {
            RemoteError::protocol(path, format!("{} (sftp status {code})", err.message()))
        }
        ErrorCode::Session(_) => RemoteError::io(path, io::Error::other(err.message().to_owned())),
    }
}

impl RemoteSession for SftpSession {
    fn open_read(&mut self, path: &str) -> error::Result<Box<dyn Read + Send>> {
        let file = self
            .sftp
            .open(Path::new(path))
            .map_err(|e| map_error(path, &e))?;
        Ok(Box::new(file))
    }

    fn open_write(&mut self, path: &str) -> error::Result<Box<dyn Write + Send>> {
        let file = self
            .sftp
            .create(Path::new(path))
            .map_err(|e| map_error(path, &e))?;
        Ok(Box::new(file))
    }

    fn exists(&mut self, path: &str) -> error::Result<bool> {
        match self.sftp.stat(Path::new(path)) {
            Ok(_) => Ok(true),
            Err(e) => match map_error(path, &e) {
                RemoteError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    fn mkdir(&mut self, path: &str) -> error::Result<()> {
        self.sftp
            .mkdir(Path::new(path), DIR_MODE)
            .map_err(|e| map_error(path, &e))
    }

    fn remove(&mut self, path: &str) -> error::Result<()> {
        self.sftp
            .unlink(Path::new(path))
            .map_err(|e| map_error(path, &e))
    }

    fn ping(&mut self) -> error::Result<()> {
        self.sftp
            .realpath(Path::new("."))
            .map(|_| ())
            .map_err(|e| map_error(".", &e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(port: u16) -> SftpEndpoint {
        SftpEndpoint {
            name: "origin".into(),
            host: "127.0.0.1".into(),
            port,
            user: "svc".into(),
            auth: SftpAuth::Password("secret".into()),
            timeout: Duration::from_millis(500),
        }
    }

    #[test]
    fn debug_hides_password() {
        let rendered = format!("{:?}", endpoint(22));
        assert!(!rendered.contains("secret"), "got: {rendered}");
        assert!(rendered.contains("Password(***)"));
    }

    #[test]
    fn no_such_file_maps_to_not_found() {
        let err = ssh2::Error::new(ErrorCode::SFTP(SFTP_NO_SUCH_FILE), "no such file");
        assert!(matches!(map_error("/a", &err), RemoteError::NotFound(_)));

        let err = ssh2::Error::new(ErrorCode::SFTP(3), "permission denied");
        assert!(matches!(map_error("/a", &err), RemoteError::Protocol { .. }));

        let err = ssh2::Error::new(ErrorCode::Session(-9), "timed out");
        let mapped = map_error("/a", &err);
        assert!(mapped.is_transient());
        assert!(mapped.breaks_session());
    }

    #[test]
    fn refused_connection_is_connect_error() {
        // Port 1 is reserved and closed on test hosts.
        let factory = SftpSessionFactory::new(endpoint(1));
        let err = factory.connect().err().expect("connect must fail");
        assert!(matches!(err, RemoteError::Connect { .. }), "got: {err}");
        assert!(err.is_transient());
    }
}
