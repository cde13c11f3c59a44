//! FTP sessions over suppaftp
//!
//! `suppaftp::FtpStream` is blocking, so every command runs on the blocking
//! thread pool. The stream is moved into the blocking task and handed back
//! afterwards. A stream lost to a connection error or a panicked task is
//! replaced by a fresh login on the next command.

use std::io::Cursor;
use std::net::ToSocketAddrs;
use std::time::Duration;

use async_trait::async_trait;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream, Mode, Status};
use tracing::{debug, warn};

use super::{entry_name, TransportConnector, TransportError, TransportSession};

pub const DEFAULT_FTP_PORT: u16 = 21;
pub const DEFAULT_FTP_TIMEOUT_SECS: u64 = 30;

/// Connection settings for the transfer server
#[derive(Debug, Clone)]
pub struct FtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Connect, read and write timeout
    pub timeout: Duration,
}

impl Default for FtpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_FTP_PORT,
            username: "anonymous".to_string(),
            password: String::new(),
            timeout: Duration::from_secs(DEFAULT_FTP_TIMEOUT_SECS),
        }
    }
}

/// Opens authenticated [`FtpSession`]s
#[derive(Debug, Clone)]
pub struct FtpConnector {
    config: FtpConfig,
}

impl FtpConnector {
    pub fn new(config: FtpConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TransportConnector for FtpConnector {
    type Session = FtpSession;

    async fn connect(&self) -> Result<FtpSession, TransportError> {
        let config = self.config.clone();
        let stream = tokio::task::spawn_blocking(move || connect_sync(&config))
            .await
            .map_err(|e| TransportError::Task(e.to_string()))??;

        Ok(FtpSession {
            config: self.config.clone(),
            stream: Some(stream),
            closed: false,
        })
    }
}

fn connect_sync(config: &FtpConfig) -> Result<FtpStream, TransportError> {
    debug!("Connecting to FTP server: {}:{}", config.host, config.port);

    let addr = (config.host.as_str(), config.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| TransportError::Connect(format!("cannot resolve {}", config.host)))?;

    let mut stream = FtpStream::connect_timeout(addr, config.timeout)?;
    stream.get_ref().set_read_timeout(Some(config.timeout))?;
    stream.get_ref().set_write_timeout(Some(config.timeout))?;

    // Extended passive mode works behind NAT
    stream.set_mode(Mode::ExtendedPassive);

    debug!("Logging in as: {}", config.username);
    stream.login(&config.username, &config.password)?;
    stream.transfer_type(FileType::Binary)?;

    Ok(stream)
}

/// One logged-in FTP control connection
pub struct FtpSession {
    config: FtpConfig,
    stream: Option<FtpStream>,
    closed: bool,
}

impl FtpSession {
    async fn run<T, F>(&mut self, op: F) -> Result<T, TransportError>
    where
        T: Send + 'static,
        F: FnOnce(&mut FtpStream) -> Result<T, TransportError> + Send + 'static,
    {
        if self.closed {
            return Err(TransportError::SessionClosed);
        }

        let stream = self.stream.take();
        let config = self.config.clone();
        let (stream, result) = tokio::task::spawn_blocking(move || {
            let mut stream = match stream {
                Some(stream) => stream,
                None => {
                    warn!("Reconnecting FTP session to {}:{}", config.host, config.port);
                    match connect_sync(&config) {
                        Ok(stream) => stream,
                        Err(e) => return (None, Err(e)),
                    }
                },
            };
            let result = op(&mut stream);
            (Some(stream), result)
        })
        .await
        .map_err(|e| TransportError::Task(e.to_string()))?;

        // A broken control connection is replaced on the next command
        if !matches!(result, Err(TransportError::Ftp(suppaftp::FtpError::ConnectionError(_)))) {
            self.stream = stream;
        }
        result
    }
}

#[async_trait]
impl TransportSession for FtpSession {
    async fn list(&mut self, dir: &str) -> Result<Vec<String>, TransportError> {
        let dir = dir.to_string();
        self.run(move |ftp| {
            let entries = match ftp.nlst(Some(dir.as_str())) {
                Ok(entries) => entries,
                // Many servers answer NLST on an empty directory with 450 or 550
                Err(e) if is_unavailable(&e) => {
                    return if directory_exists(ftp, &dir)? {
                        Ok(Vec::new())
                    } else {
                        Err(TransportError::NotFound(dir))
                    };
                },
                Err(e) => return Err(e.into()),
            };
            Ok(entries
                .iter()
                .map(|e| entry_name(e).to_string())
                .filter(|e| !e.is_empty())
                .collect())
        })
        .await
    }

    async fn retrieve(&mut self, path: &str) -> Result<Vec<u8>, TransportError> {
        let path = path.to_string();
        self.run(move |ftp| {
            let cursor = ftp.retr_as_buffer(&path).map_err(|e| missing_as_not_found(e, &path))?;
            Ok(cursor.into_inner())
        })
        .await
    }

    async fn store(&mut self, path: &str, data: Vec<u8>) -> Result<(), TransportError> {
        let path = path.to_string();
        self.run(move |ftp| {
            let written = ftp.put_file(&path, &mut Cursor::new(data))?;
            debug!("Stored {} bytes to {}", written, path);
            Ok(())
        })
        .await
    }

    async fn rename(&mut self, from: &str, to: &str) -> Result<(), TransportError> {
        let (from, to) = (from.to_string(), to.to_string());
        self.run(move |ftp| Ok(ftp.rename(&from, &to)?)).await
    }

    async fn delete(&mut self, path: &str) -> Result<(), TransportError> {
        let path = path.to_string();
        self.run(move |ftp| ftp.rm(&path).map_err(|e| missing_as_not_found(e, &path)))
            .await
    }

    async fn make_dir(&mut self, path: &str) -> Result<(), TransportError> {
        let path = path.to_string();
        self.run(move |ftp| {
            let absolute = path.starts_with('/');
            let mut current = String::new();
            for part in path.split('/').filter(|p| !p.is_empty()) {
                if absolute || !current.is_empty() {
                    current.push('/');
                }
                current.push_str(part);
                // 550 when the directory already exists
                if let Err(e) = ftp.mkdir(&current) {
                    debug!("MKD {} not applied: {}", current, e);
                }
            }
            Ok(())
        })
        .await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };

        tokio::task::spawn_blocking(move || {
            if let Err(e) = stream.quit() {
                warn!("Failed to quit FTP session gracefully: {}", e);
            }
        })
        .await
        .map_err(|e| TransportError::Task(e.to_string()))
    }
}

/// 450 or 550: the path is missing or the server has nothing to send
fn is_unavailable(err: &FtpError) -> bool {
    matches!(
        err,
        FtpError::UnexpectedResponse(response)
            if matches!(response.status, Status::FileUnavailable | Status::RequestFileActionIgnored)
    )
}

fn missing_as_not_found(err: FtpError, path: &str) -> TransportError {
    match err {
        FtpError::UnexpectedResponse(ref response) if response.status == Status::FileUnavailable => {
            TransportError::NotFound(path.to_string())
        },
        other => other.into(),
    }
}

/// Probe `dir` with CWD, then return to the previous working directory
fn directory_exists(ftp: &mut FtpStream, dir: &str) -> Result<bool, TransportError> {
    let home = ftp.pwd()?;
    match ftp.cwd(dir) {
        Ok(()) => {
            ftp.cwd(&home)?;
            Ok(true)
        },
        Err(e) if is_unavailable(&e) => Ok(false),
        Err(e) => Err(e.into()),
    }
}
