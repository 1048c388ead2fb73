//! SSH command execution and file transfer over ssh2.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use ssh2::Session;
use tokio::task;

use crate::error::{DriverError, DriverResult};
use crate::types::{CmdOutcome, SshTarget, TransferOutcome};

/// Shell and file-transfer collaborator. Errors are transport-level and
/// retried by the bridge; definitive failures are reported through the
/// outcome's `failed` flag instead.
#[async_trait]
pub trait SshTransport: Send + Sync {
    async fn run(&self, target: &SshTarget, command: &str) -> DriverResult<CmdOutcome>;

    async fn upload(
        &self,
        target: &SshTarget,
        local: &str,
        remote: &str,
    ) -> DriverResult<TransferOutcome>;

    async fn download(
        &self,
        target: &SshTarget,
        remote: &str,
        local: &str,
    ) -> DriverResult<TransferOutcome>;
}

/// ssh2-backed transport. Each call opens a fresh session: early-boot
/// guests drop half-open connections, so nothing is pooled.
pub struct Ssh2Transport {
    connect_timeout: Duration,
}

impl Ssh2Transport {
    pub fn new() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
        }
    }
}

impl Default for Ssh2Transport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SshTransport for Ssh2Transport {
    async fn run(&self, target: &SshTarget, command: &str) -> DriverResult<CmdOutcome> {
        let target = target.clone();
        let command = command.to_string();
        let connect_timeout = self.connect_timeout;
        task::spawn_blocking(move || run_blocking(&target, &command, connect_timeout))
            .await
            .map_err(|e| DriverError::other(format!("ssh worker join error: {e}")))?
    }

    async fn upload(
        &self,
        target: &SshTarget,
        local: &str,
        remote: &str,
    ) -> DriverResult<TransferOutcome> {
        let target = target.clone();
        let local = local.to_string();
        let remote = remote.to_string();
        let connect_timeout = self.connect_timeout;
        task::spawn_blocking(move || upload_blocking(&target, &local, &remote, connect_timeout))
            .await
            .map_err(|e| DriverError::other(format!("ssh worker join error: {e}")))?
    }

    async fn download(
        &self,
        target: &SshTarget,
        remote: &str,
        local: &str,
    ) -> DriverResult<TransferOutcome> {
        let target = target.clone();
        let remote = remote.to_string();
        let local = local.to_string();
        let connect_timeout = self.connect_timeout;
        task::spawn_blocking(move || download_blocking(&target, &remote, &local, connect_timeout))
            .await
            .map_err(|e| DriverError::other(format!("ssh worker join error: {e}")))?
    }
}

fn open_session(target: &SshTarget, connect_timeout: Duration) -> DriverResult<Session> {
    let credentials = &target.credentials;
    if credentials.password.is_none() && credentials.key_path.is_none() {
        return Err(DriverError::config(
            "ssh credentials need a password or a key path",
        ));
    }

    let address = format!("{}:{}", target.host, credentials.port);
    debug!("opening ssh session to {address}");
    let stream = match address.parse::<SocketAddr>() {
        Ok(addr) => TcpStream::connect_timeout(&addr, connect_timeout),
        Err(_) => TcpStream::connect(&address),
    }
    .map_err(|e| DriverError::connection(format!("cannot reach {address}: {e}")))?;

    let mut session = Session::new()
        .map_err(|e| DriverError::other(format!("ssh session init failed: {e}")))?;
    session.set_tcp_stream(stream);
    session
        .handshake()
        .map_err(|e| DriverError::connection(format!("ssh handshake with {address} failed: {e}")))?;

    if let Some(ref key_path) = credentials.key_path {
        session
            .userauth_pubkey_file(&credentials.username, None, Path::new(key_path), None)
            .map_err(|e| {
                DriverError::auth(format!(
                    "ssh key authentication for '{}' failed: {e}",
                    credentials.username
                ))
            })?;
    } else if let Some(ref password) = credentials.password {
        session
            .userauth_password(&credentials.username, password)
            .map_err(|e| {
                DriverError::auth(format!(
                    "ssh password authentication for '{}' failed: {e}",
                    credentials.username
                ))
            })?;
    }
    Ok(session)
}

fn run_blocking(
    target: &SshTarget,
    command: &str,
    connect_timeout: Duration,
) -> DriverResult<CmdOutcome> {
    let session = open_session(target, connect_timeout)?;
    let mut channel = session
        .channel_session()
        .map_err(|e| DriverError::connection(format!("cannot open ssh channel: {e}")))?;
    channel
        .exec(command)
        .map_err(|e| DriverError::connection(format!("cannot execute command: {e}")))?;

    let mut stdout = String::new();
    channel
        .read_to_string(&mut stdout)
        .map_err(|e| DriverError::connection(format!("cannot read command output: {e}")))?;
    let mut stderr = String::new();
    channel
        .stderr()
        .read_to_string(&mut stderr)
        .map_err(|e| DriverError::connection(format!("cannot read command stderr: {e}")))?;
    channel
        .wait_close()
        .map_err(|e| DriverError::connection(format!("ssh channel close failed: {e}")))?;
    let exit_code = channel
        .exit_status()
        .map_err(|e| DriverError::other(format!("cannot read exit status: {e}")))?;

    Ok(CmdOutcome {
        exit_code,
        failed: exit_code != 0,
        stdout,
        stderr,
    })
}

fn upload_blocking(
    target: &SshTarget,
    local: &str,
    remote: &str,
    connect_timeout: Duration,
) -> DriverResult<TransferOutcome> {
    let data = match std::fs::read(local) {
        Ok(data) => data,
        Err(e) => {
            return Ok(TransferOutcome {
                failed: true,
                message: Some(format!("cannot read local file '{local}': {e}")),
            })
        }
    };
    let session = open_session(target, connect_timeout)?;
    let sftp = session
        .sftp()
        .map_err(|e| DriverError::connection(format!("cannot open sftp channel: {e}")))?;
    let mut file = match sftp.create(Path::new(remote)) {
        Ok(file) => file,
        Err(e) => {
            return Ok(TransferOutcome {
                failed: true,
                message: Some(format!("cannot create remote file '{remote}': {e}")),
            })
        }
    };
    file.write_all(&data)
        .map_err(|e| DriverError::connection(format!("write to '{remote}' interrupted: {e}")))?;
    Ok(TransferOutcome {
        failed: false,
        message: None,
    })
}

fn download_blocking(
    target: &SshTarget,
    remote: &str,
    local: &str,
    connect_timeout: Duration,
) -> DriverResult<TransferOutcome> {
    let session = open_session(target, connect_timeout)?;
    let sftp = session
        .sftp()
        .map_err(|e| DriverError::connection(format!("cannot open sftp channel: {e}")))?;
    let mut file = match sftp.open(Path::new(remote)) {
        Ok(file) => file,
        Err(e) => {
            return Ok(TransferOutcome {
                failed: true,
                message: Some(format!("cannot open remote file '{remote}': {e}")),
            })
        }
    };
    let mut data = Vec::new();
    file.read_to_end(&mut data)
        .map_err(|e| DriverError::connection(format!("read of '{remote}' interrupted: {e}")))?;
    match std::fs::write(local, &data) {
        Ok(()) => Ok(TransferOutcome {
            failed: false,
            message: None,
        }),
        Err(e) => Ok(TransferOutcome {
            failed: true,
            message: Some(format!("cannot write local file '{local}': {e}")),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DriverErrorKind;
    use crate::types::SshCredentials;

    #[test]
    fn test_credentials_are_checked_before_connecting() {
        let target = SshTarget {
            host: "192.0.2.1".into(),
            credentials: SshCredentials {
                username: "root".into(),
                password: None,
                key_path: None,
                port: 22,
            },
        };
        let err = open_session(&target, Duration::from_millis(10)).err().unwrap();
        assert_eq!(err.kind, DriverErrorKind::Config);
    }

    #[test]
    fn test_unreachable_host_is_a_connection_error() {
        let target = SshTarget {
            // TEST-NET-1, guaranteed unroutable
            host: "192.0.2.1".into(),
            credentials: SshCredentials {
                username: "root".into(),
                password: Some("toor".into()),
                key_path: None,
                port: 22,
            },
        };
        let err = open_session(&target, Duration::from_millis(50)).err().unwrap();
        assert_eq!(err.kind, DriverErrorKind::Connection);
    }
}