use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};
use ssh2::{Channel, Session};
use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

use super::{ShellChannel, ShellSession, ShellTransport};
use crate::config::Credentials;
use crate::error::{PollError, PollResult};

const DEFAULT_SSH_PORT: u16 = 22;
const WRITE_RETRY_PAUSE: Duration = Duration::from_millis(10);
const CLOSE_TIMEOUT_MS: u32 = 1_000;

/// Password-authenticated SSH shells.
///
/// Host keys are not pinned; the fingerprint is logged at debug level so an
/// operator can compare it against the device.
#[derive(Debug, Clone, Copy, Default)]
pub struct SshTransport;

impl SshTransport {
    pub fn new() -> Self {
        Self
    }
}

impl ShellTransport for SshTransport {
    type Session = SshShell;

    fn open(
        &self,
        address: &str,
        credentials: &Credentials,
        connect_timeout: Duration,
    ) -> PollResult<SshShell> {
        let session = handshake_ssh(address, connect_timeout)?;
        match start_shell(&session, credentials) {
            Ok(channel) => {
                session.set_blocking(false);
                Ok(SshShell {
                    session,
                    channel,
                    write_timeout: connect_timeout,
                    closed: false,
                })
            }
            Err(err) => {
                session.disconnect(None, "shell setup failed", None).ok();
                Err(err)
            }
        }
    }
}

fn connection_error(context: &str, err: impl std::fmt::Display) -> PollError {
    PollError::Connection(format!("{context}: {err}"))
}

pub(crate) fn split_host_port(address: &str) -> (String, u16) {
    let trimmed = address.trim();
    if let Ok(addr) = trimmed.parse::<SocketAddr>() {
        return (addr.ip().to_string(), addr.port());
    }
    if let Ok(ip) = trimmed.parse::<IpAddr>() {
        return (ip.to_string(), DEFAULT_SSH_PORT);
    }
    if let Some((host, port)) = trimmed.rsplit_once(':') {
        if !host.contains(':') {
            if let Ok(port) = port.parse::<u16>() {
                return (host.to_string(), port);
            }
        }
    }
    (trimmed.to_string(), DEFAULT_SSH_PORT)
}

fn connect_tcp(address: &str, timeout: Duration) -> PollResult<TcpStream> {
    let (host, port) = split_host_port(address);
    let candidates: Vec<SocketAddr> = (host.as_str(), port)
        .to_socket_addrs()
        .map_err(|err| connection_error(&format!("failed to resolve {address}"), err))?
        .collect();
    let mut last_err = None;
    for candidate in candidates {
        match TcpStream::connect_timeout(&candidate, timeout) {
            Ok(tcp) => return Ok(tcp),
            Err(err) => last_err = Some(err),
        }
    }
    Err(match last_err {
        Some(err) => connection_error(&format!("failed to connect to {address}"), err),
        None => PollError::Connection(format!("{address} resolved to no addresses")),
    })
}

fn handshake_ssh(address: &str, connect_timeout: Duration) -> PollResult<Session> {
    let tcp = connect_tcp(address, connect_timeout)?;
    let mut session = Session::new().map_err(|err| connection_error("failed to create SSH session", err))?;
    session.set_timeout(timeout_millis(connect_timeout));
    session.set_tcp_stream(tcp);
    session
        .handshake()
        .map_err(|err| connection_error("SSH handshake failed", err))?;
    if let Some((host_key, _)) = session.host_key() {
        debug!(address, fingerprint = %fingerprint_sha256(host_key), "ssh host key");
    }
    Ok(session)
}

fn start_shell(session: &Session, credentials: &Credentials) -> PollResult<Channel> {
    session
        .userauth_password(&credentials.username, credentials.password())
        .map_err(|err| connection_error("SSH authentication failed", err))?;
    if !session.authenticated() {
        return Err(PollError::Connection("SSH authentication failed".to_string()));
    }
    let mut channel = session
        .channel_session()
        .map_err(|err| connection_error("failed to open SSH channel", err))?;
    channel
        .request_pty("vt100", None, None)
        .map_err(|err| connection_error("failed to request pty", err))?;
    channel
        .shell()
        .map_err(|err| connection_error("failed to start shell", err))?;
    Ok(channel)
}

fn timeout_millis(timeout: Duration) -> u32 {
    timeout.as_millis().min(u128::from(u32::MAX)) as u32
}

pub(crate) fn fingerprint_sha256(key: &[u8]) -> String {
    let digest = Sha256::digest(key);
    let b64 = STANDARD_NO_PAD.encode(digest);
    format!("SHA256:{b64}")
}

/// A live shell. Reads never block; writes retry until `write_timeout`.
pub struct SshShell {
    session: Session,
    channel: Channel,
    write_timeout: Duration,
    closed: bool,
}

impl ShellChannel for SshShell {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match self.channel.read(buf) {
            Ok(read) => Ok(Some(read)),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let deadline = Instant::now() + self.write_timeout;
        let mut written = 0;
        while written < bytes.len() {
            match self.channel.write(&bytes[written..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "shell channel accepted no data",
                    ))
                }
                Ok(count) => written += count,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "timed out writing to shell channel",
                        ));
                    }
                    thread::sleep(WRITE_RETRY_PAUSE);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

impl ShellSession for SshShell {
    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.session.set_blocking(true);
        self.session.set_timeout(CLOSE_TIMEOUT_MS);
        self.channel.close().ok();
        self.session.disconnect(None, "poll complete", None).ok();
    }
}

impl Drop for SshShell {
    fn drop(&mut self) {
        self.close();
    }
}
