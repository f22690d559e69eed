use std::{
    net::{Shutdown, TcpStream},
    path::PathBuf,
    time::Duration,
};

use anyhow::{Context, Result};
use ssh2::Session;
use ssh2_config::HostParams;
use tracing::{debug, info};

use crate::{
    check,
    remote::{
        error::{ConnectError, TransportError},
        transport::{Connector, ExecOutput, FileChannel, Transport},
    },
};

use self::{
    connect::{authenticate, configure_session, try_connection},
    transfer::SftpChannel,
};

mod connect;
pub mod exec;
pub mod transfer;

/// Everything needed to open a session, resolved once at startup.
#[derive(Debug, Clone)]
pub struct SSHTarget {
    pub hostname: String,
    pub user: String,
    pub identity_file: Option<PathBuf>,
    pub passphrase: Option<String>,
    pub timeout: Duration,
    pub params: HostParams,
}

impl SSHTarget {
    pub fn address(&self) -> String {
        let host = self.params.host_name.as_deref().unwrap_or(&self.hostname);
        if host.contains(':') {
            check!(
                self.params.port.is_none(),
                "Port {:?} is ignored, because hostname seems to contain port (it has ':')",
                self.params.port
            );
            host.to_string()
        } else {
            format!("{}:{}", host, self.params.port.unwrap_or(22))
        }
    }
}

pub struct SSHSession {
    session: Session,
    socket: TcpStream,
    peer: String,
    timeout: Duration,
}

impl SSHSession {
    pub fn open(target: &SSHTarget) -> Result<Self> {
        let address = target.address();
        let stream = try_connection(&address, target.timeout)
            .with_context(|| format!("Could not connect to {address}"))?;
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| address.clone());

        let socket = stream
            .try_clone()
            .context("Could not keep a handle on the connection")?;

        let mut session = Session::new().context("Could not create session")?;
        configure_session(&mut session, &target.params);
        session.set_tcp_stream(stream);
        session
            .handshake()
            .with_context(|| format!("SSH handshake with {peer} failed"))?;

        authenticate(&session, target)?;
        session.set_timeout(target.timeout.as_millis().min(u32::MAX as u128) as u32);

        if let Some(banner) = session.banner() {
            debug!(%peer, "banner: {banner}");
        }

        Ok(Self {
            session,
            socket,
            peer,
            timeout: target.timeout,
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

impl Transport for SSHSession {
    fn exec(&self, line: &str) -> Result<ExecOutput, TransportError> {
        exec::execute(&self.session, line, self.timeout)
    }

    fn open_files(&self) -> Result<Box<dyn FileChannel>, TransportError> {
        Ok(Box::new(SftpChannel::new(self.session.sftp()?)))
    }

    fn close(&self) {
        if let Err(err) = self.session.disconnect(None, "devsync closing", None) {
            debug!(peer = %self.peer, "disconnect failed: {err}");
        }
    }

    /// Shut the socket down under whatever call is blocked on it. A disconnect would
    /// wait behind that call on the session lock.
    fn abort(&self) {
        if let Err(err) = self.socket.shutdown(Shutdown::Both) {
            debug!(peer = %self.peer, "socket shutdown failed: {err}");
        }
    }
}

pub struct SSHConnector {
    target: SSHTarget,
}

impl SSHConnector {
    pub fn new(target: SSHTarget) -> Self {
        Self { target }
    }
}

impl Connector for SSHConnector {
    fn connect(&self, tag: &str) -> Result<Box<dyn Transport>, ConnectError> {
        let session = SSHSession::open(&self.target).map_err(|err| ConnectError::new(tag, err))?;
        info!(peer = session.peer(), tag, "connected");

        Ok(Box::new(session))
    }
}
