use std::{
    io,
    net::{TcpStream, ToSocketAddrs},
    path::PathBuf,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use ssh2::{MethodType, Session};
use ssh2_config::HostParams;
use tracing::debug;

use super::SSHTarget;
use crate::check;

const DEFAULT_KEYS: [&str; 3] = ["id_ed25519", "id_rsa", "id_ecdsa"];

pub(super) fn try_connection(host: &str, timeout: Duration) -> io::Result<TcpStream> {
    let mut last_error = None;

    for addr in host.to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_error = Some(err),
        }
    }

    Err(last_error.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, format!("{host} did not resolve to any address"))
    }))
}

/// Key file first, then the agent, then the usual keys under `~/.ssh`.
pub(super) fn authenticate(session: &Session, target: &SSHTarget) -> Result<()> {
    if let Some(identity) = &target.identity_file {
        session
            .userauth_pubkey_file(&target.user, None, identity, target.passphrase.as_deref())
            .with_context(|| format!("Authentication with {} failed", identity.display()))?;
        return Ok(());
    }

    match session.userauth_agent(&target.user) {
        Ok(()) if session.authenticated() => return Ok(()),
        Ok(()) => {}
        Err(err) => debug!("ssh-agent authentication failed: {err}"),
    }

    let home = dirs::home_dir().context("Could not locate the home directory")?;
    let candidates: Vec<PathBuf> = DEFAULT_KEYS
        .iter()
        .map(|name| home.join(".ssh").join(name))
        .filter(|path| path.exists())
        .collect();

    for key in &candidates {
        if session
            .userauth_pubkey_file(&target.user, None, key, target.passphrase.as_deref())
            .is_ok()
            && session.authenticated()
        {
            return Ok(());
        }
    }

    bail!(
        "Authentication failed for {}: no usable key (tried agent and {} key file(s))",
        target.user,
        candidates.len()
    )
}

// Used mostly the same logic to https://github.com/veeso/ssh2-config/blob/main/examples/client.rs
pub(super) fn configure_session(session: &mut Session, params: &HostParams) {
    if let Some(compress) = params.compression {
        session.set_compress(compress);
    }
    if params.tcp_keep_alive.unwrap_or(false) {
        if let Some(interval) = params.server_alive_interval {
            session.set_keepalive(true, interval.as_secs() as u32);
        }
    }

    macro_rules! report_if_fail {
        ($op: expr, $err: expr) => {{
            let operation = { $op };
            if let Err(err) = &operation {
                check!(false, "{}: {}", $err, err);
            }
        }};
    }

    // algos
    if let Some(algos) = params.kex_algorithms.as_deref() {
        report_if_fail!(
            session.method_pref(MethodType::Kex, algos.join(",").as_str()),
            "Could not set KEX algorithms"
        );
    }
    if let Some(algos) = params.host_key_algorithms.as_deref() {
        report_if_fail!(
            session.method_pref(MethodType::HostKey, algos.join(",").as_str()),
            "Could not set host key algorithms"
        );
    }
    if let Some(algos) = params.ciphers.as_deref() {
        report_if_fail!(
            session.method_pref(MethodType::CryptCs, algos.join(",").as_str()),
            "Could not set crypt algorithms (client-server)"
        );
        report_if_fail!(
            session.method_pref(MethodType::CryptSc, algos.join(",").as_str()),
            "Could not set crypt algorithms (server-client)"
        );
    }
    if let Some(algos) = params.mac.as_deref() {
        report_if_fail!(
            session.method_pref(MethodType::MacCs, algos.join(",").as_str()),
            "Could not set MAC algorithms (client-server)"
        );
        report_if_fail!(
            session.method_pref(MethodType::MacSc, algos.join(",").as_str()),
            "Could not set MAC algorithms (server-client)"
        )
    }
}
