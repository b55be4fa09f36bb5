//! socket establishment: address resolution, transport setup and tls
//! negotiation, delegating the protocol startup to the session module.

use core::net::SocketAddr;

use std::{io, sync::Arc};

use postgres_protocol::message::frontend;
use tokio::sync::mpsc::unbounded_channel;
use xitca_io::{
    bytes::{Buf, BytesMut},
    io::{AsyncIo, Interest},
    net::TcpStream,
};

use crate::{
    config::{Config, Host, MissingOption, SslMode},
    error::{Error, FeatureError, unexpected_eof_err},
    session::{Addr, SessionInfo},
};

use super::{
    Driver,
    generic::GenericDriver,
    request::{DriverTx, Shared},
};

/// opens a connection for the configuration, performing the protocol startup
/// on it. every configured host is tried in order until one succeeds.
pub(crate) async fn establish(cfg: &Config, shared: Arc<Shared>) -> Result<(DriverTx, SessionInfo, Driver), Error> {
    let hosts = cfg.get_hosts();
    if hosts.is_empty() {
        return Err(MissingOption::Host.into());
    }

    let ports = cfg.get_ports();
    let mut err = None;
    for (idx, host) in hosts.iter().enumerate() {
        let port = match ports {
            [] => 5432,
            [port] => *port,
            ports => *ports.get(idx).ok_or(MissingOption::Port)?,
        };
        match connect_host(host, port, cfg, shared.clone()).await {
            Ok(established) => return Ok(established),
            Err(e) => err = Some(e),
        }
    }

    Err(err.expect("hosts is not empty so at least one attempt ran"))
}

async fn connect_host(
    host: &Host,
    port: u16,
    cfg: &Config,
    shared: Arc<Shared>,
) -> Result<(DriverTx, SessionInfo, Driver), Error> {
    match host {
        Host::Tcp(host) => {
            let (mut io, addr) = connect_tcp(host, port).await?;
            apply_keepalive(&io, cfg)?;
            if should_connect_tls(&mut io, cfg.get_ssl_mode()).await? {
                #[cfg(feature = "tls")]
                {
                    let (io, end_point) = super::tls::connect_tls(io, host, cfg).await?;
                    let addr = Addr::Tcp(host.as_str().into(), addr);
                    prepare(io, addr, end_point, cfg, shared).await.map(
                        |(tx, info, drv)| (tx, info, Driver::Tls(drv)),
                    )
                }
                #[cfg(not(feature = "tls"))]
                {
                    Err(FeatureError::Tls.into())
                }
            } else {
                let addr = Addr::Tcp(host.as_str().into(), addr);
                prepare(io, addr, None, cfg, shared)
                    .await
                    .map(|(tx, info, drv)| (tx, info, Driver::Tcp(drv)))
            }
        }
        #[cfg(not(unix))]
        Host::Unix(_) => Err(crate::error::SystemError::Unix.into()),
        #[cfg(unix)]
        Host::Unix(dir) => {
            let path = dir.join(format!(".s.PGSQL.{port}"));
            let mut io = xitca_io::net::UnixStream::connect(&path).await?;

            if let Some(user) = cfg.get_require_peer_user() {
                verify_peer_user(&io, user)?;
            }

            if should_connect_tls(&mut io, cfg.get_ssl_mode()).await? {
                #[cfg(feature = "tls")]
                {
                    let host: Box<str> = dir.to_string_lossy().into();
                    let (io, end_point) = super::tls::connect_tls(io, &host, cfg).await?;
                    let addr = Addr::Unix(path);
                    prepare(io, addr, end_point, cfg, shared).await.map(
                        |(tx, info, drv)| (tx, info, Driver::UnixTls(drv)),
                    )
                }
                #[cfg(not(feature = "tls"))]
                {
                    Err(FeatureError::Tls.into())
                }
            } else {
                let addr = Addr::Unix(path);
                prepare(io, addr, None, cfg, shared)
                    .await
                    .map(|(tx, info, drv)| (tx, info, Driver::Unix(drv)))
            }
        }
    }
}

/// opens a fresh socket to the peer of `info` and fires a cancel request for
/// its backend process.
pub(crate) async fn cancel(info: &crate::session::SessionInfo) -> Result<(), Error> {
    let mut buf = BytesMut::new();
    frontend::cancel_request(info.process_id, info.secret_key, &mut buf);

    match &info.addr {
        crate::session::Addr::Tcp(_host, addr) => {
            let mut io = TcpStream::connect(*addr).await?;
            let _ = io.set_nodelay(true);
            if should_connect_tls(&mut io, info.ssl_mode).await? {
                #[cfg(feature = "tls")]
                {
                    let (mut io, _) = super::tls::connect_tls(io, _host, &Config::default()).await?;
                    return write_all(&mut io, buf).await;
                }
                #[cfg(not(feature = "tls"))]
                {
                    return Err(FeatureError::Tls.into());
                }
            }
            write_all(&mut io, buf).await
        }
        #[cfg(unix)]
        crate::session::Addr::Unix(path) => {
            let mut io = xitca_io::net::UnixStream::connect(path).await?;
            write_all(&mut io, buf).await
        }
    }
}

async fn write_all<Io>(io: &mut Io, mut buf: BytesMut) -> Result<(), Error>
where
    Io: AsyncIo,
{
    while !buf.is_empty() {
        match io.write(&buf) {
            Ok(0) => return Err(unexpected_eof_err().into()),
            Ok(n) => buf.advance(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                io.ready(Interest::WRITABLE).await?;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

async fn connect_tcp(host: &str, port: u16) -> Result<(TcpStream, SocketAddr), Error> {
    let addrs = tokio::net::lookup_host((host, port)).await?;

    let mut err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                return Ok((stream, addr));
            }
            Err(e) => err = Some(e),
        }
    }

    Err(err
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "host resolved to no address"))
        .into())
}

async fn prepare<Io>(
    io: Io,
    addr: Addr,
    tls_server_end_point: Option<Vec<u8>>,
    cfg: &Config,
    shared: Arc<Shared>,
) -> Result<(DriverTx, SessionInfo, GenericDriver<Io>), Error>
where
    Io: AsyncIo + Send,
{
    let (tx, rx) = unbounded_channel();
    let mut drv = GenericDriver::new(io, rx, shared.clone());
    let info = crate::session::prepare_session(&mut drv, cfg, addr, tls_server_end_point, &shared).await?;
    Ok((DriverTx::new(tx, shared), info, drv))
}

#[cfg(unix)]
fn apply_keepalive(io: &TcpStream, cfg: &Config) -> io::Result<()> {
    if !cfg.get_keepalives() {
        return Ok(());
    }
    let mut keepalive = socket2::TcpKeepalive::new().with_time(cfg.get_keepalives_idle());
    if let Some(interval) = cfg.get_keepalives_interval() {
        keepalive = keepalive.with_interval(interval);
    }
    if let Some(retries) = cfg.get_keepalives_retries() {
        keepalive = keepalive.with_retries(retries);
    }
    socket2::SockRef::from(io).set_tcp_keepalive(&keepalive)
}

#[cfg(not(unix))]
fn apply_keepalive(_: &TcpStream, _: &Config) -> io::Result<()> {
    Ok(())
}

// the unix socket peer must run as the required operating system user.
#[cfg(unix)]
fn verify_peer_user(io: &xitca_io::net::UnixStream, user: &str) -> Result<(), Error> {
    use crate::error::AuthenticationError;

    let uid = io.peer_cred()?.uid();
    match resolve_uid(user) {
        Some(expected) if expected == uid => Ok(()),
        _ => Err(AuthenticationError::PeerUserMismatch.into()),
    }
}

// user name to uid through the passwd database. nsswitch sources beyond the
// passwd file are not consulted.
#[cfg(unix)]
fn resolve_uid(user: &str) -> Option<u32> {
    let passwd = std::fs::read_to_string("/etc/passwd").ok()?;
    passwd.lines().find_map(|line| {
        let mut fields = line.split(':');
        (fields.next()? == user).then(|| fields.nth(1)?.parse().ok())?
    })
}

async fn should_connect_tls<Io>(io: &mut Io, ssl_mode: SslMode) -> Result<bool, Error>
where
    Io: AsyncIo,
{
    match ssl_mode {
        SslMode::Disable => Ok(false),
        mode => {
            if cfg!(not(feature = "tls")) && mode == SslMode::Prefer {
                // downgrading is allowed. skip the round trip the answer of
                // which could not be acted on.
                return Ok(false);
            }
            match (query_tls_availability(io).await?, mode) {
                (false, SslMode::Require) => Err(FeatureError::Tls.into()),
                (available, _) => Ok(available),
            }
        }
    }
}

async fn query_tls_availability<Io>(io: &mut Io) -> io::Result<bool>
where
    Io: AsyncIo,
{
    let mut buf = BytesMut::new();
    frontend::ssl_request(&mut buf);

    while !buf.is_empty() {
        match io.write(&buf) {
            Ok(0) => return Err(unexpected_eof_err()),
            Ok(n) => buf.advance(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                io.ready(Interest::WRITABLE).await?;
            }
            Err(e) => return Err(e),
        }
    }

    let mut buf = [0];
    loop {
        match io.read(&mut buf) {
            Ok(0) => return Err(unexpected_eof_err()),
            Ok(_) => return Ok(buf[0] == b'S'),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                io.ready(Interest::READABLE).await?;
            }
            Err(e) => return Err(e),
        }
    }
}
