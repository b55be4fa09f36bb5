//! session establishment on top of an opened socket: protocol startup,
//! authentication and target session attribute verification.

use core::net::SocketAddr;

use fallible_iterator::FallibleIterator;
use postgres_protocol::{
    authentication::{self, sasl},
    message::{backend, frontend},
};
use xitca_io::{bytes::BytesMut, io::AsyncIo};

use super::{
    config::{ChannelBinding, Config, SslMode, TargetSessionAttrs},
    driver::{generic::GenericDriver, request::Shared},
    error::{AuthenticationError, Error, FeatureError, InvalidState},
};

/// An asynchronous notification delivered by `LISTEN`/`NOTIFY`.
#[derive(Debug, Clone)]
pub struct Notification {
    pub process_id: i32,
    pub channel: Box<str>,
    pub payload: Box<str>,
}

/// address a session was established against.
#[derive(Debug, Clone)]
pub(crate) enum Addr {
    Tcp(Box<str>, SocketAddr),
    #[cfg(unix)]
    Unix(std::path::PathBuf),
}

#[derive(Debug, Clone)]
pub(crate) struct SessionInfo {
    pub(crate) process_id: i32,
    pub(crate) secret_key: i32,
    pub(crate) addr: Addr,
    pub(crate) ssl_mode: SslMode,
}

/// A token able to request cancellation of whatever query currently runs on
/// the session it was taken from.
///
/// The server provides no feedback about whether the attempt did anything;
/// cancellation is inherently racy. An error is only returned when the token
/// fails to reach the server.
#[derive(Debug, Clone)]
pub struct CancelToken {
    pub(crate) info: SessionInfo,
}

impl CancelToken {
    pub async fn cancel(self) -> Result<(), Error> {
        crate::driver::cancel(&self.info).await
    }
}

#[cold]
#[inline(never)]
pub(crate) async fn prepare_session<Io>(
    drv: &mut GenericDriver<Io>,
    cfg: &Config,
    addr: Addr,
    tls_server_end_point: Option<Vec<u8>>,
    shared: &Shared,
) -> Result<SessionInfo, Error>
where
    Io: AsyncIo + Send,
{
    let mut buf = BytesMut::new();

    auth(drv, cfg, tls_server_end_point, &mut buf).await?;

    let mut info = SessionInfo {
        process_id: 0,
        secret_key: 0,
        addr,
        ssl_mode: cfg.get_ssl_mode(),
    };

    loop {
        match drv.recv().await? {
            backend::Message::ReadyForQuery(_) => break,
            backend::Message::BackendKeyData(body) => {
                info.process_id = body.process_id();
                info.secret_key = body.secret_key();
            }
            backend::Message::ParameterStatus(body) => {
                let name = body.name()?.into();
                let value = body.value()?.to_string();
                shared.parameters.lock().unwrap().insert(name, value);
            }
            backend::Message::NoticeResponse(_) => {}
            _ => return Err(Error::unexpected()),
        }
    }

    verify_session_attrs(drv, cfg, &mut buf).await?;

    Ok(info)
}

#[cold]
#[inline(never)]
async fn auth<Io>(
    drv: &mut GenericDriver<Io>,
    cfg: &Config,
    tls_server_end_point: Option<Vec<u8>>,
    buf: &mut BytesMut,
) -> Result<(), Error>
where
    Io: AsyncIo + Send,
{
    let mut params = vec![("client_encoding", "UTF8")];
    if let Some(user) = cfg.get_user() {
        params.push(("user", user));
    }
    if let Some(dbname) = cfg.get_dbname() {
        params.push(("database", dbname));
    }
    if let Some(options) = cfg.get_options() {
        params.push(("options", options));
    }
    if let Some(application_name) = cfg.get_application_name() {
        params.push(("application_name", application_name));
    }

    frontend::startup_message(params, buf)?;
    let msg = buf.split();
    drv.send(msg).await?;

    loop {
        match drv.recv().await? {
            backend::Message::AuthenticationOk => return Ok(()),
            backend::Message::AuthenticationCleartextPassword => {
                let pass = cfg.get_password().ok_or(AuthenticationError::MissingPassWord)?;
                send_pass(drv, pass, buf).await?;
            }
            backend::Message::AuthenticationMd5Password(body) => {
                let pass = cfg.get_password().ok_or(AuthenticationError::MissingPassWord)?;
                let user = cfg
                    .get_user()
                    .ok_or(AuthenticationError::MissingUserName)?
                    .as_bytes();
                let pass = authentication::md5_hash(user, pass, body.salt());
                send_pass(drv, pass, buf).await?;
            }
            backend::Message::AuthenticationSasl(body) => {
                let pass = cfg.get_password().ok_or(AuthenticationError::MissingPassWord)?;

                let mut is_scram = false;
                let mut is_scram_plus = false;
                let mut mechanisms = body.mechanisms();

                while let Some(mechanism) = mechanisms.next()? {
                    match mechanism {
                        sasl::SCRAM_SHA_256 => is_scram = true,
                        sasl::SCRAM_SHA_256_PLUS => is_scram_plus = true,
                        _ => {}
                    }
                }

                let (channel_binding, mechanism) = match cfg.get_channel_binding() {
                    ChannelBinding::Disable => {
                        if is_scram {
                            (sasl::ChannelBinding::unrequested(), sasl::SCRAM_SHA_256)
                        } else {
                            return Err(AuthenticationError::UnsupportedMechanism.into());
                        }
                    }
                    ChannelBinding::Require => match (is_scram_plus, tls_server_end_point.clone()) {
                        (true, Some(buf)) => {
                            (sasl::ChannelBinding::tls_server_end_point(buf), sasl::SCRAM_SHA_256_PLUS)
                        }
                        _ => return Err(AuthenticationError::ChannelBinding.into()),
                    },
                    ChannelBinding::Prefer => match (is_scram_plus, tls_server_end_point.clone(), is_scram) {
                        (true, Some(buf), _) => {
                            (sasl::ChannelBinding::tls_server_end_point(buf), sasl::SCRAM_SHA_256_PLUS)
                        }
                        (_, _, true) => (sasl::ChannelBinding::unrequested(), sasl::SCRAM_SHA_256),
                        _ => return Err(AuthenticationError::UnsupportedMechanism.into()),
                    },
                };

                let mut scram = sasl::ScramSha256::new(pass, channel_binding);

                frontend::sasl_initial_response(mechanism, scram.message(), buf)?;
                let msg = buf.split();
                drv.send(msg).await?;

                match drv.recv().await? {
                    backend::Message::AuthenticationSaslContinue(body) => {
                        scram.update(body.data())?;
                        frontend::sasl_response(scram.message(), buf)?;
                        let msg = buf.split();
                        drv.send(msg).await?;
                    }
                    _ => return Err(Error::unexpected()),
                }

                match drv.recv().await? {
                    backend::Message::AuthenticationSaslFinal(body) => scram.finish(body.data())?,
                    _ => return Err(Error::unexpected()),
                }
            }
            backend::Message::AuthenticationKerberosV5
            | backend::Message::AuthenticationGss
            | backend::Message::AuthenticationSspi => return Err(FeatureError::Kerberos.into()),
            _ => return Err(Error::unexpected()),
        }
    }
}

async fn send_pass<Io>(drv: &mut GenericDriver<Io>, pass: impl AsRef<[u8]>, buf: &mut BytesMut) -> Result<(), Error>
where
    Io: AsyncIo + Send,
{
    frontend::password_message(pass.as_ref(), buf)?;
    let msg = buf.split();
    drv.send(msg).await
}

// probes the session with a simple query when the configuration demands
// particular session properties.
async fn verify_session_attrs<Io>(drv: &mut GenericDriver<Io>, cfg: &Config, buf: &mut BytesMut) -> Result<(), Error>
where
    Io: AsyncIo + Send,
{
    let (query, accept, reject) = match cfg.get_target_session_attrs() {
        TargetSessionAttrs::Any => return Ok(()),
        TargetSessionAttrs::ReadWrite => (
            "SHOW transaction_read_only",
            b"off" as &[u8],
            "session does not allow writes",
        ),
        TargetSessionAttrs::ReadOnly => (
            "SHOW transaction_read_only",
            b"on" as &[u8],
            "session is not read only",
        ),
        TargetSessionAttrs::Primary => (
            "SELECT pg_is_in_recovery()",
            b"f" as &[u8],
            "server is in recovery",
        ),
        TargetSessionAttrs::Standby => (
            "SELECT pg_is_in_recovery()",
            b"t" as &[u8],
            "server is not in recovery",
        ),
    };

    frontend::query(query, buf)?;
    let msg = buf.split();
    drv.send(msg).await?;

    let mut matched = false;
    loop {
        match drv.recv().await? {
            backend::Message::DataRow(body) => {
                let range = body.ranges().next()?.flatten().ok_or_else(Error::unexpected)?;
                matched = &body.buffer()[range.start..range.end] == accept;
            }
            backend::Message::RowDescription(_) | backend::Message::CommandComplete(_) => {}
            backend::Message::EmptyQueryResponse | backend::Message::ReadyForQuery(_) => break,
            _ => return Err(Error::unexpected()),
        }
    }

    if matched {
        Ok(())
    } else {
        Err(InvalidState(reject).into())
    }
}
