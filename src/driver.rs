//! driver task of a session: owns the socket and demultiplexes responses.

pub(crate) mod codec;
pub(crate) mod generic;
pub(crate) mod request;

mod connect;

#[cfg(feature = "tls")]
mod tls;

pub(crate) use connect::{cancel, establish};

use xitca_io::net::TcpStream;

#[cfg(unix)]
use xitca_io::net::UnixStream;

#[cfg(feature = "tls")]
use xitca_tls::rustls::{ClientConnection, TlsStream};

use self::generic::GenericDriver;

/// io driver of one session. runs as a background task until the session is
/// dropped or the connection breaks.
pub(crate) enum Driver {
    Tcp(GenericDriver<TcpStream>),
    #[cfg(feature = "tls")]
    Tls(GenericDriver<TlsStream<ClientConnection, TcpStream>>),
    #[cfg(unix)]
    Unix(GenericDriver<UnixStream>),
    #[cfg(all(unix, feature = "tls"))]
    UnixTls(GenericDriver<TlsStream<ClientConnection, UnixStream>>),
}

impl Driver {
    pub(crate) fn spawn(self) {
        tokio::spawn(self.run());
    }

    async fn run(self) {
        let res = match self {
            Self::Tcp(drv) => drv.run().await,
            #[cfg(feature = "tls")]
            Self::Tls(drv) => drv.run().await,
            #[cfg(unix)]
            Self::Unix(drv) => drv.run().await,
            #[cfg(all(unix, feature = "tls"))]
            Self::UnixTls(drv) => drv.run().await,
        };
        if let Err(e) = res {
            tracing::warn!("session driver exited: {e}");
        }
    }
}
