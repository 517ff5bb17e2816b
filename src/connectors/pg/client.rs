//! Client side of the startup exchange

use tokio::io::AsyncWriteExt;

use crate::error::{BrokerError, Result};
use crate::protocol::postgres::{read_client_hello, ClientHello, StartupMessage, SSL_NOT_ALLOWED};
use crate::server::NetworkStream;

/// Read the client's startup packet.
///
/// Encryption probes (SSL and GSSAPI) are declined with `N`, after which the
/// client sends its real startup in plaintext. Each probe is accepted once.
pub async fn read_client_startup(client: &mut NetworkStream) -> Result<StartupMessage> {
    let mut ssl_declined = false;
    let mut gss_declined = false;

    loop {
        match read_client_hello(client).await? {
            ClientHello::Startup(startup) => {
                debug!(
                    "Client startup: user={:?} database={:?}",
                    startup.user(),
                    startup.database()
                );
                return Ok(startup);
            }
            ClientHello::SslRequest if !ssl_declined => {
                ssl_declined = true;
                decline(client).await?;
                debug!("Declined client SSLRequest");
            }
            ClientHello::GssEncRequest if !gss_declined => {
                gss_declined = true;
                decline(client).await?;
                debug!("Declined client GSSENCRequest");
            }
            ClientHello::SslRequest | ClientHello::GssEncRequest => {
                return Err(BrokerError::Protocol(
                    "client repeated an encryption request".into(),
                ));
            }
            ClientHello::CancelRequest { .. } => {
                return Err(BrokerError::Protocol(
                    "cancel requests are not supported".into(),
                ));
            }
        }
    }
}

async fn decline(client: &mut NetworkStream) -> Result<()> {
    client.write_all(&[SSL_NOT_ALLOWED]).await?;
    client.flush().await?;
    Ok(())
}
