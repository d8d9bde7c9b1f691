use std::time::Duration;

use super::{conn::PendingConnection, Connection, StreamDescription};
use crate::{
    client::options::ClientOptions,
    error::Result,
    hello::{hello_command, run_hello, HelloReply},
    options::ServerAddress,
    runtime::{AsyncStream, TlsConfig},
};

/// Contains the logic to establish a connection: opening the stream and performing the `hello`
/// handshake.
#[derive(Clone, Debug)]
pub(crate) struct ConnectionEstablisher {
    /// Cached configuration needed to create TLS connections, if needed.
    tls_config: Option<TlsConfig>,

    connect_timeout: Option<Duration>,

    app_name: Option<String>,

    #[cfg(test)]
    mock: Option<crate::test::MockDeployment>,
}

impl ConnectionEstablisher {
    /// Creates a new ConnectionEstablisher from the given options.
    pub(crate) fn new(options: &ClientOptions) -> Result<Self> {
        let tls_config = options.tls_options().map(TlsConfig::new).transpose()?;

        Ok(Self {
            tls_config,
            connect_timeout: options.connect_timeout,
            app_name: options.app_name.clone(),
            #[cfg(test)]
            mock: options
                .test_options
                .as_ref()
                .and_then(|test_options| test_options.mock.clone()),
        })
    }

    async fn make_stream(&self, address: &ServerAddress) -> Result<AsyncStream> {
        #[cfg(test)]
        if let Some(ref mock) = self.mock {
            return mock.connect(address);
        }
        AsyncStream::connect(address, self.tls_config.as_ref(), self.connect_timeout).await
    }

    async fn handshake(&self, connection: &mut Connection) -> Result<HelloReply> {
        let command = hello_command(None, self.app_name.as_deref());
        let reply = run_hello(connection, command).await?;
        connection.stream_description = Some(StreamDescription::from_hello_reply(&reply));
        Ok(reply)
    }

    /// Establishes a pooled connection.
    pub(crate) async fn establish_connection(
        &self,
        pending_connection: PendingConnection,
    ) -> Result<Connection> {
        let stream = self.make_stream(&pending_connection.address).await?;
        let mut connection = Connection::new(
            pending_connection.id,
            pending_connection.address,
            pending_connection.generation,
            stream,
        );
        self.handshake(&mut connection).await?;
        Ok(connection)
    }

    /// Establishes a connection for a server monitor, returning the connection along with the
    /// handshake reply so that the first check does not need a second round trip.
    pub(crate) async fn establish_monitoring_connection(
        &self,
        address: ServerAddress,
    ) -> Result<(Connection, HelloReply)> {
        let stream = self.make_stream(&address).await?;
        let mut connection = Connection::new(0, address, 0, stream);
        let reply = self.handshake(&mut connection).await?;
        Ok((connection, reply))
    }
}
