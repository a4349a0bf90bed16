use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

use super::adapter::{AdapterError, HardwareAdapter};
use crate::config::ConnectionSettings;

/// TCP adapter for the Imaging Machine remote-control port
///
/// Wraps a tokio `TcpStream` with a buffered reader so replies can be read
/// line by line. Every write and read is bounded by a timeout.
pub struct TcpAdapter {
    /// Host name or IP of the machine running the IM software
    host: String,

    /// Remote-control port
    port: u16,

    /// Timeout for establishing the connection
    connect_timeout: Duration,

    /// Timeout for writing one request line
    write_timeout: Duration,

    /// Open stream, `None` until connected
    stream: Option<BufReader<TcpStream>>,
}

impl TcpAdapter {
    /// Create an unconnected adapter for `host:port`
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let defaults = ConnectionSettings::default();
        Self {
            host: host.into(),
            port,
            connect_timeout: defaults.connect_timeout(),
            write_timeout: defaults.write_timeout(),
            stream: None,
        }
    }

    /// Create an unconnected adapter from connection settings
    pub fn from_settings(settings: &ConnectionSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            connect_timeout: settings.connect_timeout(),
            write_timeout: settings.write_timeout(),
            stream: None,
        }
    }

    /// `host:port` this adapter dials
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn write_line(&mut self, line: &str) -> Result<(), AdapterError> {
        let write_timeout = self.write_timeout;
        let stream = self.stream.as_mut().ok_or(AdapterError::NotConnected)?;

        let payload = format!("{line}\n");
        tokio::time::timeout(write_timeout, async {
            stream.get_mut().write_all(payload.as_bytes()).await?;
            stream.get_mut().flush().await
        })
        .await
        .map_err(|_| AdapterError::Timeout(write_timeout))??;

        trace!(line, "sent");
        Ok(())
    }

    async fn read_reply(&mut self, timeout: Duration) -> Result<String, AdapterError> {
        let stream = self.stream.as_mut().ok_or(AdapterError::NotConnected)?;
        let mut reply = String::new();
        let read = tokio::time::timeout(timeout, stream.read_line(&mut reply))
            .await
            .map_err(|_| AdapterError::Timeout(timeout))??;

        if read == 0 {
            return Err(AdapterError::ConnectionClosed);
        }
        Ok(reply.trim_end_matches(['\r', '\n']).to_string())
    }
}

#[async_trait]
impl HardwareAdapter for TcpAdapter {
    fn name(&self) -> &str {
        "tcp"
    }

    async fn connect(&mut self) -> Result<(), AdapterError> {
        let address = self.address();
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| AdapterError::Timeout(self.connect_timeout))?
            .map_err(|source| AdapterError::ConnectionFailed {
                address: address.clone(),
                source,
            })?;

        // Requests are tiny and latency-bound
        stream.set_nodelay(true)?;
        self.stream = Some(BufReader::new(stream));

        debug!(%address, "connected to Imaging Machine");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), AdapterError> {
        if let Some(mut stream) = self.stream.take() {
            stream.get_mut().shutdown().await?;
            debug!(address = %self.address(), "disconnected");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Write `line` and read its reply.
    ///
    /// Any write or read failure drops the stream: a reply that arrives after
    /// a timeout would otherwise be taken as the answer to the next request.
    async fn query(&mut self, line: &str, timeout: Duration) -> Result<String, AdapterError> {
        let exchange = match self.write_line(line).await {
            Ok(()) => self.read_reply(timeout).await,
            Err(e) => Err(e),
        };

        match exchange {
            Ok(reply) => {
                trace!(%reply, "received");
                Ok(reply)
            }
            Err(e) => {
                if self.stream.take().is_some() {
                    warn!(address = %self.address(), error = %e, "dropping connection after failed exchange");
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_tcp_adapter_creation() {
        let adapter = TcpAdapter::new("192.168.1.20", 6260);
        assert_eq!(adapter.name(), "tcp");
        assert_eq!(adapter.address(), "192.168.1.20:6260");
        assert!(!adapter.is_connected());
    }

    #[tokio::test]
    async fn test_query_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let peer = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(stream);
            let mut line = String::new();
            lines.read_line(&mut line).await.unwrap();
            assert_eq!(line, "GetMode()\n");
            lines.get_mut().write_all(b"OK live\r\n").await.unwrap();
        });

        let mut adapter = TcpAdapter::new("127.0.0.1", port);
        adapter.connect().await.unwrap();
        let reply = adapter
            .query("GetMode()", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, "OK live");
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_hangup_reports_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let peer = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let mut adapter = TcpAdapter::new("127.0.0.1", port);
        adapter.connect().await.unwrap();
        peer.await.unwrap();

        let result = adapter.query("GetMode()", Duration::from_secs(1)).await;
        // Depending on timing the write itself may fail with a reset
        assert!(matches!(
            result,
            Err(AdapterError::ConnectionClosed) | Err(AdapterError::Io(_))
        ));
        assert!(!adapter.is_connected());
    }

    #[tokio::test]
    async fn test_query_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let peer = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            // Never answer
            tokio::time::sleep(Duration::from_millis(300)).await;
            drop(stream);
        });

        let mut adapter = TcpAdapter::new("127.0.0.1", port);
        adapter.connect().await.unwrap();
        let result = adapter.query("GetMode()", Duration::from_millis(50)).await;
        assert!(matches!(result, Err(AdapterError::Timeout(_))));
        assert!(!adapter.is_connected());
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_late_reply_is_not_taken_for_next_request() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let peer = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(stream);
            let mut line = String::new();
            lines.read_line(&mut line).await.unwrap();
            assert_eq!(line, "RunHardwareAutoFocus(2,2,18000.0)\n");
            tokio::time::sleep(Duration::from_millis(150)).await;
            // Answer arrives after the client gave up; the write may fail
            let _ = lines.get_mut().write_all(b"OK 18040.0\n").await;
        });

        let mut adapter = TcpAdapter::new("127.0.0.1", port);
        adapter.connect().await.unwrap();

        let first = adapter
            .query("RunHardwareAutoFocus(2,2,18000.0)", Duration::from_millis(50))
            .await;
        assert!(matches!(first, Err(AdapterError::Timeout(_))));
        assert!(!adapter.is_connected());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let second = adapter.query("GetMode()", Duration::from_secs(1)).await;
        assert!(matches!(second, Err(AdapterError::NotConnected)));
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_query_requires_connection() {
        let mut adapter = TcpAdapter::new("127.0.0.1", 1);
        let result = adapter.query("ResetCamera()", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(AdapterError::NotConnected)));
    }
}
