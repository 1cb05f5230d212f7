use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::Semaphore;

use crate::command::{CommandResolver, ExportRequest};
use crate::db::RecordSource;
use crate::error::{ExportError, ProtocolError, StorageError};
use crate::frame;

pub const DEFAULT_MAX_CONNECTIONS: usize = 64;
/// Upper bound on concurrent workers; also keeps the drain count within `u32`.
pub const MAX_CONNECTIONS_LIMIT: usize = 65_536;
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Owns the listening socket and everything a connection worker needs.
pub struct Server {
    listener: TcpListener,
    exporter: Arc<Exporter>,
    max_connections: usize,
}

/// What one successful exchange put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sent {
    pub records: usize,
    /// Payload size, not counting the length prefix.
    pub bytes: usize,
}

/// The per-connection half, shared read-only by every worker.
pub struct Exporter {
    source: Arc<dyn RecordSource>,
    resolver: CommandResolver,
    read_timeout: Duration,
}

impl Server {
    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
        source: Arc<dyn RecordSource>,
        resolver: CommandResolver,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            exporter: Arc::new(Exporter {
                source,
                resolver,
                read_timeout: DEFAULT_READ_TIMEOUT,
            }),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        })
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections.clamp(1, MAX_CONNECTIONS_LIMIT);
        self
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        // Only called before the first worker is spawned.
        if let Some(exporter) = Arc::get_mut(&mut self.exporter) {
            exporter.read_timeout = read_timeout;
        }
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` resolves, one worker each.
    ///
    /// A worker slot is taken before `accept`, so at most `max_connections`
    /// exchanges are in flight and the rest wait in the listen backlog.
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let limit = Arc::new(Semaphore::new(self.max_connections));
        tokio::pin!(shutdown);

        loop {
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = Arc::clone(&limit).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let (stream, peer) = tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        log::error!("Failed to accept connection: {e}");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
            };

            log::debug!("Accepted connection from {peer}");
            let exporter = Arc::clone(&self.exporter);
            tokio::spawn(async move {
                let _permit = permit;
                match exporter.handle_connection(stream).await {
                    Ok(sent) => log::info!(
                        "Sent {} records ({} bytes) to {peer}",
                        sent.records,
                        sent.bytes
                    ),
                    Err(ExportError::Protocol(e)) => log::warn!("{peer}: {e}"),
                    Err(e) => log::error!("{peer}: {e}"),
                }
            });
        }

        drop(self.listener);
        log::info!("Stopped accepting connections, waiting for workers");
        let all = u32::try_from(self.max_connections).unwrap_or(u32::MAX);
        if tokio::time::timeout(DRAIN_TIMEOUT, limit.acquire_many(all))
            .await
            .is_err()
        {
            log::warn!("Workers still running after {:?}", DRAIN_TIMEOUT);
        }
    }
}

impl Exporter {
    /// Serves one command/response exchange and reports what was sent.
    ///
    /// The stream is consumed and closed on every path. Nothing is written
    /// unless a complete frame was built.
    pub async fn handle_connection<S>(&self, mut stream: S) -> Result<Sent, ExportError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let request = self.read_request(&mut stream).await?;
        let query = self.resolver.resolve(request)?;

        let source = Arc::clone(&self.source);
        let records = tokio::task::spawn_blocking(move || source.fetch(query))
            .await
            .map_err(StorageError::from)??;

        let payload = frame::serialize(&records)?;
        frame::send_framed(&mut stream, &payload).await?;
        stream.shutdown().await?;

        Ok(Sent {
            records: records.len(),
            bytes: payload.len(),
        })
    }

    async fn read_request<S>(&self, stream: &mut S) -> Result<ExportRequest, ExportError>
    where
        S: AsyncRead + Unpin,
    {
        let mut flag = [0u8; 1];
        match tokio::time::timeout(self.read_timeout, stream.read(&mut flag)).await {
            Err(_) => Err(ProtocolError::Timeout.into()),
            Ok(Ok(0)) => Err(ProtocolError::Disconnected.into()),
            Ok(Ok(_)) => Ok(ExportRequest { flag: flag[0] }),
            Ok(Err(e)) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use tokio::net::TcpStream;

    use super::*;
    use crate::command::StaticConfig;
    use crate::error::SerializationError;
    use crate::frame::Reading;
    use crate::record::TelemetryRecord;

    struct MemorySource(Vec<TelemetryRecord>);

    impl RecordSource for MemorySource {
        fn query_last_n(
            &self,
            device_id: i64,
            n: usize,
        ) -> Result<Vec<TelemetryRecord>, StorageError> {
            let mut records: Vec<_> = self
                .0
                .iter()
                .filter(|r| r.device_id == device_id)
                .copied()
                .collect();
            records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
            records.truncate(n);
            Ok(records)
        }

        fn query_range(
            &self,
            _device_id: i64,
            _from: i64,
            _to: i64,
        ) -> Result<Vec<TelemetryRecord>, StorageError> {
            unimplemented!()
        }
    }

    struct BrokenSource;

    impl RecordSource for BrokenSource {
        fn query_last_n(&self, _: i64, _: usize) -> Result<Vec<TelemetryRecord>, StorageError> {
            Err(StorageError::Query(rusqlite::Error::InvalidQuery))
        }

        fn query_range(
            &self,
            _: i64,
            _: i64,
            _: i64,
        ) -> Result<Vec<TelemetryRecord>, StorageError> {
            Err(StorageError::Query(rusqlite::Error::InvalidQuery))
        }
    }

    fn sample(n: usize) -> Vec<TelemetryRecord> {
        (0..n)
            .map(|i| {
                TelemetryRecord::new(1, 20.0 + i as f32, 40.0, 0.5 * i as f32).at(i as i64)
            })
            .chain([TelemetryRecord::new(2, -1.0, -1.0, -1.0).at(1_000)])
            .collect()
    }

    fn exporter(source: Arc<dyn RecordSource>, count: usize) -> Exporter {
        Exporter {
            source,
            resolver: CommandResolver::new(1, Box::new(StaticConfig { record_count: count })),
            read_timeout: Duration::from_millis(200),
        }
    }

    async fn start(source: Arc<dyn RecordSource>, count: usize, max: usize) -> SocketAddr {
        let resolver = CommandResolver::new(1, Box::new(StaticConfig { record_count: count }));
        let server = Server::bind("127.0.0.1:0", source, resolver)
            .await
            .unwrap()
            .with_max_connections(max)
            .with_read_timeout(Duration::from_millis(300));
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run(std::future::pending()));
        addr
    }

    async fn exchange(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        response
    }

    fn decode(response: &[u8]) -> Vec<Reading> {
        let len = u32::from_be_bytes([response[0], response[1], response[2], response[3]]);
        assert_eq!(len as usize, response.len() - 4);
        frame::deserialize(&response[4..]).unwrap()
    }

    #[tokio::test]
    async fn test_serves_last_records_newest_first() {
        let addr = start(Arc::new(MemorySource(sample(10))), 3, 4).await;

        let readings = decode(&exchange(addr, &[0x01]).await);
        let temps: Vec<f32> = readings.iter().map(|r| r.temperature).collect();
        assert_eq!(temps, vec![29.0, 28.0, 27.0]);
        assert_eq!(readings[0].water_level, 4.5);
    }

    #[tokio::test]
    async fn test_empty_store_sends_zero_count() {
        let addr = start(Arc::new(MemorySource(Vec::new())), 30, 4).await;

        let response = exchange(addr, &[0x01]).await;
        assert_eq!(&response[..4], &8u32.to_be_bytes());
        assert_eq!(&response[4..], &0.0f64.to_le_bytes());
    }

    #[tokio::test]
    async fn test_silent_client_gets_nothing() {
        let addr = start(Arc::new(MemorySource(sample(3))), 3, 4).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.shutdown().await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        assert!(response.is_empty());
    }

    #[tokio::test]
    async fn test_idle_client_times_out() {
        let addr = start(Arc::new(MemorySource(sample(3))), 3, 4).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        assert!(response.is_empty());
    }

    #[tokio::test]
    async fn test_bad_commands_close_without_response() {
        let addr = start(Arc::new(MemorySource(sample(3))), 3, 4).await;

        for flag in [0xff, 0x00, 0x02, 0x03] {
            assert!(exchange(addr, &[flag]).await.is_empty());
        }

        // The accept loop survives and keeps serving.
        assert_eq!(decode(&exchange(addr, &[0x01]).await).len(), 3);
    }

    #[tokio::test]
    async fn test_non_finite_record_sends_nothing() {
        let mut records = sample(3);
        records.push(TelemetryRecord::new(1, f32::NAN, 1.0, 1.0).at(500));
        let addr = start(Arc::new(MemorySource(records)), 3, 4).await;

        assert!(exchange(addr, &[0x01]).await.is_empty());
    }

    #[tokio::test]
    async fn test_storage_failure_sends_nothing() {
        let addr = start(Arc::new(BrokenSource), 3, 4).await;

        assert!(exchange(addr, &[0x01]).await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_clients_get_independent_frames() {
        let addr = start(Arc::new(MemorySource(sample(20))), 5, 8).await;

        let clients: Vec<_> = (0..32)
            .map(|_| tokio::spawn(exchange(addr, &[0x01])))
            .collect();

        let expected: Vec<Reading> = MemorySource(sample(20))
            .query_last_n(1, 5)
            .unwrap()
            .iter()
            .map(Reading::from)
            .collect();
        for client in clients {
            let response = client.await.unwrap();
            assert_eq!(response.len(), 4 + 8 + 5 * 12);
            assert_eq!(decode(&response), expected);
        }
    }

    #[tokio::test]
    async fn test_worker_limit_queues_connections() {
        let addr = start(Arc::new(MemorySource(sample(3))), 3, 1).await;

        // Holds the only worker slot until the read timeout fires.
        let idle = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        let response = exchange(addr, &[0x01]).await;
        assert_eq!(decode(&response).len(), 3);
        assert!(started.elapsed() >= Duration::from_millis(150));
        drop(idle);
    }

    #[tokio::test]
    async fn test_max_connections_is_clamped() {
        let resolver = CommandResolver::new(1, Box::new(StaticConfig { record_count: 1 }));
        let server = Server::bind("127.0.0.1:0", Arc::new(MemorySource(Vec::new())), resolver)
            .await
            .unwrap();

        let server = server.with_max_connections(usize::MAX);
        assert_eq!(server.max_connections, MAX_CONNECTIONS_LIMIT);
        let server = server.with_max_connections(0);
        assert_eq!(server.max_connections, 1);
    }

    #[tokio::test]
    async fn test_handle_connection_reports_sent_sizes() {
        let exporter = exporter(Arc::new(MemorySource(sample(10))), 4);

        let (mut client, server) = tokio::io::duplex(256);
        client.write_all(&[0x01]).await.unwrap();
        let sent = exporter.handle_connection(server).await.unwrap();
        assert_eq!(
            sent,
            Sent {
                records: 4,
                bytes: 8 + 4 * 12
            }
        );

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response.len(), 4 + sent.bytes);
    }

    #[tokio::test]
    async fn test_handle_connection_classifies_errors() {
        let exporter = exporter(Arc::new(MemorySource(sample(3))), 3);

        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&[0xff]).await.unwrap();
        let result = exporter.handle_connection(server).await;
        assert!(matches!(
            result,
            Err(ExportError::Protocol(ProtocolError::UnknownCommand(0xff)))
        ));
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(response.is_empty());

        let (client, server) = tokio::io::duplex(64);
        drop(client);
        assert!(matches!(
            exporter.handle_connection(server).await,
            Err(ExportError::Protocol(ProtocolError::Disconnected))
        ));

        let (_client, server) = tokio::io::duplex(64);
        assert!(matches!(
            exporter.handle_connection(server).await,
            Err(ExportError::Protocol(ProtocolError::Timeout))
        ));

        let broken = self::exporter(Arc::new(BrokenSource), 3);
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&[0x01]).await.unwrap();
        assert!(matches!(
            broken.handle_connection(server).await,
            Err(ExportError::Storage(StorageError::Query(_)))
        ));
    }

    #[tokio::test]
    async fn test_handle_connection_rejects_nan_before_writing() {
        let records = vec![TelemetryRecord::new(1, 1.0, 1.0, f32::INFINITY)];
        let exporter = exporter(Arc::new(MemorySource(records)), 3);

        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&[0x01]).await.unwrap();
        assert!(matches!(
            exporter.handle_connection(server).await,
            Err(ExportError::Serialization(SerializationError::NonFinite {
                index: 0,
                field: "water_level"
            }))
        ));
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(response.is_empty());
    }
}
