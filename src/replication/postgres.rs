//! Logical replication handler over a PostgreSQL CopyBoth stream.
//!
//! Connects with `replication=database`, manages the replication slot, and
//! speaks the streaming protocol frames: XLogData (`w`) carrying wal2json
//! payloads, primary keep-alives (`k`), and standby status updates (`r`) for
//! LSN acknowledgement.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, TimeZone, Utc};
use futures::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio_postgres::{CopyBothDuplex, NoTls, SimpleQueryMessage};
use tracing::{debug, error, info, warn};

use super::{Handler, Message};
use crate::wal::Lsn;
use crate::{Error, Result};

/// Microseconds between the Unix epoch and the PostgreSQL epoch (2000-01-01).
const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct Config {
    pub url: String,
    pub slot_name: String,
}

pub struct PostgresReplicationHandler {
    client: tokio_postgres::Client,
    connection_task: tokio::task::JoinHandle<()>,
    slot_name: String,
    stream: Mutex<Option<Pin<Box<CopyBothDuplex<Bytes>>>>>,
    confirmed: AtomicU64,
    receive_timeout: Duration,
}

impl PostgresReplicationHandler {
    pub async fn new(config: &Config) -> Result<Self> {
        info!("Creating replication connection to PostgreSQL");

        // replication mode is requested through the connection options
        let url = if config.url.contains("replication=") {
            config.url.clone()
        } else if config.url.contains('?') {
            format!("{}&replication=database", config.url)
        } else {
            format!("{}?replication=database", config.url)
        };
        let pg_config = url.parse::<tokio_postgres::Config>()?;

        let (client, connection) = pg_config.connect(NoTls).await?;
        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Replication connection error: {}", e);
            }
        });

        info!("Successfully connected to PostgreSQL in replication mode");

        Ok(Self {
            client,
            connection_task,
            slot_name: config.slot_name.clone(),
            stream: Mutex::new(None),
            confirmed: AtomicU64::new(0),
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
        })
    }

    async fn create_replication_slot(&self) -> Result<()> {
        let query = format!(
            "CREATE_REPLICATION_SLOT {} LOGICAL wal2json NOEXPORT_SNAPSHOT",
            self.slot_name
        );

        match self.client.simple_query(&query).await {
            Ok(messages) => {
                for message in messages {
                    if let SimpleQueryMessage::Row(row) = message {
                        let slot = row.get("slot_name").unwrap_or("unknown");
                        let lsn = row.get("consistent_point").unwrap_or("unknown");
                        info!("Created replication slot '{}' at LSN {}", slot, lsn);
                    }
                }
                Ok(())
            }
            Err(e) if e.to_string().contains("already exists") => {
                info!("Replication slot '{}' already exists", self.slot_name);
                Ok(())
            }
            Err(e) => Err(Error::Postgres(e)),
        }
    }

    async fn confirmed_flush_lsn(&self) -> Result<Lsn> {
        let query = format!(
            "SELECT confirmed_flush_lsn FROM pg_replication_slots WHERE slot_name = '{}'",
            self.slot_name
        );
        let messages = self.client.simple_query(&query).await?;
        for message in messages {
            if let SimpleQueryMessage::Row(row) = message {
                if let Some(lsn) = row.get("confirmed_flush_lsn") {
                    return lsn.parse();
                }
            }
        }
        Ok(Lsn(0))
    }

    fn parse_frame(&self, data: Bytes) -> Result<Option<Message>> {
        if data.is_empty() {
            return Err(Error::InvalidMessage {
                message: "empty replication frame".to_string(),
            });
        }

        let tag = data[0];
        let mut cursor = &data[1..];

        match tag {
            b'w' => {
                // XLogData: start LSN, end LSN, server time, payload
                if cursor.remaining() < 24 {
                    return Err(Error::InvalidMessage {
                        message: "invalid XLogData header size".to_string(),
                    });
                }
                let start_lsn = cursor.get_u64();
                let _end_lsn = cursor.get_u64();
                let server_time = cursor.get_i64();

                Ok(Some(Message {
                    lsn: Lsn(start_lsn),
                    data: Some(data.slice(25..)),
                    server_time: pg_timestamp_to_datetime(server_time),
                    reply_requested: false,
                }))
            }
            b'k' => {
                // primary keep-alive: end LSN, server time, reply flag
                if cursor.remaining() < 17 {
                    return Err(Error::InvalidMessage {
                        message: "invalid keepalive message size".to_string(),
                    });
                }
                let wal_end = cursor.get_u64();
                let server_time = cursor.get_i64();
                let reply = cursor.get_u8() != 0;

                Ok(Some(Message {
                    lsn: Lsn(wal_end),
                    data: None,
                    server_time: pg_timestamp_to_datetime(server_time),
                    reply_requested: reply,
                }))
            }
            other => {
                debug!("Ignoring replication frame with tag {}", other as char);
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl Handler for PostgresReplicationHandler {
    async fn start(&self) -> Result<()> {
        self.create_replication_slot().await?;

        let start_lsn = self.confirmed_flush_lsn().await?;
        self.confirmed.store(start_lsn.0, Ordering::SeqCst);
        info!("Starting replication from LSN: {}", start_lsn);

        let query = format!(
            "START_REPLICATION SLOT {} LOGICAL {} (\"include-lsn\" 'true', \"include-timestamp\" 'true', \"format-version\" '2')",
            self.slot_name, start_lsn
        );
        let duplex = self.client.copy_both_simple::<Bytes>(&query).await?;
        *self.stream.lock().await = Some(Box::pin(duplex));

        Ok(())
    }

    async fn receive_message(&self) -> Result<Message> {
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or_else(|| Error::Replication {
            message: "replication not started".to_string(),
        })?;

        loop {
            let next = tokio::time::timeout(self.receive_timeout, stream.next()).await;
            let frame = match next {
                Err(_) => return Err(Error::ConnTimeout),
                Ok(None) => {
                    return Err(Error::Connection(
                        "replication stream closed by server".to_string(),
                    ))
                }
                Ok(Some(frame)) => frame?,
            };

            // frames with unknown tags are skipped rather than surfaced
            if let Some(msg) = self.parse_frame(frame)? {
                return Ok(msg);
            }
        }
    }

    async fn sync_lsn(&self, lsn: Lsn) -> Result<()> {
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or_else(|| Error::Replication {
            message: "replication not started".to_string(),
        })?;

        // standby status update: written, flushed and applied all advance
        // together since delivery downstream implies durability
        let mut buf = BytesMut::with_capacity(34);
        buf.put_u8(b'r');
        buf.put_u64(lsn.0);
        buf.put_u64(lsn.0);
        buf.put_u64(lsn.0);
        buf.put_i64(now_pg_timestamp());
        buf.put_u8(0);

        stream.send(buf.freeze()).await.map_err(Error::Postgres)?;
        self.confirmed.fetch_max(lsn.0, Ordering::SeqCst);
        debug!(%lsn, "confirmed flush position advanced");
        Ok(())
    }

    fn confirmed_lsn(&self) -> Lsn {
        Lsn(self.confirmed.load(Ordering::SeqCst))
    }

    async fn close(&self) -> Result<()> {
        info!("Closing replication connection");
        if let Some(mut stream) = self.stream.lock().await.take() {
            if let Err(e) = stream.close().await {
                warn!("Error closing replication stream: {}", e);
            }
        }
        self.connection_task.abort();
        Ok(())
    }
}

fn now_pg_timestamp() -> i64 {
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as i64;
    micros - PG_EPOCH_OFFSET_MICROS
}

fn pg_timestamp_to_datetime(micros: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_micros(micros + PG_EPOCH_OFFSET_MICROS).single()
}
