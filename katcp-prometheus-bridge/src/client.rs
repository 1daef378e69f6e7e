//! KATCP device client.
//!
//! Keeps one connection to the device, lists its sensors, subscribes to
//! `auto` sampling and forwards everything the device reports as
//! [`SensorEvent`]s over an ordered channel.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;
use std::time::Duration;

use katcp_common::{Message, MessageKind};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::config::{ConfigError, KatcpConfig};
use crate::event::{ConnectionState, SensorDeclaration, SensorEvent, SensorUpdate};
use crate::filter::SensorFilter;

/// Errors raised by the device connection.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("timed out during {0}")]
    Timeout(&'static str),

    #[error("sensor listing failed: {0}")]
    Handshake(String),

    #[error("connection closed by device")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("event channel closed")]
    ChannelClosed,
}

/// Client for a single KATCP device, with reconnection.
pub struct KatcpClient {
    address: String,
    connect_timeout: Duration,
    sync_timeout: Duration,
    reconnect_delay: Option<Duration>,
    filter: Arc<SensorFilter>,
    events: mpsc::Sender<SensorEvent>,
}

impl KatcpClient {
    /// Create a client; fails if the device endpoint is not configured.
    pub fn new(
        config: &KatcpConfig,
        filter: SensorFilter,
        events: mpsc::Sender<SensorEvent>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            address: config.address()?,
            connect_timeout: config.connect_timeout(),
            sync_timeout: config.sync_timeout(),
            reconnect_delay: config.reconnect_delay(),
            filter: Arc::new(filter),
            events,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Connect to the device and complete the initial sensor listing.
    pub async fn connect(&self) -> Result<Connection<TcpStream>, ClientError> {
        send_event(&self.events, SensorEvent::StateChanged(ConnectionState::Connecting)).await?;

        debug!(address = %self.address, "Connecting to KATCP device");
        let stream = timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| ClientError::Timeout("connect"))?
            .map_err(|source| ClientError::Connect {
                address: self.address.clone(),
                source,
            })?;
        stream.set_nodelay(true)?;

        info!(address = %self.address, "Connected to KATCP device");

        let mut connection = Connection::new(stream, self.filter.clone(), self.events.clone());
        timeout(self.sync_timeout, connection.synchronise())
            .await
            .map_err(|_| ClientError::Timeout("sensor listing"))??;

        Ok(connection)
    }

    /// Run until shutdown, reconnecting after failures if configured.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut attempts: u64 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }
            attempts += 1;

            let connected = tokio::select! {
                result = self.connect() => result,
                _ = wait_for_shutdown(&mut shutdown) => break,
            };

            let result = match connected {
                Ok(mut connection) => connection.run(&mut shutdown).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => break,
                Err(ClientError::ChannelClosed) => {
                    debug!("Event channel closed, stopping client");
                    return;
                }
                Err(e) => {
                    warn!(address = %self.address, attempt = attempts, error = %e, "KATCP connection lost");
                }
            }

            if send_event(
                &self.events,
                SensorEvent::StateChanged(ConnectionState::Disconnected),
            )
            .await
            .is_err()
            {
                return;
            }

            let Some(delay) = self.reconnect_delay else {
                info!("Reconnection disabled, serving last known sensor values");
                break;
            };

            debug!(delay_secs = delay.as_secs(), "Waiting before reconnecting");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
        }

        // Best effort: the watcher may already be gone during shutdown
        let _ = self
            .events
            .try_send(SensorEvent::StateChanged(ConnectionState::Disconnected));
        info!(address = %self.address, "KATCP client stopped");
    }
}

struct PendingListing {
    mid: u32,
    names: Vec<String>,
}

/// An established device connection.
pub struct Connection<S> {
    stream: BufReader<S>,
    buffer: Vec<u8>,
    next_mid: u32,
    listing: Option<PendingListing>,
    sampling: HashMap<u32, String>,
    subscribed: HashSet<String>,
    filter: Arc<SensorFilter>,
    events: mpsc::Sender<SensorEvent>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, filter: Arc<SensorFilter>, events: mpsc::Sender<SensorEvent>) -> Self {
        Self {
            stream: BufReader::new(stream),
            buffer: Vec::with_capacity(1024),
            next_mid: 1,
            listing: None,
            sampling: HashMap::new(),
            subscribed: HashSet::new(),
            filter,
            events,
        }
    }

    /// Sensors currently subscribed for `auto` sampling.
    pub fn subscribed(&self) -> &HashSet<String> {
        &self.subscribed
    }

    /// List the device's sensors and subscribe to all of them.
    ///
    /// Returns the number of new subscriptions.
    pub async fn synchronise(&mut self) -> Result<usize, ClientError> {
        self.request_listing().await?;

        loop {
            let message = self.read_message().await?;
            if let Some(subscribed) = self.dispatch(message).await? {
                info!(
                    sensors = self.subscribed.len(),
                    "Subscribed to sensor sampling"
                );
                send_event(
                    &self.events,
                    SensorEvent::StateChanged(ConnectionState::Subscribed),
                )
                .await?;
                return Ok(subscribed);
            }
        }
    }

    /// Forward device messages until shutdown or a connection failure.
    pub async fn run(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<(), ClientError> {
        loop {
            let message = tokio::select! {
                message = self.read_message() => message?,
                _ = wait_for_shutdown(shutdown) => {
                    debug!("Closing KATCP connection");
                    return Ok(());
                }
            };

            if let Some(subscribed) = self.dispatch(message).await?
                && subscribed > 0
            {
                info!(new = subscribed, "Subscribed to newly listed sensors");
            }
        }
    }

    /// Read the next well-formed message.
    ///
    /// Malformed lines are logged and skipped. Partially read lines survive
    /// cancellation in `buffer`.
    async fn read_message(&mut self) -> Result<Message, ClientError> {
        loop {
            let read = self.stream.read_until(b'\n', &mut self.buffer).await?;
            if read == 0 && self.buffer.is_empty() {
                return Err(ClientError::Closed);
            }

            let line = std::mem::take(&mut self.buffer);
            match Message::parse(&line) {
                Ok(message) => {
                    trace!(message = %message, "Received");
                    return Ok(message);
                }
                Err(katcp_common::ProtocolError::Empty) => continue,
                Err(e) => {
                    warn!(
                        line = %String::from_utf8_lossy(&line).trim_end(),
                        error = %e,
                        "Discarding malformed KATCP line"
                    );
                }
            }
        }
    }

    async fn send(&mut self, message: Message) -> Result<(), ClientError> {
        trace!(message = %message, "Sending");
        self.stream.write_all(&message.encode()).await?;
        self.stream.flush().await?;
        Ok(())
    }

    fn allocate_mid(&mut self) -> u32 {
        let mid = self.next_mid;
        self.next_mid = self.next_mid.checked_add(1).unwrap_or(1);
        mid
    }

    async fn request_listing(&mut self) -> Result<(), ClientError> {
        let mid = self.allocate_mid();
        self.listing = Some(PendingListing {
            mid,
            names: Vec::new(),
        });
        self.send(Message::request("sensor-list", Some(mid), Vec::new()))
            .await
    }

    /// Handle one message. Returns the number of new subscriptions when it
    /// completes a sensor listing.
    async fn dispatch(&mut self, message: Message) -> Result<Option<usize>, ClientError> {
        match (message.kind, message.name.as_str()) {
            (MessageKind::Inform, "sensor-list") => {
                self.on_sensor_list_inform(&message).await?;
            }
            (MessageKind::Inform, "sensor-status") => {
                self.on_sensor_status(&message).await?;
            }
            (MessageKind::Inform, "interface-changed") => {
                info!(arguments = ?message.arguments, "Device interface changed");
                send_event(&self.events, SensorEvent::InterfaceChanged).await?;
                if self.listing.is_none() {
                    self.request_listing().await?;
                }
            }
            (MessageKind::Inform, "version-connect") => {
                info!(
                    component = message.argument(0).unwrap_or_default(),
                    version = message.argument(1).unwrap_or_default(),
                    "Device version"
                );
            }
            (MessageKind::Inform, "disconnect") => {
                warn!(
                    reason = message.argument(0).unwrap_or_default(),
                    "Device is disconnecting"
                );
            }
            (MessageKind::Inform, "log") => {
                debug!(
                    level = message.argument(0).unwrap_or_default(),
                    source = message.argument(2).unwrap_or_default(),
                    text = message.argument(3).unwrap_or_default(),
                    "Device log"
                );
            }
            (MessageKind::Reply, "sensor-list") => {
                return self.on_sensor_list_reply(&message).await;
            }
            (MessageKind::Reply, "sensor-sampling") => {
                let sensor = message.mid.and_then(|mid| self.sampling.remove(&mid));
                if !message.is_ok() {
                    warn!(
                        sensor = sensor.as_deref().unwrap_or("?"),
                        reply = ?message.arguments,
                        "Sensor sampling request failed"
                    );
                }
            }
            _ => {
                trace!(message = %message, "Ignoring message");
            }
        }

        Ok(None)
    }

    async fn on_sensor_list_inform(&mut self, message: &Message) -> Result<(), ClientError> {
        let declaration = match SensorDeclaration::from_inform(message) {
            Ok(declaration) => declaration,
            Err(e) => {
                warn!(error = %e, "Discarding malformed #sensor-list inform");
                return Ok(());
            }
        };

        if !self.filter.accepts(&declaration.name) {
            trace!(sensor = %declaration.name, "Sensor filtered out");
            return Ok(());
        }

        if let Some(listing) = self.listing.as_mut() {
            listing.names.push(declaration.name.clone());
        }
        send_event(&self.events, SensorEvent::Declared(declaration)).await
    }

    async fn on_sensor_status(&mut self, message: &Message) -> Result<(), ClientError> {
        let updates = match SensorUpdate::from_inform(message) {
            Ok(updates) => updates,
            Err(e) => {
                warn!(error = %e, "Discarding malformed #sensor-status inform");
                return Ok(());
            }
        };

        for update in updates {
            if self.filter.accepts(&update.name) {
                send_event(&self.events, SensorEvent::Updated(update)).await?;
            }
        }
        Ok(())
    }

    async fn on_sensor_list_reply(
        &mut self,
        message: &Message,
    ) -> Result<Option<usize>, ClientError> {
        let matches = self
            .listing
            .as_ref()
            .is_some_and(|listing| message.mid.is_none_or(|mid| mid == listing.mid));
        if !matches {
            debug!(mid = ?message.mid, "Ignoring unexpected !sensor-list reply");
            return Ok(None);
        }

        let Some(listing) = self.listing.take() else {
            return Ok(None);
        };

        if !message.is_ok() {
            return Err(ClientError::Handshake(message.arguments.join(" ")));
        }

        let listed: HashSet<String> = listing.names.iter().cloned().collect();
        let before = self.subscribed.len();
        self.subscribed.retain(|name| listed.contains(name));
        if self.subscribed.len() < before {
            info!(
                removed = before - self.subscribed.len(),
                "Sensors no longer listed by device"
            );
        }

        let mut added = 0;
        for name in listing.names {
            if self.subscribed.contains(&name) {
                continue;
            }
            let mid = self.allocate_mid();
            self.sampling.insert(mid, name.clone());
            self.send(Message::request(
                "sensor-sampling",
                Some(mid),
                vec![name.clone(), "auto".to_string()],
            ))
            .await?;
            self.subscribed.insert(name);
            added += 1;
        }

        debug!(listed = listed.len(), added, "Sensor listing complete");
        Ok(Some(added))
    }
}

async fn send_event(
    events: &mpsc::Sender<SensorEvent>,
    event: SensorEvent,
) -> Result<(), ClientError> {
    events
        .send(event)
        .await
        .map_err(|_| ClientError::ChannelClosed)
}

/// Resolve once the shutdown flag is set or its sender is dropped.
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilterConfig;
    use tokio::io::{DuplexStream, duplex};

    struct Device {
        reader: BufReader<DuplexStream>,
    }

    impl Device {
        async fn expect_line(&mut self) -> Message {
            let mut line = Vec::new();
            self.reader.read_until(b'\n', &mut line).await.unwrap();
            Message::parse(&line).unwrap()
        }

        async fn send(&mut self, line: &str) {
            self.reader
                .get_mut()
                .write_all(format!("{}\n", line).as_bytes())
                .await
                .unwrap();
        }
    }

    fn setup(
        filter: SensorFilter,
    ) -> (
        Connection<DuplexStream>,
        Device,
        mpsc::Receiver<SensorEvent>,
    ) {
        let (client_side, device_side) = duplex(64 * 1024);
        let (tx, rx) = mpsc::channel(100);
        let connection = Connection::new(client_side, Arc::new(filter), tx);
        let device = Device {
            reader: BufReader::new(device_side),
        };
        (connection, device, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<SensorEvent>) -> Vec<SensorEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_synchronise_lists_and_subscribes() {
        let (mut connection, mut device, mut rx) = setup(SensorFilter::default());

        let device_task = tokio::spawn(async move {
            let request = device.expect_line().await;
            assert!(request.is(MessageKind::Request, "sensor-list"));
            let mid = request.mid.unwrap();

            device
                .send(&format!(
                    "#sensor-list[{mid}] device.temp Temperature degC float -50 150"
                ))
                .await;
            device
                .send(&format!(
                    "#sensor-list[{mid}] device.mode Mode \\@ discrete idle running error"
                ))
                .await;
            device.send(&format!("!sensor-list[{mid}] ok 2")).await;

            let mut sampled = Vec::new();
            for _ in 0..2 {
                let request = device.expect_line().await;
                assert!(request.is(MessageKind::Request, "sensor-sampling"));
                assert_eq!(request.argument(1), Some("auto"));
                sampled.push(request.argument(0).unwrap().to_string());
            }
            sampled
        });

        let added = connection.synchronise().await.unwrap();
        assert_eq!(added, 2);

        let sampled = device_task.await.unwrap();
        assert_eq!(sampled, vec!["device.temp", "device.mode"]);
        assert_eq!(connection.subscribed().len(), 2);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], SensorEvent::Declared(d) if d.name == "device.temp"));
        assert!(matches!(&events[1], SensorEvent::Declared(d) if d.params.len() == 3));
        assert_eq!(
            events[2],
            SensorEvent::StateChanged(ConnectionState::Subscribed)
        );
    }

    #[tokio::test]
    async fn test_failed_listing_is_handshake_error() {
        let (mut connection, mut device, _rx) = setup(SensorFilter::default());

        tokio::spawn(async move {
            let request = device.expect_line().await;
            device
                .send(&format!("!sensor-list[{}] fail busy", request.mid.unwrap()))
                .await;
        });

        let result = connection.synchronise().await;
        assert!(matches!(result, Err(ClientError::Handshake(reason)) if reason == "fail busy"));
    }

    #[tokio::test]
    async fn test_eof_during_listing_is_closed() {
        let (mut connection, mut device, _rx) = setup(SensorFilter::default());

        tokio::spawn(async move {
            let _ = device.expect_line().await;
            drop(device);
        });

        assert!(matches!(
            connection.synchronise().await,
            Err(ClientError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_filtered_sensors_are_not_subscribed() {
        let filter = SensorFilter::new(&FilterConfig {
            include_sensors: vec![],
            exclude_sensors: vec!["*.debug".to_string()],
        });
        let (mut connection, mut device, mut rx) = setup(filter);

        tokio::spawn(async move {
            let request = device.expect_line().await;
            device
                .send("#sensor-list device.temp Temperature degC float")
                .await;
            device
                .send("#sensor-list device.debug Debug \\@ integer")
                .await;
            device
                .send(&format!("!sensor-list[{}] ok 2", request.mid.unwrap()))
                .await;
            let sampling = device.expect_line().await;
            assert_eq!(sampling.argument(0), Some("device.temp"));
            device
        });

        assert_eq!(connection.synchronise().await.unwrap(), 1);
        assert!(connection.subscribed().contains("device.temp"));
        assert!(!connection.subscribed().contains("device.debug"));

        let declared: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                SensorEvent::Declared(d) => Some(d.name),
                _ => None,
            })
            .collect();
        assert_eq!(declared, vec!["device.temp"]);
    }

    #[tokio::test]
    async fn test_run_forwards_updates_and_skips_garbage() {
        let (mut connection, mut device, mut rx) = setup(SensorFilter::default());
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let device_task = tokio::spawn(async move {
            device.send("#version-connect katcp-protocol 5.0-MI").await;
            device.send("this is not katcp").await;
            device
                .send("#sensor-status 1700000000.0 2 a nominal 1 b warn 2")
                .await;
            device.send("#sensor-status 1700000000.0 9 a nominal").await;
            device.send("#log info 1700000000.0 root ready").await;
            device
        });

        let run = tokio::spawn(async move {
            let result = connection.run(&mut shutdown_rx).await;
            (connection, result)
        });

        let _device = device_task.await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(matches!(first, SensorEvent::Updated(ref u) if u.name == "a"));
        assert!(matches!(second, SensorEvent::Updated(ref u) if u.raw_value == "2"));

        shutdown_tx.send(true).unwrap();
        let (_connection, result) = run.await.unwrap();
        assert!(result.is_ok());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_interface_changed_relists() {
        let (mut connection, mut device, mut rx) = setup(SensorFilter::default());
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let device_task = tokio::spawn(async move {
            let request = device.expect_line().await;
            device.send("#sensor-list a A \\@ integer").await;
            device
                .send(&format!("!sensor-list[{}] ok 1", request.mid.unwrap()))
                .await;
            let sampling = device.expect_line().await;
            assert_eq!(sampling.argument(0), Some("a"));

            device.send("#interface-changed sensor-list").await;
            let relist = device.expect_line().await;
            assert!(relist.is(MessageKind::Request, "sensor-list"));
            device.send("#sensor-list a A \\@ integer").await;
            device.send("#sensor-list b B \\@ float").await;
            device
                .send(&format!("!sensor-list[{}] ok 2", relist.mid.unwrap()))
                .await;

            let sampling = device.expect_line().await;
            assert!(sampling.is(MessageKind::Request, "sensor-sampling"));
            assert_eq!(sampling.argument(0), Some("b"));
            device
                .send(&format!("!sensor-sampling[{}] ok b auto", sampling.mid.unwrap()))
                .await;
            device
        });

        connection.synchronise().await.unwrap();

        let run = tokio::spawn(async move {
            let result = connection.run(&mut shutdown_rx).await;
            (connection, result)
        });

        let _device = device_task.await.unwrap();

        // Declared a, Subscribed, InterfaceChanged, Declared a, Declared b
        let mut events = Vec::new();
        for _ in 0..5 {
            events.push(rx.recv().await.unwrap());
        }
        assert_eq!(events[2], SensorEvent::InterfaceChanged);
        assert!(matches!(&events[4], SensorEvent::Declared(d) if d.name == "b"));

        shutdown_tx.send(true).unwrap();
        let (connection, result) = run.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(connection.subscribed().len(), 2);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port with nothing listening
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = KatcpConfig {
            host: Some("127.0.0.1".to_string()),
            port: Some(port),
            ..Default::default()
        };
        let (tx, mut rx) = mpsc::channel(10);
        let client = KatcpClient::new(&config, SensorFilter::default(), tx).unwrap();

        let result = client.connect().await;
        assert!(matches!(result, Err(ClientError::Connect { .. })));
        assert_eq!(
            rx.recv().await.unwrap(),
            SensorEvent::StateChanged(ConnectionState::Connecting)
        );
    }

    #[test]
    fn test_client_requires_endpoint() {
        let (tx, _rx) = mpsc::channel(1);
        let result = KatcpClient::new(&KatcpConfig::default(), SensorFilter::default(), tx);
        assert!(matches!(result, Err(ConfigError::Missing("host", _))));
    }
}
