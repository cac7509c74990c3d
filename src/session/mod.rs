use crate::codec;
use crate::protocol::{
    DeviceDescriptor, LinearCmd, Message, MessageId, Ping, RequestDeviceList, RequestServerInfo,
    RotateCmd, RotationSubcommand, ScalarCmd, ScalarSubcommand, ServerInfo, StartScanning,
    StopAllDevices, StopScanning, VectorSubcommand, MAX_MESSAGE_ID, SPONTANEOUS_ID,
};
use crate::registry::MessageKind;
use crate::transport::{Transport, TransportError, TransportEvent};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Fraction of the server's `MaxPingTime` used as the ping period.
const KEEP_ALIVE_MARGIN: f64 = 0.9;

pub type ResponseHandler = Box<dyn FnOnce(Message) + Send>;
pub type EventHandler = Box<dyn FnMut(&SessionEvent) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    AwaitingHandshake,
    Ready,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::AwaitingHandshake => "awaiting_handshake",
            Self::Ready => "ready",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub address: String,
    pub client_name: String,
    pub message_version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect()` or an implicit reconnect.
    Local,
    /// The peer closed the connection or the network dropped it.
    Remote {
        code: u16,
        reason: String,
        clean: bool,
    },
    /// A write failed and the session was torn down.
    TransportFailure(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "closed locally"),
            Self::Remote {
                code,
                reason,
                clean,
            } => write!(f, "closed by peer (code {code}, clean {clean}): {reason}"),
            Self::TransportFailure(msg) => write!(f, "transport failure: {msg}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Message(Message),
    Ready(ServerInfo),
    Disconnected(DisconnectReason),
    ConnectionError(String),
}

impl SessionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Message(message) => EventKind::Message(message.kind()),
            Self::Ready(_) => EventKind::Ready,
            Self::Disconnected(_) => EventKind::Disconnected,
            Self::ConnectionError(_) => EventKind::ConnectionError,
        }
    }
}

/// Subscription key: one per message kind plus the lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Message(MessageKind),
    Ready,
    Disconnected,
    ConnectionError,
}

impl EventKind {
    pub fn all() -> impl Iterator<Item = EventKind> {
        MessageKind::all().map(EventKind::Message).chain([
            EventKind::Ready,
            EventKind::Disconnected,
            EventKind::ConnectionError,
        ])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    NotConnected,
    Transport(TransportError),
    Encode(String),
    /// The session was torn down before the response arrived.
    Cancelled,
    Timeout,
    ConnectionFailed(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "session is not connected"),
            Self::Transport(err) => write!(f, "transport error: {err}"),
            Self::Encode(msg) => write!(f, "encode failed: {msg}"),
            Self::Cancelled => write!(f, "request cancelled by session teardown"),
            Self::Timeout => write!(f, "timed out"),
            Self::ConnectionFailed(msg) => write!(f, "connection failed: {msg}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(err) => Some(err),
            _ => None,
        }
    }
}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        Self::Transport(err)
    }
}

struct KeepAlive {
    period: Duration,
    next_due: Instant,
}

/// Protocol session over a [`Transport`]. Every method is synchronous;
/// the owner feeds it transport events and periodic `tick` calls and must
/// serialize access (one task, or one lock).
pub struct Session<T: Transport> {
    config: SessionConfig,
    transport: T,
    state: SessionState,
    next_id: MessageId,
    pending: HashMap<MessageId, ResponseHandler>,
    keep_alive: Option<KeepAlive>,
    handshake_id: Option<MessageId>,
    server_info: Option<ServerInfo>,
    devices: BTreeMap<u32, DeviceDescriptor>,
    subscribers: HashMap<EventKind, Vec<(SubscriptionId, EventHandler)>>,
    next_subscription: u64,
}

impl<T: Transport> Session<T> {
    pub fn new(config: SessionConfig, transport: T) -> Self {
        Self {
            config,
            transport,
            state: SessionState::Disconnected,
            next_id: 1,
            pending: HashMap::new(),
            keep_alive: None,
            handshake_id: None,
            server_info: None,
            devices: BTreeMap::new(),
            subscribers: HashMap::new(),
            next_subscription: 1,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn has_pending(&self, id: MessageId) -> bool {
        self.pending.contains_key(&id)
    }

    /// Keep-alive period negotiated in the handshake, if the server wants pings.
    pub fn ping_interval(&self) -> Option<Duration> {
        self.keep_alive.as_ref().map(|keep_alive| keep_alive.period)
    }

    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.as_ref()
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceDescriptor> + '_ {
        self.devices.values()
    }

    pub fn device(&self, index: u32) -> Option<&DeviceDescriptor> {
        self.devices.get(&index)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Opens the transport. A session that is not `Disconnected` is torn
    /// down first.
    pub fn connect(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Disconnected {
            tracing::info!(state = %self.state, "connect requested on live session, reconnecting");
            self.disconnect();
        }

        self.next_id = 1;
        self.state = SessionState::Connecting;
        tracing::info!(address = %self.config.address, "connecting");
        if let Err(err) = self.transport.connect(&self.config.address) {
            tracing::warn!(address = %self.config.address, error = %err, "transport connect failed");
            self.reset();
            self.emit(SessionEvent::ConnectionError(err.to_string()));
            return Err(SessionError::Transport(err));
        }
        Ok(())
    }

    /// Stops all devices (best effort), closes the transport and drops
    /// every pending response handler without invoking it.
    pub fn disconnect(&mut self) {
        match self.state {
            SessionState::Disconnected => {
                tracing::warn!("disconnect requested while already disconnected");
                return;
            }
            SessionState::Ready => {
                if let Err(err) = self.stop_all_devices() {
                    tracing::warn!(error = %err, "stop-all on disconnect failed");
                }
            }
            SessionState::Connecting | SessionState::AwaitingHandshake => {}
        }

        // A failed stop-all has already torn the session down.
        if self.state == SessionState::Disconnected {
            return;
        }
        self.transport.close();
        self.teardown(DisconnectReason::Local);
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => self.on_connected(),
            TransportEvent::ConnectionError(reason) => {
                if self.state == SessionState::Disconnected {
                    tracing::debug!(reason = %reason, "ignoring connection error on idle session");
                    return;
                }
                tracing::warn!(reason = %reason, "connection failed");
                self.reset();
                self.emit(SessionEvent::ConnectionError(reason));
            }
            TransportEvent::Closed {
                code,
                reason,
                clean,
            } => {
                if self.state == SessionState::Disconnected {
                    tracing::debug!(code, "transport closed after local teardown");
                    return;
                }
                tracing::info!(code, reason = %reason, clean, "connection closed by peer");
                self.teardown(DisconnectReason::Remote {
                    code,
                    reason,
                    clean,
                });
            }
            TransportEvent::Message(frame) => self.on_frame(&frame),
        }
    }

    /// Sends a `Ping` when the keep-alive is due. Cheap to call often.
    pub fn tick(&mut self, now: Instant) {
        let Some(keep_alive) = self.keep_alive.as_mut() else {
            return;
        };
        if now < keep_alive.next_due {
            return;
        }
        if !self.transport.is_connected() {
            tracing::debug!("transport gone, cancelling keep-alive");
            self.keep_alive = None;
            return;
        }
        keep_alive.next_due = now + keep_alive.period;
        self.send_ping();
    }

    /// Stamps a fresh id into `message` and sends it. The handler, if any,
    /// is registered before the frame leaves and runs once with whatever
    /// terminal response (`Ok`, `Error`, ...) echoes the id.
    pub fn send_request(
        &mut self,
        mut message: Message,
        handler: Option<ResponseHandler>,
    ) -> Result<MessageId, SessionError> {
        let handshake = self.state == SessionState::AwaitingHandshake
            && message.kind() == MessageKind::RequestServerInfo;
        if self.state != SessionState::Ready && !handshake {
            return Err(SessionError::NotConnected);
        }

        let id = self.allocate_id();
        message.set_id(id);
        let frame = codec::encode(&message).map_err(|err| SessionError::Encode(err.to_string()))?;

        if let Some(handler) = handler {
            if self.pending.insert(id, handler).is_some() {
                tracing::warn!(id, "message id reused while a response was outstanding");
            }
        }

        tracing::trace!(id, kind = %message.kind(), "sending");
        if let Err(err) = self.transport.send(frame) {
            tracing::error!(id, error = %err, "send failed, closing session");
            self.transport.close();
            self.teardown(DisconnectReason::TransportFailure(err.to_string()));
            return Err(SessionError::Transport(err));
        }
        Ok(id)
    }

    pub fn subscribe<F>(&mut self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: FnMut(&SessionEvent) + Send + 'static,
    {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.subscribers
            .entry(kind)
            .or_default()
            .push((id, Box::new(handler)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        for handlers in self.subscribers.values_mut() {
            if let Some(pos) = handlers.iter().position(|(sub, _)| *sub == id) {
                handlers.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn request_device_list(
        &mut self,
        handler: Option<ResponseHandler>,
    ) -> Result<MessageId, SessionError> {
        self.send_request(Message::RequestDeviceList(RequestDeviceList::default()), handler)
    }

    pub fn start_scanning(&mut self) -> Result<MessageId, SessionError> {
        self.send_request(Message::StartScanning(StartScanning::default()), None)
    }

    pub fn stop_scanning(&mut self) -> Result<MessageId, SessionError> {
        self.send_request(Message::StopScanning(StopScanning::default()), None)
    }

    pub fn stop_device(&mut self, device_index: u32) -> Result<MessageId, SessionError> {
        self.check_capability(device_index, MessageKind::StopDeviceCmd);
        self.send_request(Message::stop_device(device_index), None)
    }

    pub fn stop_all_devices(&mut self) -> Result<MessageId, SessionError> {
        self.send_request(Message::StopAllDevices(StopAllDevices::default()), None)
    }

    pub fn scalar(
        &mut self,
        device_index: u32,
        scalars: Vec<ScalarSubcommand>,
    ) -> Result<MessageId, SessionError> {
        self.check_capability(device_index, MessageKind::ScalarCmd);
        self.send_request(
            Message::ScalarCmd(ScalarCmd {
                id: 0,
                device_index,
                scalars,
            }),
            None,
        )
    }

    pub fn linear(
        &mut self,
        device_index: u32,
        vectors: Vec<VectorSubcommand>,
    ) -> Result<MessageId, SessionError> {
        self.check_capability(device_index, MessageKind::LinearCmd);
        self.send_request(
            Message::LinearCmd(LinearCmd {
                id: 0,
                device_index,
                vectors,
            }),
            None,
        )
    }

    pub fn rotate(
        &mut self,
        device_index: u32,
        rotations: Vec<RotationSubcommand>,
    ) -> Result<MessageId, SessionError> {
        self.check_capability(device_index, MessageKind::RotateCmd);
        self.send_request(
            Message::RotateCmd(RotateCmd {
                id: 0,
                device_index,
                rotations,
            }),
            None,
        )
    }

    pub fn sensor_read(
        &mut self,
        device_index: u32,
        sensor_index: u32,
        sensor_type: &str,
        handler: Option<ResponseHandler>,
    ) -> Result<MessageId, SessionError> {
        self.sensor_request(MessageKind::SensorReadCmd, device_index, sensor_index, sensor_type, handler)
    }

    pub fn sensor_subscribe(
        &mut self,
        device_index: u32,
        sensor_index: u32,
        sensor_type: &str,
    ) -> Result<MessageId, SessionError> {
        self.sensor_request(MessageKind::SensorSubscribeCmd, device_index, sensor_index, sensor_type, None)
    }

    pub fn sensor_unsubscribe(
        &mut self,
        device_index: u32,
        sensor_index: u32,
        sensor_type: &str,
    ) -> Result<MessageId, SessionError> {
        self.sensor_request(MessageKind::SensorUnsubscribeCmd, device_index, sensor_index, sensor_type, None)
    }

    fn sensor_request(
        &mut self,
        kind: MessageKind,
        device_index: u32,
        sensor_index: u32,
        sensor_type: &str,
        handler: Option<ResponseHandler>,
    ) -> Result<MessageId, SessionError> {
        self.check_capability(device_index, kind);
        let message = Message::sensor(kind, device_index, sensor_index, sensor_type)
            .ok_or_else(|| SessionError::Encode(format!("{kind} is not a sensor command")))?;
        self.send_request(message, handler)
    }

    // The server has the final word; this only makes mismatches visible.
    fn check_capability(&self, device_index: u32, kind: MessageKind) {
        if let Some(device) = self.devices.get(&device_index) {
            if !device.device_messages.accepts(kind) {
                tracing::warn!(
                    device_index,
                    device = %device.display_name(),
                    kind = %kind,
                    "device does not advertise this command"
                );
            }
        }
    }

    fn allocate_id(&mut self) -> MessageId {
        let id = self.next_id;
        self.next_id = if id >= MAX_MESSAGE_ID { 1 } else { id + 1 };
        id
    }

    fn on_connected(&mut self) {
        if self.state != SessionState::Connecting {
            tracing::warn!(state = %self.state, "unexpected connected callback");
            return;
        }
        self.state = SessionState::AwaitingHandshake;
        let request = Message::RequestServerInfo(RequestServerInfo {
            id: 0,
            client_name: self.config.client_name.clone(),
            message_version: self.config.message_version,
        });
        match self.send_request(request, None) {
            Ok(id) => {
                self.handshake_id = Some(id);
                tracing::debug!(id, client_name = %self.config.client_name, "handshake requested");
            }
            Err(err) => tracing::warn!(error = %err, "handshake request failed"),
        }
    }

    fn on_frame(&mut self, frame: &str) {
        let decoded = match codec::decode(frame) {
            Ok(decoded) => decoded,
            Err(err) => {
                tracing::warn!(error = %err, "dropping undecodable frame");
                return;
            }
        };
        for item in decoded {
            match item {
                Ok(message) => self.on_message(message),
                Err(err) => tracing::warn!(error = %err, "dropping message"),
            }
            // A handshake failure mid-batch ends the session; the rest is stale.
            if self.state == SessionState::Disconnected {
                break;
            }
        }
    }

    fn on_message(&mut self, message: Message) {
        self.track_devices(&message);

        let id = message.id();
        if id != SPONTANEOUS_ID {
            if let Some(handler) = self.pending.remove(&id) {
                handler(message.clone());
            } else if !message.kind().is_event() && Some(id) != self.handshake_id {
                tracing::debug!(id, kind = %message.kind(), "no pending request for id");
            }
        }

        // Only the first ServerInfo while awaiting the handshake counts.
        let handshake = match &message {
            _ if self.state != SessionState::AwaitingHandshake => None,
            Message::ServerInfo(info) => Some(Ok(info.clone())),
            Message::Error(err) if Some(err.id) == self.handshake_id => Some(Err(format!(
                "{} ({})",
                err.error_message, err.error_code
            ))),
            _ => None,
        };

        self.emit(SessionEvent::Message(message));

        match handshake {
            Some(Ok(info)) => self.complete_handshake(info),
            Some(Err(reason)) => self.fail_handshake(reason),
            None => {}
        }
    }

    fn complete_handshake(&mut self, info: ServerInfo) {
        self.state = SessionState::Ready;
        self.handshake_id = None;
        if info.message_version < self.config.message_version {
            tracing::warn!(
                requested = self.config.message_version,
                offered = info.message_version,
                "server speaks an older message version"
            );
        }
        tracing::info!(
            server_name = %info.server_name,
            message_version = info.message_version,
            max_ping_time = info.max_ping_time,
            "handshake complete"
        );
        self.server_info = Some(info.clone());

        if info.max_ping_time > 0 {
            let period = Duration::from_millis(u64::from(info.max_ping_time)).mul_f64(KEEP_ALIVE_MARGIN);
            self.keep_alive = Some(KeepAlive {
                period,
                next_due: Instant::now() + period,
            });
            self.send_ping();
        }

        if self.state == SessionState::Ready {
            self.emit(SessionEvent::Ready(info));
        }
    }

    fn fail_handshake(&mut self, reason: String) {
        tracing::error!(reason = %reason, "server rejected handshake");
        self.transport.close();
        self.reset();
        self.emit(SessionEvent::ConnectionError(reason));
    }

    fn send_ping(&mut self) {
        if let Err(err) = self.send_request(Message::Ping(Ping::default()), None) {
            tracing::warn!(error = %err, "keep-alive ping failed");
        }
    }

    fn track_devices(&mut self, message: &Message) {
        match message {
            Message::DeviceList(list) => {
                self.devices = list
                    .devices
                    .iter()
                    .map(|device| (device.device_index, device.clone()))
                    .collect();
                tracing::info!(count = self.devices.len(), "device list received");
            }
            Message::DeviceAdded(added) => {
                tracing::info!(
                    device_index = added.device.device_index,
                    device = %added.device.display_name(),
                    "device added"
                );
                self.devices
                    .insert(added.device.device_index, added.device.clone());
            }
            Message::DeviceRemoved(removed) => {
                tracing::info!(device_index = removed.device_index, "device removed");
                self.devices.remove(&removed.device_index);
            }
            _ => {}
        }
    }

    fn reset(&mut self) {
        if !self.pending.is_empty() {
            tracing::debug!(count = self.pending.len(), "dropping pending response handlers");
        }
        self.state = SessionState::Disconnected;
        self.pending.clear();
        self.keep_alive = None;
        self.handshake_id = None;
        self.server_info = None;
        self.devices.clear();
    }

    fn teardown(&mut self, reason: DisconnectReason) {
        self.reset();
        self.emit(SessionEvent::Disconnected(reason));
    }

    fn emit(&mut self, event: SessionEvent) {
        if let Some(handlers) = self.subscribers.get_mut(&event.kind()) {
            for (_, handler) in handlers.iter_mut() {
                handler(&event);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    pub(crate) struct ScriptedTransport {
        pub sent: Vec<String>,
        pub connected: bool,
        pub connects: Vec<String>,
        pub closes: usize,
        pub fail_sends: bool,
    }

    impl Transport for ScriptedTransport {
        fn connect(&mut self, address: &str) -> Result<(), TransportError> {
            self.connects.push(address.to_string());
            self.connected = true;
            Ok(())
        }

        fn send(&mut self, payload: String) -> Result<(), TransportError> {
            if self.fail_sends {
                return Err(TransportError::Send("broken pipe".to_string()));
            }
            if !self.connected {
                return Err(TransportError::NotConnected);
            }
            self.sent.push(payload);
            Ok(())
        }

        fn close(&mut self) {
            self.connected = false;
            self.closes += 1;
        }

        fn is_connected(&self) -> bool {
            self.connected
        }
    }

    pub(crate) fn config() -> SessionConfig {
        SessionConfig {
            address: "ws://127.0.0.1:12345".to_string(),
            client_name: "Test Client".to_string(),
            message_version: 3,
        }
    }

    pub(crate) fn sent(session: &Session<ScriptedTransport>) -> Vec<Message> {
        session
            .transport()
            .sent
            .iter()
            .flat_map(|frame| codec::decode(frame).unwrap())
            .map(|item| item.unwrap())
            .collect()
    }

    pub(crate) fn deliver(session: &mut Session<ScriptedTransport>, messages: Vec<Message>) {
        let frame = codec::encode_batch(&messages).unwrap();
        session.handle_transport_event(TransportEvent::Message(frame));
    }

    fn server_info(id: MessageId, max_ping_time: u32) -> Message {
        Message::ServerInfo(ServerInfo {
            id,
            server_name: "Test Server".to_string(),
            message_version: 3,
            max_ping_time,
        })
    }

    pub(crate) fn ready_session(max_ping_time: u32) -> Session<ScriptedTransport> {
        let mut session = Session::new(config(), ScriptedTransport::default());
        session.connect().unwrap();
        session.handle_transport_event(TransportEvent::Connected);
        deliver(&mut session, vec![server_info(1, max_ping_time)]);
        assert_eq!(session.state(), SessionState::Ready);
        session
    }

    fn pings(session: &Session<ScriptedTransport>) -> usize {
        sent(session)
            .iter()
            .filter(|message| message.kind() == MessageKind::Ping)
            .count()
    }

    fn record(
        session: &mut Session<ScriptedTransport>,
        kind: EventKind,
    ) -> Arc<Mutex<Vec<SessionEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        session.subscribe(kind, move |event| sink.lock().unwrap().push(event.clone()));
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_sends_request_server_info_on_connect() {
        let mut session = Session::new(config(), ScriptedTransport::default());
        session.connect().unwrap();
        assert_eq!(session.state(), SessionState::Connecting);
        assert_eq!(session.transport().connects, vec!["ws://127.0.0.1:12345"]);

        session.handle_transport_event(TransportEvent::Connected);
        assert_eq!(session.state(), SessionState::AwaitingHandshake);
        assert_eq!(
            sent(&session),
            vec![Message::RequestServerInfo(RequestServerInfo {
                id: 1,
                client_name: "Test Client".to_string(),
                message_version: 3,
            })]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_arms_single_keep_alive() {
        let mut session = Session::new(config(), ScriptedTransport::default());
        let ready = record(&mut session, EventKind::Ready);
        session.connect().unwrap();
        session.handle_transport_event(TransportEvent::Connected);
        deliver(&mut session, vec![server_info(1, 1000)]);

        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.ping_interval(), Some(Duration::from_millis(900)));
        assert_eq!(pings(&session), 1, "ping is sent immediately");
        assert_eq!(ready.lock().unwrap().len(), 1);
        assert_eq!(session.server_info().unwrap().server_name, "Test Server");

        tokio::time::advance(Duration::from_millis(100)).await;
        deliver(&mut session, vec![server_info(0, 1000)]);
        assert_eq!(pings(&session), 1, "late ServerInfo must not re-arm");
        assert_eq!(ready.lock().unwrap().len(), 1);

        tokio::time::advance(Duration::from_millis(700)).await;
        session.tick(Instant::now());
        assert_eq!(pings(&session), 1);

        tokio::time::advance(Duration::from_millis(100)).await;
        session.tick(Instant::now());
        assert_eq!(pings(&session), 2);

        tokio::time::advance(Duration::from_millis(900)).await;
        session.tick(Instant::now());
        session.tick(Instant::now());
        assert_eq!(pings(&session), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_max_ping_time_disables_keep_alive() {
        let mut session = ready_session(0);
        assert_eq!(session.ping_interval(), None);
        tokio::time::advance(Duration::from_secs(10)).await;
        session.tick(Instant::now());
        assert_eq!(pings(&session), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_cancels_when_transport_drops() {
        let mut session = ready_session(500);
        assert_eq!(pings(&session), 1);
        session.transport_mut().connected = false;

        tokio::time::advance(Duration::from_millis(450)).await;
        session.tick(Instant::now());
        assert_eq!(session.ping_interval(), None);
        assert_eq!(pings(&session), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ids_increase_and_never_collide() {
        let mut session = ready_session(0);
        let mut ids = Vec::new();
        for _ in 0..50 {
            ids.push(session.request_device_list(Some(Box::new(|_: Message| {}))).unwrap());
        }
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(ids[0], 2, "handshake consumed id 1");
        assert_eq!(session.pending_count(), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn ids_wrap_to_one_after_max() {
        let mut session = ready_session(0);
        session.next_id = MAX_MESSAGE_ID;
        assert_eq!(session.stop_scanning().unwrap(), MAX_MESSAGE_ID);
        assert_eq!(session.stop_scanning().unwrap(), 1);
        assert_eq!(session.stop_scanning().unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn response_invokes_handler_exactly_once() {
        let mut session = ready_session(0);
        session.next_id = 7;
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        let id = session
            .request_device_list(Some(Box::new(move |msg: Message| sink.lock().unwrap().push(msg))))
            .unwrap();
        assert_eq!(id, 7);
        assert!(session.has_pending(7));

        let reply = Message::DeviceList(DeviceList {
            id: 7,
            devices: vec![],
        });
        deliver(&mut session, vec![reply.clone()]);
        assert_eq!(*calls.lock().unwrap(), vec![reply.clone()]);
        assert!(!session.has_pending(7));

        let broadcast = record(&mut session, EventKind::Message(MessageKind::DeviceList));
        deliver(&mut session, vec![reply]);
        assert_eq!(calls.lock().unwrap().len(), 1, "duplicate echo is not correlated");
        assert_eq!(broadcast.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn error_reply_is_delivered_as_data() {
        let mut session = ready_session(0);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        let id = session
            .send_request(
                Message::stop_device(3),
                Some(Box::new(move |msg: Message| sink.lock().unwrap().push(msg))),
            )
            .unwrap();
        let error = Message::Error(StatusError {
            id,
            error_message: "Device 3 not found".to_string(),
            error_code: ErrorCode::Device,
        });
        deliver(&mut session, vec![error.clone()]);
        assert_eq!(*calls.lock().unwrap(), vec![error]);
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn unsolicited_device_added_reaches_every_subscriber() {
        let mut session = ready_session(0);
        let first = record(&mut session, EventKind::Message(MessageKind::DeviceAdded));
        let second = record(&mut session, EventKind::Message(MessageKind::DeviceAdded));
        let removed = record(&mut session, EventKind::Message(MessageKind::DeviceRemoved));

        let device = DeviceDescriptor {
            device_name: "Vibe".to_string(),
            device_index: 2,
            ..Default::default()
        };
        let added = Message::DeviceAdded(DeviceAdded {
            id: 0,
            device: device.clone(),
        });
        deliver(&mut session, vec![added.clone()]);

        assert_eq!(*first.lock().unwrap(), vec![SessionEvent::Message(added.clone())]);
        assert_eq!(*second.lock().unwrap(), vec![SessionEvent::Message(added)]);
        assert!(removed.lock().unwrap().is_empty());
        assert_eq!(session.device(2), Some(&device));
    }

    #[tokio::test(start_paused = true)]
    async fn roster_follows_list_add_and_remove() {
        let mut session = ready_session(0);
        let device = |index: u32| DeviceDescriptor {
            device_name: format!("Device {index}"),
            device_index: index,
            ..Default::default()
        };
        deliver(
            &mut session,
            vec![
                Message::DeviceList(DeviceList {
                    id: 0,
                    devices: vec![device(0), device(1)],
                }),
                Message::DeviceAdded(DeviceAdded {
                    id: 0,
                    device: device(5),
                }),
                Message::DeviceRemoved(DeviceRemoved {
                    id: 0,
                    device_index: 0,
                }),
            ],
        );
        let indices: Vec<u32> = session.devices().map(|d| d.device_index).collect();
        assert_eq!(indices, vec![1, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_is_processed_in_array_order() {
        let mut session = ready_session(0);
        let log = Arc::new(Mutex::new(Vec::new()));

        let sink = log.clone();
        let id = session
            .request_device_list(Some(Box::new(move |_: Message| sink.lock().unwrap().push("response"))))
            .unwrap();
        let sink = log.clone();
        session.subscribe(EventKind::Message(MessageKind::DeviceAdded), move |_| {
            sink.lock().unwrap().push("added")
        });
        let sink = log.clone();
        session.subscribe(EventKind::Message(MessageKind::ScanningFinished), move |_| {
            sink.lock().unwrap().push("finished")
        });

        let frame = format!(
            r#"[{{"ScanningFinished":{{"Id":0}}}},{{"Bogus":{{"Id":0}}}},
               {{"DeviceList":{{"Id":{id},"Devices":[]}}}},
               {{"DeviceAdded":{{"Id":0,"DeviceName":"X","DeviceIndex":1,"DeviceMessages":{{}}}}}}]"#
        );
        session.handle_transport_event(TransportEvent::Message(frame));
        assert_eq!(*log.lock().unwrap(), vec!["finished", "response", "added"]);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_clears_pending_without_invoking() {
        let mut session = ready_session(1000);
        let disconnected = record(&mut session, EventKind::Disconnected);
        let invoked = Arc::new(Mutex::new(false));
        let flag = invoked.clone();
        let id = session
            .request_device_list(Some(Box::new(move |_: Message| *flag.lock().unwrap() = true)))
            .unwrap();

        session.disconnect();
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(session.pending_count(), 0);
        assert_eq!(session.ping_interval(), None);
        assert_eq!(session.transport().closes, 1);
        assert_eq!(
            sent(&session).last().map(Message::kind),
            Some(MessageKind::StopAllDevices)
        );
        assert_eq!(
            *disconnected.lock().unwrap(),
            vec![SessionEvent::Disconnected(DisconnectReason::Local)]
        );

        // A late reply and the transport's own close notice change nothing.
        session.handle_transport_event(TransportEvent::Message(
            codec::encode(&Message::DeviceList(DeviceList { id, devices: vec![] })).unwrap(),
        ));
        session.handle_transport_event(TransportEvent::Closed {
            code: 1000,
            reason: String::new(),
            clean: true,
        });
        assert!(!*invoked.lock().unwrap());
        assert_eq!(disconnected.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_when_idle_is_a_no_op() {
        let mut session = Session::new(config(), ScriptedTransport::default());
        let disconnected = record(&mut session, EventKind::Disconnected);
        session.disconnect();
        assert_eq!(session.transport().closes, 0);
        assert!(disconnected.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn send_outside_ready_is_rejected_without_side_effects() {
        let mut session = Session::new(config(), ScriptedTransport::default());
        assert_eq!(session.stop_all_devices(), Err(SessionError::NotConnected));

        session.connect().unwrap();
        session.handle_transport_event(TransportEvent::Connected);
        assert_eq!(
            session.request_device_list(Some(Box::new(|_: Message| {}))),
            Err(SessionError::NotConnected)
        );
        assert_eq!(session.pending_count(), 0);
        assert_eq!(sent(&session).len(), 1, "only the handshake went out");

        deliver(&mut session, vec![server_info(1, 0)]);
        assert_eq!(session.start_scanning(), Ok(2));
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_error_reports_connection_error() {
        let mut session = Session::new(config(), ScriptedTransport::default());
        let errors = record(&mut session, EventKind::ConnectionError);
        session.connect().unwrap();
        session.handle_transport_event(TransportEvent::Connected);
        deliver(
            &mut session,
            vec![Message::Error(StatusError {
                id: 1,
                error_message: "Client name rejected".to_string(),
                error_code: ErrorCode::Init,
            })],
        );

        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(session.transport().closes, 1);
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        match &errors[0] {
            SessionEvent::ConnectionError(reason) => assert!(reason.contains("Client name rejected")),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transport_connection_error_surfaces() {
        let mut session = Session::new(config(), ScriptedTransport::default());
        let errors = record(&mut session, EventKind::ConnectionError);
        session.connect().unwrap();
        session.handle_transport_event(TransportEvent::ConnectionError("refused".to_string()));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(
            *errors.lock().unwrap(),
            vec![SessionEvent::ConnectionError("refused".to_string())]
        );
        assert_eq!(session.transport().connects.len(), 1, "no automatic retry");
    }

    #[tokio::test(start_paused = true)]
    async fn peer_close_tears_down_and_notifies() {
        let mut session = ready_session(1000);
        let disconnected = record(&mut session, EventKind::Disconnected);
        session.handle_transport_event(TransportEvent::Closed {
            code: 1001,
            reason: "server shutting down".to_string(),
            clean: true,
        });
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(session.ping_interval(), None);
        assert_eq!(session.devices().count(), 0);
        assert_eq!(
            *disconnected.lock().unwrap(),
            vec![SessionEvent::Disconnected(DisconnectReason::Remote {
                code: 1001,
                reason: "server shutting down".to_string(),
                clean: true,
            })]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_send_forces_disconnect() {
        let mut session = ready_session(0);
        let disconnected = record(&mut session, EventKind::Disconnected);
        session.transport_mut().fail_sends = true;
        let result = session.start_scanning();
        assert!(matches!(result, Err(SessionError::Transport(TransportError::Send(_)))));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(matches!(
            disconnected.lock().unwrap()[0],
            SessionEvent::Disconnected(DisconnectReason::TransportFailure(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_while_ready_reconnects() {
        let mut session = ready_session(0);
        session.connect().unwrap();
        assert_eq!(session.state(), SessionState::Connecting);
        assert_eq!(session.transport().connects.len(), 2);
        assert_eq!(session.transport().closes, 1);
        assert!(sent(&session)
            .iter()
            .any(|message| message.kind() == MessageKind::StopAllDevices));

        session.handle_transport_event(TransportEvent::Connected);
        assert_eq!(sent(&session).last().map(Message::id), Some(1), "ids restart per connection");
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_stops_delivery() {
        let mut session = ready_session(0);
        let seen = Arc::new(Mutex::new(0));
        let sink = seen.clone();
        let sub = session.subscribe(EventKind::Message(MessageKind::ScanningFinished), move |_| {
            *sink.lock().unwrap() += 1
        });
        deliver(&mut session, vec![Message::ScanningFinished(ScanningFinished { id: 0 })]);
        assert!(session.unsubscribe(sub));
        assert!(!session.unsubscribe(sub));
        deliver(&mut session, vec![Message::ScanningFinished(ScanningFinished { id: 0 })]);
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sensor_helpers_build_the_right_tags() {
        let mut session = ready_session(0);
        session.sensor_read(1, 0, "Battery", None).unwrap();
        session.sensor_subscribe(1, 2, "Pressure").unwrap();
        session.sensor_unsubscribe(1, 2, "Pressure").unwrap();
        let kinds: Vec<MessageKind> = sent(&session).iter().map(Message::kind).collect();
        assert_eq!(
            &kinds[kinds.len() - 3..],
            &[
                MessageKind::SensorReadCmd,
                MessageKind::SensorSubscribeCmd,
                MessageKind::SensorUnsubscribeCmd
            ]
        );
    }
}
