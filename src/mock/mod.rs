//! In-process stand-in for an Intiface server, for local runs and tests.

use crate::codec;
use crate::protocol::{
    ActuatorAttributes, DeviceAdded, DeviceDescriptor, DeviceList, DeviceMessages, ErrorCode,
    Message, MessageId, ScanningFinished, SensorAttributes, SensorReading, ServerInfo, StatusError,
    StatusOk, StopDeviceAttributes, DEFAULT_MESSAGE_VERSION, SPONTANEOUS_ID,
};
use crate::registry::MessageKind;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::TcpListener;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct MockOptions {
    pub server_name: String,
    pub max_ping_time: u32,
    pub devices: Vec<DeviceDescriptor>,
    /// Requests of these kinds are swallowed without a reply.
    pub ignore: Vec<MessageKind>,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            server_name: "Mock Intiface".to_string(),
            max_ping_time: 0,
            devices: vec![simulated_vibrator(0)],
            ignore: Vec::new(),
        }
    }
}

pub fn simulated_vibrator(device_index: u32) -> DeviceDescriptor {
    DeviceDescriptor {
        device_name: "Simulated Vibrator".to_string(),
        device_index,
        device_display_name: None,
        device_message_timing_gap: Some(50),
        device_messages: DeviceMessages {
            scalar_cmd: Some(vec![ActuatorAttributes {
                feature_descriptor: "Motor".to_string(),
                step_count: 20,
                actuator_type: "Vibrate".to_string(),
            }]),
            sensor_read_cmd: Some(vec![SensorAttributes {
                feature_descriptor: "Battery Level".to_string(),
                sensor_type: "Battery".to_string(),
                sensor_range: vec![[0, 100]],
            }]),
            stop_device_cmd: Some(StopDeviceAttributes {}),
            ..Default::default()
        },
    }
}

#[derive(Clone)]
pub struct MockServer {
    options: Arc<MockOptions>,
    received: Arc<Mutex<Vec<Message>>>,
}

impl MockServer {
    pub fn new(options: MockOptions) -> Self {
        Self {
            options: Arc::new(options),
            received: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every well-formed message received so far, across connections.
    pub fn received(&self) -> Vec<Message> {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(ws_handler))
            .with_state(self.clone())
    }

    pub async fn serve(
        self,
        listener: TcpListener,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let app = self.router();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            })
            .await?;
        Ok(())
    }

    /// Replies for one inbound frame, in order.
    pub fn respond_frame(&self, frame: &str) -> Vec<Message> {
        let decoded = match codec::decode(frame) {
            Ok(decoded) => decoded,
            Err(err) => return vec![error(SPONTANEOUS_ID, ErrorCode::Message, err.to_string())],
        };
        let mut replies = Vec::new();
        for item in decoded {
            match item {
                Ok(message) => {
                    self.received
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(message.clone());
                    replies.extend(respond(&self.options, &message));
                }
                Err(err) => {
                    replies.push(error(SPONTANEOUS_ID, ErrorCode::Message, err.to_string()));
                }
            }
        }
        replies
    }
}

fn error(id: MessageId, error_code: ErrorCode, error_message: String) -> Message {
    Message::Error(StatusError {
        id,
        error_message,
        error_code,
    })
}

fn ok(id: MessageId) -> Message {
    Message::Ok(StatusOk { id })
}

pub fn respond(options: &MockOptions, message: &Message) -> Vec<Message> {
    let id = message.id();
    if options.ignore.contains(&message.kind()) {
        return Vec::new();
    }
    let known = |device_index: u32| options.devices.iter().any(|d| d.device_index == device_index);
    let unknown_device = |device_index: u32| {
        error(
            id,
            ErrorCode::Device,
            format!("Device index {device_index} does not exist"),
        )
    };

    match message {
        Message::RequestServerInfo(request) => vec![Message::ServerInfo(ServerInfo {
            id,
            server_name: options.server_name.clone(),
            message_version: request.message_version.min(DEFAULT_MESSAGE_VERSION),
            max_ping_time: options.max_ping_time,
        })],
        Message::RequestDeviceList(_) => vec![Message::DeviceList(DeviceList {
            id,
            devices: options.devices.clone(),
        })],
        Message::StartScanning(_) => {
            let mut replies = vec![ok(id)];
            replies.extend(options.devices.iter().map(|device| {
                Message::DeviceAdded(DeviceAdded {
                    id: SPONTANEOUS_ID,
                    device: device.clone(),
                })
            }));
            replies.push(Message::ScanningFinished(ScanningFinished { id: SPONTANEOUS_ID }));
            replies
        }
        Message::Ping(_) | Message::StopScanning(_) | Message::StopAllDevices(_) => vec![ok(id)],
        Message::StopDeviceCmd(cmd) if !known(cmd.device_index) => vec![unknown_device(cmd.device_index)],
        Message::ScalarCmd(cmd) if !known(cmd.device_index) => vec![unknown_device(cmd.device_index)],
        Message::LinearCmd(cmd) if !known(cmd.device_index) => vec![unknown_device(cmd.device_index)],
        Message::RotateCmd(cmd) if !known(cmd.device_index) => vec![unknown_device(cmd.device_index)],
        Message::StopDeviceCmd(_)
        | Message::ScalarCmd(_)
        | Message::LinearCmd(_)
        | Message::RotateCmd(_) => vec![ok(id)],
        Message::SensorReadCmd(cmd)
        | Message::SensorSubscribeCmd(cmd)
        | Message::SensorUnsubscribeCmd(cmd)
            if !known(cmd.device_index) =>
        {
            vec![unknown_device(cmd.device_index)]
        }
        Message::SensorReadCmd(cmd) => vec![Message::SensorReading(SensorReading {
            id,
            device_index: cmd.device_index,
            sensor_index: cmd.sensor_index,
            sensor_type: cmd.sensor_type.clone(),
            data: vec![100],
        })],
        Message::SensorSubscribeCmd(_) | Message::SensorUnsubscribeCmd(_) => vec![ok(id)],
        other => vec![error(
            id,
            ErrorCode::Message,
            format!("{} is not a client message", other.kind()),
        )],
    }
}

async fn ws_handler(State(server): State<MockServer>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, server))
}

async fn handle_socket(mut socket: WebSocket, server: MockServer) {
    tracing::info!("mock client connected");
    while let Some(Ok(msg)) = socket.recv().await {
        let frame = match msg {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => break,
            _ => continue,
        };
        let replies = server.respond_frame(&frame);
        if replies.is_empty() {
            continue;
        }
        let payload = match codec::encode_batch(&replies) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(error = %err, "mock reply encode failed");
                continue;
            }
        };
        if socket.send(WsMessage::Text(payload)).await.is_err() {
            break;
        }
    }
    tracing::info!("mock client disconnected");
}
