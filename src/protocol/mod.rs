//! Buttplug message set (protocol version 3).
//!
//! Every payload struct serializes with PascalCase field names, and the
//! [`Message`] enum is externally tagged, so a message renders on the wire as
//! `{"<Tag>": {"Id": 1, ...}}`.

use crate::registry::MessageKind;
use serde::{Deserialize, Serialize};
use std::fmt;

pub type MessageId = u32;

/// Reserved for server-originated events that answer no request.
pub const SPONTANEOUS_ID: MessageId = 0;
/// Ids wrap back to 1 after this value.
pub const MAX_MESSAGE_ID: MessageId = i32::MAX as MessageId;
pub const DEFAULT_MESSAGE_VERSION: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum ErrorCode {
    Unknown,
    /// Handshake did not succeed.
    Init,
    /// A ping was not sent in the expected time.
    Ping,
    /// A message parsing or permission error occurred.
    Message,
    /// A command sent to a device returned an error.
    Device,
}

impl From<u8> for ErrorCode {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Init,
            2 => Self::Ping,
            3 => Self::Message,
            4 => Self::Device,
            _ => Self::Unknown,
        }
    }
}

impl From<ErrorCode> for u8 {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::Unknown => 0,
            ErrorCode::Init => 1,
            ErrorCode::Ping => 2,
            ErrorCode::Message => 3,
            ErrorCode::Device => 4,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::Init => "init",
            Self::Ping => "ping",
            Self::Message => "message",
            Self::Device => "device",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatusOk {
    pub id: MessageId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatusError {
    pub id: MessageId,
    pub error_message: String,
    pub error_code: ErrorCode,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Ping {
    pub id: MessageId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RequestServerInfo {
    pub id: MessageId,
    pub client_name: String,
    pub message_version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServerInfo {
    pub id: MessageId,
    pub server_name: String,
    pub message_version: u32,
    /// Milliseconds; 0 disables the server's ping requirement.
    pub max_ping_time: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StartScanning {
    pub id: MessageId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StopScanning {
    pub id: MessageId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ScanningFinished {
    pub id: MessageId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RequestDeviceList {
    pub id: MessageId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceList {
    pub id: MessageId,
    pub devices: Vec<DeviceDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceAdded {
    pub id: MessageId,
    #[serde(flatten)]
    pub device: DeviceDescriptor,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceRemoved {
    pub id: MessageId,
    pub device_index: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StopDeviceCmd {
    pub id: MessageId,
    pub device_index: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StopAllDevices {
    pub id: MessageId,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ScalarCmd {
    pub id: MessageId,
    pub device_index: u32,
    pub scalars: Vec<ScalarSubcommand>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LinearCmd {
    pub id: MessageId,
    pub device_index: u32,
    pub vectors: Vec<VectorSubcommand>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RotateCmd {
    pub id: MessageId,
    pub device_index: u32,
    pub rotations: Vec<RotationSubcommand>,
}

/// Shared body of `SensorReadCmd`, `SensorSubscribeCmd` and `SensorUnsubscribeCmd`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SensorCommand {
    pub id: MessageId,
    pub device_index: u32,
    pub sensor_index: u32,
    pub sensor_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SensorReading {
    pub id: MessageId,
    pub device_index: u32,
    pub sensor_index: u32,
    pub sensor_type: String,
    pub data: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ScalarSubcommand {
    pub index: u32,
    pub scalar: f64,
    pub actuator_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VectorSubcommand {
    pub index: u32,
    /// Milliseconds to reach `position`.
    pub duration: u32,
    pub position: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RotationSubcommand {
    pub index: u32,
    pub speed: f64,
    pub clockwise: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceDescriptor {
    pub device_name: String,
    pub device_index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_message_timing_gap: Option<u32>,
    #[serde(default)]
    pub device_messages: DeviceMessages,
}

impl DeviceDescriptor {
    pub fn display_name(&self) -> &str {
        self.device_display_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(&self.device_name)
    }
}

/// Which commands a device accepts, keyed on the wire by the command tag.
/// Attribute kinds this client does not model (raw endpoints, for one) are
/// ignored on decode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceMessages {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scalar_cmd: Option<Vec<ActuatorAttributes>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linear_cmd: Option<Vec<ActuatorAttributes>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotate_cmd: Option<Vec<ActuatorAttributes>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_read_cmd: Option<Vec<SensorAttributes>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_subscribe_cmd: Option<Vec<SensorAttributes>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_device_cmd: Option<StopDeviceAttributes>,
}

impl DeviceMessages {
    pub fn accepts(&self, kind: MessageKind) -> bool {
        match kind {
            MessageKind::ScalarCmd => self.scalar_cmd.is_some(),
            MessageKind::LinearCmd => self.linear_cmd.is_some(),
            MessageKind::RotateCmd => self.rotate_cmd.is_some(),
            MessageKind::SensorReadCmd => self.sensor_read_cmd.is_some(),
            MessageKind::SensorSubscribeCmd | MessageKind::SensorUnsubscribeCmd => {
                self.sensor_subscribe_cmd.is_some()
            }
            MessageKind::StopDeviceCmd => self.stop_device_cmd.is_some(),
            _ => false,
        }
    }

    pub fn actuators(&self, kind: MessageKind) -> &[ActuatorAttributes] {
        let attrs = match kind {
            MessageKind::ScalarCmd => &self.scalar_cmd,
            MessageKind::LinearCmd => &self.linear_cmd,
            MessageKind::RotateCmd => &self.rotate_cmd,
            _ => return &[],
        };
        attrs.as_deref().unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ActuatorAttributes {
    #[serde(default)]
    pub feature_descriptor: String,
    pub step_count: u32,
    pub actuator_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SensorAttributes {
    #[serde(default)]
    pub feature_descriptor: String,
    pub sensor_type: String,
    #[serde(default)]
    pub sensor_range: Vec<[i32; 2]>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopDeviceAttributes {}

/// The closed set of protocol messages. Variant names double as wire tags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Ok(StatusOk),
    Error(StatusError),
    Ping(Ping),
    RequestServerInfo(RequestServerInfo),
    ServerInfo(ServerInfo),
    StartScanning(StartScanning),
    StopScanning(StopScanning),
    ScanningFinished(ScanningFinished),
    RequestDeviceList(RequestDeviceList),
    DeviceList(DeviceList),
    DeviceAdded(DeviceAdded),
    DeviceRemoved(DeviceRemoved),
    StopDeviceCmd(StopDeviceCmd),
    StopAllDevices(StopAllDevices),
    ScalarCmd(ScalarCmd),
    LinearCmd(LinearCmd),
    RotateCmd(RotateCmd),
    SensorReadCmd(SensorCommand),
    SensorReading(SensorReading),
    SensorSubscribeCmd(SensorCommand),
    SensorUnsubscribeCmd(SensorCommand),
}

impl Message {
    pub fn id(&self) -> MessageId {
        match self {
            Self::Ok(m) => m.id,
            Self::Error(m) => m.id,
            Self::Ping(m) => m.id,
            Self::RequestServerInfo(m) => m.id,
            Self::ServerInfo(m) => m.id,
            Self::StartScanning(m) => m.id,
            Self::StopScanning(m) => m.id,
            Self::ScanningFinished(m) => m.id,
            Self::RequestDeviceList(m) => m.id,
            Self::DeviceList(m) => m.id,
            Self::DeviceAdded(m) => m.id,
            Self::DeviceRemoved(m) => m.id,
            Self::StopDeviceCmd(m) => m.id,
            Self::StopAllDevices(m) => m.id,
            Self::ScalarCmd(m) => m.id,
            Self::LinearCmd(m) => m.id,
            Self::RotateCmd(m) => m.id,
            Self::SensorReadCmd(m) | Self::SensorSubscribeCmd(m) | Self::SensorUnsubscribeCmd(m) => {
                m.id
            }
            Self::SensorReading(m) => m.id,
        }
    }

    pub fn set_id(&mut self, id: MessageId) {
        let slot = match self {
            Self::Ok(m) => &mut m.id,
            Self::Error(m) => &mut m.id,
            Self::Ping(m) => &mut m.id,
            Self::RequestServerInfo(m) => &mut m.id,
            Self::ServerInfo(m) => &mut m.id,
            Self::StartScanning(m) => &mut m.id,
            Self::StopScanning(m) => &mut m.id,
            Self::ScanningFinished(m) => &mut m.id,
            Self::RequestDeviceList(m) => &mut m.id,
            Self::DeviceList(m) => &mut m.id,
            Self::DeviceAdded(m) => &mut m.id,
            Self::DeviceRemoved(m) => &mut m.id,
            Self::StopDeviceCmd(m) => &mut m.id,
            Self::StopAllDevices(m) => &mut m.id,
            Self::ScalarCmd(m) => &mut m.id,
            Self::LinearCmd(m) => &mut m.id,
            Self::RotateCmd(m) => &mut m.id,
            Self::SensorReadCmd(m) | Self::SensorSubscribeCmd(m) | Self::SensorUnsubscribeCmd(m) => {
                &mut m.id
            }
            Self::SensorReading(m) => &mut m.id,
        };
        *slot = id;
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Ok(_) => MessageKind::Ok,
            Self::Error(_) => MessageKind::Error,
            Self::Ping(_) => MessageKind::Ping,
            Self::RequestServerInfo(_) => MessageKind::RequestServerInfo,
            Self::ServerInfo(_) => MessageKind::ServerInfo,
            Self::StartScanning(_) => MessageKind::StartScanning,
            Self::StopScanning(_) => MessageKind::StopScanning,
            Self::ScanningFinished(_) => MessageKind::ScanningFinished,
            Self::RequestDeviceList(_) => MessageKind::RequestDeviceList,
            Self::DeviceList(_) => MessageKind::DeviceList,
            Self::DeviceAdded(_) => MessageKind::DeviceAdded,
            Self::DeviceRemoved(_) => MessageKind::DeviceRemoved,
            Self::StopDeviceCmd(_) => MessageKind::StopDeviceCmd,
            Self::StopAllDevices(_) => MessageKind::StopAllDevices,
            Self::ScalarCmd(_) => MessageKind::ScalarCmd,
            Self::LinearCmd(_) => MessageKind::LinearCmd,
            Self::RotateCmd(_) => MessageKind::RotateCmd,
            Self::SensorReadCmd(_) => MessageKind::SensorReadCmd,
            Self::SensorReading(_) => MessageKind::SensorReading,
            Self::SensorSubscribeCmd(_) => MessageKind::SensorSubscribeCmd,
            Self::SensorUnsubscribeCmd(_) => MessageKind::SensorUnsubscribeCmd,
        }
    }

    pub fn stop_device(device_index: u32) -> Self {
        Self::StopDeviceCmd(StopDeviceCmd {
            id: 0,
            device_index,
        })
    }

    pub fn sensor(kind: MessageKind, device_index: u32, sensor_index: u32, sensor_type: &str) -> Option<Self> {
        let body = SensorCommand {
            id: 0,
            device_index,
            sensor_index,
            sensor_type: sensor_type.to_string(),
        };
        match kind {
            MessageKind::SensorReadCmd => Some(Self::SensorReadCmd(body)),
            MessageKind::SensorSubscribeCmd => Some(Self::SensorSubscribeCmd(body)),
            MessageKind::SensorUnsubscribeCmd => Some(Self::SensorUnsubscribeCmd(body)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_maps_unknown_values_to_unknown() {
        assert_eq!(ErrorCode::from(3), ErrorCode::Message);
        assert_eq!(ErrorCode::from(42), ErrorCode::Unknown);
        assert_eq!(u8::from(ErrorCode::Device), 4);
    }

    #[test]
    fn set_id_rewrites_shared_sensor_body() {
        let mut msg = Message::sensor(MessageKind::SensorSubscribeCmd, 2, 0, "Battery").unwrap();
        msg.set_id(17);
        assert_eq!(msg.id(), 17);
        assert_eq!(msg.kind(), MessageKind::SensorSubscribeCmd);
    }

    #[test]
    fn display_name_falls_back_to_device_name() {
        let mut device = DeviceDescriptor {
            device_name: "Lovense Hush".to_string(),
            ..Default::default()
        };
        assert_eq!(device.display_name(), "Lovense Hush");
        device.device_display_name = Some("  ".to_string());
        assert_eq!(device.display_name(), "Lovense Hush");
        device.device_display_name = Some("Bedroom".to_string());
        assert_eq!(device.display_name(), "Bedroom");
    }

    #[test]
    fn device_messages_report_accepted_commands() {
        let messages = DeviceMessages {
            scalar_cmd: Some(vec![ActuatorAttributes {
                feature_descriptor: "Clitoral Stimulator".to_string(),
                step_count: 20,
                actuator_type: "Vibrate".to_string(),
            }]),
            stop_device_cmd: Some(StopDeviceAttributes {}),
            ..Default::default()
        };
        assert!(messages.accepts(MessageKind::ScalarCmd));
        assert!(messages.accepts(MessageKind::StopDeviceCmd));
        assert!(!messages.accepts(MessageKind::RotateCmd));
        assert_eq!(messages.actuators(MessageKind::ScalarCmd).len(), 1);
        assert!(messages.actuators(MessageKind::LinearCmd).is_empty());
    }
}
