use crate::protocol::Message;
use serde_json::Value;
use std::fmt;

/// Protocol message version the table below was written against. Adding a type
/// means editing the table, never inferring one from inbound data.
pub const REGISTRY_VERSION: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKind {
    Ok,
    Error,
    Ping,
    RequestServerInfo,
    ServerInfo,
    StartScanning,
    StopScanning,
    ScanningFinished,
    RequestDeviceList,
    DeviceList,
    DeviceAdded,
    DeviceRemoved,
    StopDeviceCmd,
    StopAllDevices,
    ScalarCmd,
    LinearCmd,
    RotateCmd,
    SensorReadCmd,
    SensorReading,
    SensorSubscribeCmd,
    SensorUnsubscribeCmd,
}

type PayloadDecoder = fn(Value) -> serde_json::Result<Message>;

struct Entry {
    tag: &'static str,
    kind: MessageKind,
    decode: PayloadDecoder,
}

static REGISTRY: [Entry; 21] = [
    Entry {
        tag: "Ok",
        kind: MessageKind::Ok,
        decode: |v| serde_json::from_value(v).map(Message::Ok),
    },
    Entry {
        tag: "Error",
        kind: MessageKind::Error,
        decode: |v| serde_json::from_value(v).map(Message::Error),
    },
    Entry {
        tag: "Ping",
        kind: MessageKind::Ping,
        decode: |v| serde_json::from_value(v).map(Message::Ping),
    },
    Entry {
        tag: "RequestServerInfo",
        kind: MessageKind::RequestServerInfo,
        decode: |v| serde_json::from_value(v).map(Message::RequestServerInfo),
    },
    Entry {
        tag: "ServerInfo",
        kind: MessageKind::ServerInfo,
        decode: |v| serde_json::from_value(v).map(Message::ServerInfo),
    },
    Entry {
        tag: "StartScanning",
        kind: MessageKind::StartScanning,
        decode: |v| serde_json::from_value(v).map(Message::StartScanning),
    },
    Entry {
        tag: "StopScanning",
        kind: MessageKind::StopScanning,
        decode: |v| serde_json::from_value(v).map(Message::StopScanning),
    },
    Entry {
        tag: "ScanningFinished",
        kind: MessageKind::ScanningFinished,
        decode: |v| serde_json::from_value(v).map(Message::ScanningFinished),
    },
    Entry {
        tag: "RequestDeviceList",
        kind: MessageKind::RequestDeviceList,
        decode: |v| serde_json::from_value(v).map(Message::RequestDeviceList),
    },
    Entry {
        tag: "DeviceList",
        kind: MessageKind::DeviceList,
        decode: |v| serde_json::from_value(v).map(Message::DeviceList),
    },
    Entry {
        tag: "DeviceAdded",
        kind: MessageKind::DeviceAdded,
        decode: |v| serde_json::from_value(v).map(Message::DeviceAdded),
    },
    Entry {
        tag: "DeviceRemoved",
        kind: MessageKind::DeviceRemoved,
        decode: |v| serde_json::from_value(v).map(Message::DeviceRemoved),
    },
    Entry {
        tag: "StopDeviceCmd",
        kind: MessageKind::StopDeviceCmd,
        decode: |v| serde_json::from_value(v).map(Message::StopDeviceCmd),
    },
    Entry {
        tag: "StopAllDevices",
        kind: MessageKind::StopAllDevices,
        decode: |v| serde_json::from_value(v).map(Message::StopAllDevices),
    },
    Entry {
        tag: "ScalarCmd",
        kind: MessageKind::ScalarCmd,
        decode: |v| serde_json::from_value(v).map(Message::ScalarCmd),
    },
    Entry {
        tag: "LinearCmd",
        kind: MessageKind::LinearCmd,
        decode: |v| serde_json::from_value(v).map(Message::LinearCmd),
    },
    Entry {
        tag: "RotateCmd",
        kind: MessageKind::RotateCmd,
        decode: |v| serde_json::from_value(v).map(Message::RotateCmd),
    },
    Entry {
        tag: "SensorReadCmd",
        kind: MessageKind::SensorReadCmd,
        decode: |v| serde_json::from_value(v).map(Message::SensorReadCmd),
    },
    Entry {
        tag: "SensorReading",
        kind: MessageKind::SensorReading,
        decode: |v| serde_json::from_value(v).map(Message::SensorReading),
    },
    Entry {
        tag: "SensorSubscribeCmd",
        kind: MessageKind::SensorSubscribeCmd,
        decode: |v| serde_json::from_value(v).map(Message::SensorSubscribeCmd),
    },
    Entry {
        tag: "SensorUnsubscribeCmd",
        kind: MessageKind::SensorUnsubscribeCmd,
        decode: |v| serde_json::from_value(v).map(Message::SensorUnsubscribeCmd),
    },
];

impl MessageKind {
    pub fn all() -> impl Iterator<Item = MessageKind> {
        REGISTRY.iter().map(|entry| entry.kind)
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        lookup(tag).map(|entry| entry.kind)
    }

    pub fn tag(self) -> &'static str {
        // Table order follows the enum declaration.
        REGISTRY[self as usize].tag
    }

    /// Server-to-client kinds that may arrive without a matching request.
    pub fn is_event(self) -> bool {
        matches!(
            self,
            Self::DeviceAdded | Self::DeviceRemoved | Self::ScanningFinished | Self::SensorReading
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

fn lookup(tag: &str) -> Option<&'static Entry> {
    REGISTRY.iter().find(|entry| entry.tag == tag)
}

/// Decodes the payload object that sat under `kind`'s tag.
pub fn decode_payload(kind: MessageKind, payload: Value) -> serde_json::Result<Message> {
    (REGISTRY[kind as usize].decode)(payload)
}
