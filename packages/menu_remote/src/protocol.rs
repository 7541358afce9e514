//! Menu command vocabulary shared by both ends of a connection.
//!
//! Every command is one variant of `MenuCommand`. Values inside `Change`
//! travel as wire strings (see `MenuValue::to_wire`); boot commands carry the
//! full item definition plus its typed current value.

use std::fmt;

use menu_tree::{ItemKind, MenuId, MenuItem, MenuValue};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Protocol revision sent in `Join`.
pub const API_VERSION: u16 = 1;

/// Heartbeat period used when the peer has not declared one.
pub const DEFAULT_HEARTBEAT_FREQUENCY_MS: u64 = 1500;

/// Token pairing a request with its acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub u32);

impl CorrelationId {
    /// Marks unsolicited commands that expect no acknowledgement.
    pub const EMPTY: CorrelationId = CorrelationId(0);

    /// A fresh random id, never `EMPTY`.
    pub fn new_random() -> Self {
        loop {
            let raw: u32 = rand::random();
            if raw != 0 {
                return CorrelationId(raw);
            }
        }
    }

    pub fn is_empty(self) -> bool {
        self == Self::EMPTY
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Result code carried by `Ack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub enum AckStatus {
    Success,
    ValueRangeWarning,
    InvalidCredentials,
    UnknownError,
    IdNotFound,
}

impl AckStatus {
    pub fn code(self) -> u32 {
        match self {
            Self::Success => 0,
            Self::ValueRangeWarning => 1,
            Self::InvalidCredentials => 10000,
            Self::UnknownError => 10001,
            Self::IdNotFound => 10002,
        }
    }

    /// Codes from 10000 upwards are errors; lower codes are success or
    /// warnings.
    pub fn is_error(self) -> bool {
        self.code() >= 10000
    }
}

impl From<u32> for AckStatus {
    fn from(code: u32) -> Self {
        match code {
            0 => Self::Success,
            1 => Self::ValueRangeWarning,
            10000 => Self::InvalidCredentials,
            10002 => Self::IdNotFound,
            _ => Self::UnknownError,
        }
    }
}

impl From<AckStatus> for u32 {
    fn from(status: AckStatus) -> Self {
        status.code()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatMode {
    Start,
    Normal,
    /// Graceful close announced by the sender.
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapMode {
    Start,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Delta,
    Absolute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialogMode {
    Show,
    Action,
    Hide,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MenuButtonType {
    Ok,
    Accept,
    Cancel,
    Close,
    /// Slot left empty.
    #[default]
    None,
}

/// Payload of every boot command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootItem {
    pub parent_id: MenuId,
    pub item: MenuItem,
    pub value: MenuValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MenuCommand {
    Join {
        uuid: Uuid,
        name: String,
        platform: String,
        api_version: u16,
    },
    Heartbeat {
        frequency_ms: u64,
        mode: HeartbeatMode,
    },
    Bootstrap {
        mode: BootstrapMode,
    },
    AnalogBoot(BootItem),
    EnumBoot(BootItem),
    BooleanBoot(BootItem),
    FloatBoot(BootItem),
    ActionBoot(BootItem),
    TextBoot(BootItem),
    RgbBoot(BootItem),
    ScrollChoiceBoot(BootItem),
    RuntimeListBoot(BootItem),
    SubMenuBoot(BootItem),
    Change {
        correlation: CorrelationId,
        item_id: MenuId,
        change_type: ChangeType,
        value: String,
    },
    Ack {
        correlation: CorrelationId,
        status: AckStatus,
    },
    Dialog {
        mode: DialogMode,
        header: String,
        message: String,
        button1: MenuButtonType,
        button2: MenuButtonType,
        correlation: CorrelationId,
    },
}

impl MenuCommand {
    /// The boot command matching `item`'s kind. Remote items have none.
    pub fn boot_for(parent_id: MenuId, item: MenuItem, value: MenuValue) -> Option<Self> {
        let make: fn(BootItem) -> Self = match item.kind {
            ItemKind::Analog { .. } => Self::AnalogBoot,
            ItemKind::Enum { .. } => Self::EnumBoot,
            ItemKind::Boolean { .. } => Self::BooleanBoot,
            ItemKind::Float { .. } => Self::FloatBoot,
            ItemKind::Action => Self::ActionBoot,
            ItemKind::Text { .. } => Self::TextBoot,
            ItemKind::Rgb { .. } => Self::RgbBoot,
            ItemKind::ScrollChoice { .. } => Self::ScrollChoiceBoot,
            ItemKind::RuntimeList { .. } => Self::RuntimeListBoot,
            ItemKind::SubMenu { .. } => Self::SubMenuBoot,
            ItemKind::Remote { .. } => return None,
        };
        Some(make(BootItem {
            parent_id,
            item,
            value,
        }))
    }

    pub fn heartbeat(frequency_ms: u64, mode: HeartbeatMode) -> Self {
        Self::Heartbeat { frequency_ms, mode }
    }

    pub fn ack(correlation: CorrelationId, status: AckStatus) -> Self {
        Self::Ack {
            correlation,
            status,
        }
    }

    /// An absolute change carrying `value` in wire form.
    pub fn absolute_change(correlation: CorrelationId, item_id: MenuId, value: &MenuValue) -> Self {
        Self::Change {
            correlation,
            item_id,
            change_type: ChangeType::Absolute,
            value: value.to_wire(),
        }
    }

    /// The boot payload, for any boot variant.
    pub fn as_boot(&self) -> Option<&BootItem> {
        match self {
            Self::AnalogBoot(b)
            | Self::EnumBoot(b)
            | Self::BooleanBoot(b)
            | Self::FloatBoot(b)
            | Self::ActionBoot(b)
            | Self::TextBoot(b)
            | Self::RgbBoot(b)
            | Self::ScrollChoiceBoot(b)
            | Self::RuntimeListBoot(b)
            | Self::SubMenuBoot(b) => Some(b),
            _ => None,
        }
    }

    pub fn into_boot(self) -> Option<BootItem> {
        match self {
            Self::AnalogBoot(b)
            | Self::EnumBoot(b)
            | Self::BooleanBoot(b)
            | Self::FloatBoot(b)
            | Self::ActionBoot(b)
            | Self::TextBoot(b)
            | Self::RgbBoot(b)
            | Self::ScrollChoiceBoot(b)
            | Self::RuntimeListBoot(b)
            | Self::SubMenuBoot(b) => Some(b),
            _ => None,
        }
    }

    /// Command name for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Bootstrap { .. } => "bootstrap",
            Self::AnalogBoot(_) => "analog_boot",
            Self::EnumBoot(_) => "enum_boot",
            Self::BooleanBoot(_) => "boolean_boot",
            Self::FloatBoot(_) => "float_boot",
            Self::ActionBoot(_) => "action_boot",
            Self::TextBoot(_) => "text_boot",
            Self::RgbBoot(_) => "rgb_boot",
            Self::ScrollChoiceBoot(_) => "scroll_choice_boot",
            Self::RuntimeListBoot(_) => "runtime_list_boot",
            Self::SubMenuBoot(_) => "sub_menu_boot",
            Self::Change { .. } => "change",
            Self::Ack { .. } => "ack",
            Self::Dialog { .. } => "dialog",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use menu_tree::BooleanNaming;

    #[test]
    fn correlation_ids_are_never_empty() {
        for _ in 0..1000 {
            assert!(!CorrelationId::new_random().is_empty());
        }
        assert_eq!(CorrelationId(0xbeef).to_string(), "0000beef");
    }

    #[test]
    fn ack_codes() {
        assert_eq!(AckStatus::Success.code(), 0);
        assert_eq!(AckStatus::IdNotFound.code(), 10002);
        assert!(AckStatus::InvalidCredentials.is_error());
        assert!(!AckStatus::ValueRangeWarning.is_error());
        assert_eq!(AckStatus::from(424242), AckStatus::UnknownError);
    }

    #[test]
    fn ack_serializes_as_numeric_code() {
        let cmd = MenuCommand::ack(CorrelationId(5), AckStatus::IdNotFound);
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["type"], "ack");
        assert_eq!(json["status"], 10002);
        assert_eq!(json["correlation"], 5);
    }

    #[test]
    fn boot_variant_follows_item_kind() {
        let boot = MenuCommand::boot_for(
            MenuId::ROOT,
            MenuItem::boolean(MenuId(3), "Power", BooleanNaming::YesNo),
            MenuValue::Bool(true),
        )
        .unwrap();
        assert!(matches!(boot, MenuCommand::BooleanBoot(_)));
        assert_eq!(boot.as_boot().unwrap().item.id, MenuId(3));

        assert!(
            MenuCommand::boot_for(
                MenuId::ROOT,
                MenuItem::remote(MenuId(4), "Link", 0),
                MenuValue::Text(String::new()),
            )
            .is_none()
        );
    }

    #[test]
    fn boot_command_survives_json() {
        let boot = MenuCommand::boot_for(
            MenuId(2),
            MenuItem::analog(MenuId(7), "Volume", 100).with_read_only(true),
            MenuValue::Int(42),
        )
        .unwrap();
        let json = serde_json::to_string(&boot).unwrap();
        let back: MenuCommand = serde_json::from_str(&json).unwrap();
        assert_eq!(back, boot);
    }
}
