//! Menu item definitions.
//!
//! A `MenuItem` is an immutable value: a shared header plus an `ItemKind`
//! payload. Edits produce a new item that replaces the old one in the tree.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TreeError;
use crate::value::{MenuValue, PortableColor, ScrollPosition};

/// Identifier of a menu item, unique within one tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MenuId(pub u32);

impl MenuId {
    /// The implicit top-level submenu present in every tree.
    pub const ROOT: MenuId = MenuId(0);

    pub fn is_root(self) -> bool {
        self == Self::ROOT
    }

    pub fn offset(self, by: u32) -> MenuId {
        MenuId(self.0.saturating_add(by))
    }

    pub fn checked_sub(self, by: u32) -> Option<MenuId> {
        self.0.checked_sub(by).map(MenuId)
    }
}

impl fmt::Display for MenuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for MenuId {
    fn from(id: u32) -> Self {
        MenuId(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BooleanNaming {
    #[default]
    OnOff,
    YesNo,
    TrueFalse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditItemType {
    #[default]
    PlainText,
    IpAddress,
    Time24,
    Date,
}

/// Kind-specific part of a menu item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemKind {
    Analog {
        max_value: i32,
        #[serde(default)]
        offset: i32,
        #[serde(default = "one")]
        divisor: i32,
        #[serde(default)]
        unit_name: String,
        #[serde(default = "one")]
        step: i32,
    },
    Enum {
        entries: Vec<String>,
    },
    Boolean {
        #[serde(default)]
        naming: BooleanNaming,
    },
    Float {
        decimal_places: u8,
    },
    Text {
        text_length: usize,
        #[serde(default)]
        edit_type: EditItemType,
    },
    Action,
    Rgb {
        #[serde(default)]
        include_alpha: bool,
    },
    ScrollChoice {
        item_width: usize,
        num_entries: usize,
    },
    RuntimeList {
        #[serde(default)]
        initial_rows: usize,
    },
    SubMenu {
        #[serde(default)]
        secured: bool,
    },
    Remote {
        remote_no: u32,
    },
}

fn one() -> i32 {
    1
}

fn no_eeprom() -> i32 {
    -1
}

fn visible_default() -> bool {
    true
}

/// One node of the menu tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MenuItem {
    pub id: MenuId,
    pub name: String,
    #[serde(default = "no_eeprom")]
    pub eeprom_address: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub local_only: bool,
    #[serde(default = "visible_default")]
    pub visible: bool,
    #[serde(flatten)]
    pub kind: ItemKind,
}

impl MenuItem {
    pub fn new(id: MenuId, name: impl Into<String>, kind: ItemKind) -> Self {
        Self {
            id,
            name: name.into(),
            eeprom_address: no_eeprom(),
            function_name: None,
            read_only: false,
            local_only: false,
            visible: true,
            kind,
        }
    }

    pub fn analog(id: MenuId, name: impl Into<String>, max_value: i32) -> Self {
        Self::new(
            id,
            name,
            ItemKind::Analog {
                max_value,
                offset: 0,
                divisor: 1,
                unit_name: String::new(),
                step: 1,
            },
        )
    }

    pub fn enumeration<S: Into<String>>(
        id: MenuId,
        name: impl Into<String>,
        entries: impl IntoIterator<Item = S>,
    ) -> Self {
        Self::new(
            id,
            name,
            ItemKind::Enum {
                entries: entries.into_iter().map(Into::into).collect(),
            },
        )
    }

    pub fn boolean(id: MenuId, name: impl Into<String>, naming: BooleanNaming) -> Self {
        Self::new(id, name, ItemKind::Boolean { naming })
    }

    pub fn float(id: MenuId, name: impl Into<String>, decimal_places: u8) -> Self {
        Self::new(id, name, ItemKind::Float { decimal_places })
    }

    pub fn text(id: MenuId, name: impl Into<String>, text_length: usize) -> Self {
        Self::new(
            id,
            name,
            ItemKind::Text {
                text_length,
                edit_type: EditItemType::PlainText,
            },
        )
    }

    pub fn action(id: MenuId, name: impl Into<String>) -> Self {
        Self::new(id, name, ItemKind::Action)
    }

    pub fn rgb(id: MenuId, name: impl Into<String>, include_alpha: bool) -> Self {
        Self::new(id, name, ItemKind::Rgb { include_alpha })
    }

    pub fn scroll_choice(
        id: MenuId,
        name: impl Into<String>,
        item_width: usize,
        num_entries: usize,
    ) -> Self {
        Self::new(
            id,
            name,
            ItemKind::ScrollChoice {
                item_width,
                num_entries,
            },
        )
    }

    pub fn runtime_list(id: MenuId, name: impl Into<String>, initial_rows: usize) -> Self {
        Self::new(id, name, ItemKind::RuntimeList { initial_rows })
    }

    pub fn sub_menu(id: MenuId, name: impl Into<String>) -> Self {
        Self::new(id, name, ItemKind::SubMenu { secured: false })
    }

    pub fn remote(id: MenuId, name: impl Into<String>, remote_no: u32) -> Self {
        Self::new(id, name, ItemKind::Remote { remote_no })
    }

    pub fn with_id(mut self, id: MenuId) -> Self {
        self.id = id;
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_local_only(mut self, local_only: bool) -> Self {
        self.local_only = local_only;
        self
    }

    pub fn with_visible(mut self, visible: bool) -> Self {
        self.visible = visible;
        self
    }

    pub fn with_eeprom_address(mut self, address: i32) -> Self {
        self.eeprom_address = address;
        self
    }

    pub fn with_function_name(mut self, name: impl Into<String>) -> Self {
        self.function_name = Some(name.into());
        self
    }

    pub fn is_sub_menu(&self) -> bool {
        matches!(self.kind, ItemKind::SubMenu { .. })
    }

    /// Short lowercase name of the kind, for logs.
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            ItemKind::Analog { .. } => "analog",
            ItemKind::Enum { .. } => "enum",
            ItemKind::Boolean { .. } => "boolean",
            ItemKind::Float { .. } => "float",
            ItemKind::Text { .. } => "text",
            ItemKind::Action => "action",
            ItemKind::Rgb { .. } => "rgb",
            ItemKind::ScrollChoice { .. } => "scroll_choice",
            ItemKind::RuntimeList { .. } => "runtime_list",
            ItemKind::SubMenu { .. } => "sub_menu",
            ItemKind::Remote { .. } => "remote",
        }
    }

    /// Largest integer value the item accepts, for kinds with an integer
    /// value. `None` for every other kind.
    pub fn max_int_value(&self) -> Option<i64> {
        match &self.kind {
            ItemKind::Analog { max_value, .. } => Some(i64::from(*max_value)),
            ItemKind::Enum { entries } => Some(entries.len() as i64 - 1),
            ItemKind::ScrollChoice { num_entries, .. } => Some(*num_entries as i64 - 1),
            _ => None,
        }
    }

    /// The value an item holds before anyone has set it.
    pub fn default_value(&self) -> MenuValue {
        match &self.kind {
            ItemKind::Analog { .. } | ItemKind::Enum { .. } => MenuValue::Int(0),
            ItemKind::Boolean { .. } => MenuValue::Bool(false),
            ItemKind::Float { .. } => MenuValue::Float(0.0),
            ItemKind::Text { .. } | ItemKind::Remote { .. } => MenuValue::Text(String::new()),
            ItemKind::Rgb { .. } => MenuValue::Rgb(PortableColor::BLACK),
            ItemKind::ScrollChoice { .. } => MenuValue::Scroll(ScrollPosition::new(0, "")),
            ItemKind::RuntimeList { .. } => MenuValue::List(Vec::new()),
            ItemKind::Action | ItemKind::SubMenu { .. } => MenuValue::Empty,
        }
    }

    /// Parse a wire string into a value of this item's kind, rejecting
    /// values outside the item's declared range.
    pub fn parse_value(&self, raw: &str) -> Result<MenuValue, TreeError> {
        let invalid = || TreeError::InvalidValue {
            id: self.id,
            raw: raw.to_string(),
        };
        match &self.kind {
            ItemKind::Analog { .. } | ItemKind::Enum { .. } => {
                let v = raw.trim().parse::<i32>().map_err(|_| invalid())?;
                self.check_range(i64::from(v))?;
                Ok(MenuValue::Int(v))
            }
            ItemKind::Boolean { .. } => match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "y" | "yes" | "on" => Ok(MenuValue::Bool(true)),
                "0" | "false" | "n" | "no" | "off" => Ok(MenuValue::Bool(false)),
                _ => Err(invalid()),
            },
            ItemKind::Float { .. } => {
                let v = raw.trim().parse::<f64>().map_err(|_| invalid())?;
                if !v.is_finite() {
                    return Err(invalid());
                }
                Ok(MenuValue::Float(v))
            }
            ItemKind::Text { text_length, .. } => {
                if *text_length > 0 && raw.chars().count() > *text_length {
                    return Err(invalid());
                }
                Ok(MenuValue::Text(raw.to_string()))
            }
            ItemKind::Remote { .. } => Ok(MenuValue::Text(raw.to_string())),
            ItemKind::Rgb { .. } => raw
                .trim()
                .parse::<PortableColor>()
                .map(MenuValue::Rgb)
                .map_err(|_| invalid()),
            ItemKind::ScrollChoice { .. } => {
                let pos = raw.parse::<ScrollPosition>().map_err(|_| invalid())?;
                self.check_range(pos.position as i64)?;
                Ok(MenuValue::Scroll(pos))
            }
            ItemKind::RuntimeList { .. } => {
                let rows = if raw.is_empty() {
                    Vec::new()
                } else {
                    raw.split('\n').map(str::to_string).collect()
                };
                Ok(MenuValue::List(rows))
            }
            ItemKind::Action => Ok(MenuValue::Empty),
            ItemKind::SubMenu { .. } => Err(invalid()),
        }
    }

    /// Apply a relative adjustment to `current`. Only integer kinds accept
    /// deltas; the result must stay within `0..=max_int_value()`.
    pub fn apply_delta(&self, current: Option<&MenuValue>, delta: i32) -> Result<MenuValue, TreeError> {
        let Some(max) = self.max_int_value() else {
            return Err(TreeError::InvalidValue {
                id: self.id,
                raw: delta.to_string(),
            });
        };
        let base = current.and_then(MenuValue::as_int).unwrap_or(0);
        let new_value = i64::from(base) + i64::from(delta);
        if new_value < 0 || new_value > max {
            return Err(TreeError::OutOfRange {
                id: self.id,
                value: new_value,
                max,
            });
        }
        match &self.kind {
            // entry text is owned by the application; carry the current one
            ItemKind::ScrollChoice { .. } => {
                let text = match current {
                    Some(MenuValue::Scroll(pos)) => pos.value.clone(),
                    _ => String::new(),
                };
                Ok(MenuValue::Scroll(ScrollPosition::new(new_value as usize, text)))
            }
            _ => Ok(MenuValue::Int(new_value as i32)),
        }
    }

    fn check_range(&self, value: i64) -> Result<(), TreeError> {
        match self.max_int_value() {
            Some(max) if value < 0 || value > max => Err(TreeError::OutOfRange {
                id: self.id,
                value,
                max,
            }),
            _ => Ok(()),
        }
    }
}
