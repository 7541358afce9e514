//! Current values of menu items.
//!
//! Values travel over the wire as strings; `MenuValue::to_wire` renders them
//! and `MenuItem::parse_value` reads them back with the item's constraints.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The current value held by one menu item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum MenuValue {
    Int(i32),
    Bool(bool),
    Float(f64),
    Text(String),
    Rgb(PortableColor),
    Scroll(ScrollPosition),
    List(Vec<String>),
    /// Items without a stored value (actions, submenus).
    Empty,
}

impl MenuValue {
    pub fn as_int(&self) -> Option<i32> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Scroll(pos) => i32::try_from(pos.position).ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Render the value in the string form used by change and boot commands.
    pub fn to_wire(&self) -> String {
        match self {
            Self::Int(v) => v.to_string(),
            Self::Bool(v) => if *v { "1" } else { "0" }.to_string(),
            Self::Float(v) => v.to_string(),
            Self::Text(v) => v.clone(),
            Self::Rgb(color) => color.to_string(),
            Self::Scroll(pos) => pos.to_string(),
            Self::List(rows) => rows.join("\n"),
            Self::Empty => String::new(),
        }
    }
}

/// The value of one item plus its change/active flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MenuState {
    pub value: MenuValue,
    pub changed: bool,
    pub active: bool,
}

impl MenuState {
    pub fn new(value: MenuValue) -> Self {
        Self {
            value,
            changed: false,
            active: false,
        }
    }

    /// A state for a value that was just written by someone.
    pub fn changed(value: MenuValue) -> Self {
        Self {
            value,
            changed: true,
            active: false,
        }
    }
}

/// RGBA colour, rendered as `#RRGGBBAA`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortableColor {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
    pub alpha: u8,
}

impl PortableColor {
    pub const BLACK: Self = Self::new(0, 0, 0, 255);

    pub const fn new(red: u8, green: u8, blue: u8, alpha: u8) -> Self {
        Self {
            red,
            green,
            blue,
            alpha,
        }
    }
}

impl fmt::Display for PortableColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{:02X}{:02X}{:02X}{:02X}",
            self.red, self.green, self.blue, self.alpha
        )
    }
}

impl FromStr for PortableColor {
    type Err = String;

    /// Accepts `#RGB`, `#RRGGBB` and `#RRGGBBAA`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s
            .strip_prefix('#')
            .ok_or_else(|| format!("colour must start with '#': {s}"))?;
        if !hex.is_ascii() {
            return Err(format!("invalid colour: {s}"));
        }
        let channel = |range: &str| {
            u8::from_str_radix(range, 16).map_err(|_| format!("invalid colour: {s}"))
        };
        match hex.len() {
            3 => {
                let expand = |i: usize| channel(&hex[i..i + 1]).map(|c| c * 17);
                Ok(Self::new(expand(0)?, expand(1)?, expand(2)?, 255))
            }
            6 => Ok(Self::new(
                channel(&hex[0..2])?,
                channel(&hex[2..4])?,
                channel(&hex[4..6])?,
                255,
            )),
            8 => Ok(Self::new(
                channel(&hex[0..2])?,
                channel(&hex[2..4])?,
                channel(&hex[4..6])?,
                channel(&hex[6..8])?,
            )),
            _ => Err(format!("invalid colour length: {s}")),
        }
    }
}

/// Position in a scroll choice plus the text shown at that position,
/// rendered as `<position>-<text>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrollPosition {
    pub position: usize,
    pub value: String,
}

impl ScrollPosition {
    pub fn new(position: usize, value: impl Into<String>) -> Self {
        Self {
            position,
            value: value.into(),
        }
    }
}

impl fmt::Display for ScrollPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.position, self.value)
    }
}

impl FromStr for ScrollPosition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (pos, text) = s.split_once('-').unwrap_or((s, ""));
        let position = pos
            .trim()
            .parse::<usize>()
            .map_err(|_| format!("invalid scroll position: {s}"))?;
        Ok(Self::new(position, text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colour_parses_all_lengths() {
        assert_eq!(
            "#FF0080".parse::<PortableColor>().unwrap(),
            PortableColor::new(255, 0, 128, 255)
        );
        assert_eq!(
            "#10203040".parse::<PortableColor>().unwrap(),
            PortableColor::new(0x10, 0x20, 0x30, 0x40)
        );
        assert_eq!(
            "#F00".parse::<PortableColor>().unwrap(),
            PortableColor::new(255, 0, 0, 255)
        );
        assert!("FF0080".parse::<PortableColor>().is_err());
        assert!("#GG0080".parse::<PortableColor>().is_err());
    }

    #[test]
    fn colour_renders_with_alpha() {
        assert_eq!(PortableColor::new(1, 2, 3, 4).to_string(), "#01020304");
    }

    #[test]
    fn scroll_position_keeps_dashes_in_text() {
        let pos: ScrollPosition = "2-left-hand".parse().unwrap();
        assert_eq!(pos.position, 2);
        assert_eq!(pos.value, "left-hand");

        let bare: ScrollPosition = "7".parse().unwrap();
        assert_eq!(bare, ScrollPosition::new(7, ""));
    }

    #[test]
    fn wire_form_of_each_value() {
        assert_eq!(MenuValue::Int(-4).to_wire(), "-4");
        assert_eq!(MenuValue::Bool(true).to_wire(), "1");
        assert_eq!(MenuValue::Bool(false).to_wire(), "0");
        assert_eq!(
            MenuValue::List(vec!["a".into(), "b".into()]).to_wire(),
            "a\nb"
        );
        assert_eq!(MenuValue::Empty.to_wire(), "");
    }

    #[test]
    fn scroll_values_count_as_integers() {
        let v = MenuValue::Scroll(ScrollPosition::new(3, "x"));
        assert_eq!(v.as_int(), Some(3));
        assert_eq!(MenuValue::Text("3".into()).as_int(), None);
    }
}
