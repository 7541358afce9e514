//! Error types for tree mutation and value parsing.

use crate::item::MenuId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
    #[error("menu item {0} already exists in the tree")]
    DuplicateId(MenuId),

    #[error("parent {0} is not a submenu in the tree")]
    ParentNotFound(MenuId),

    #[error("menu item {0} not found")]
    ItemNotFound(MenuId),

    #[error("menu item {item} is not a child of {parent}")]
    NotAChild { parent: MenuId, item: MenuId },

    #[error("the root menu cannot be removed or replaced")]
    RootImmutable,

    #[error("cannot parse '{raw}' as a value for menu item {id}")]
    InvalidValue { id: MenuId, raw: String },

    #[error("value {value} is outside 0..={max} for menu item {id}")]
    OutOfRange { id: MenuId, value: i64, max: i64 },
}

impl TreeError {
    /// True for errors caused by a value that the item cannot hold, as
    /// opposed to errors about the tree's shape.
    pub fn is_value_error(&self) -> bool {
        matches!(self, Self::InvalidValue { .. } | Self::OutOfRange { .. })
    }
}
