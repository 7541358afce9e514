//! Menu Tree - typed menu item definitions and a concurrent store for them
//!
//! The tree keeps two independent pieces of state:
//!
//! - the structure: every submenu and its ordered children, guarded by one
//!   tree-wide lock
//! - the current value of each item (`MenuState`), kept in a concurrent map
//!   keyed by id so value updates never wait on structural readers
//!
//! # Example
//!
//! ```
//! use menu_tree::{MenuId, MenuItem, MenuTree, MenuValue};
//!
//! let tree = MenuTree::new();
//! let settings = MenuItem::sub_menu(MenuId(1), "Settings");
//! tree.add_item(MenuId::ROOT, settings).unwrap();
//! tree.add_item(MenuId(1), MenuItem::analog(MenuId(2), "Volume", 100)).unwrap();
//!
//! tree.change_item(MenuId(2), MenuValue::Int(42)).unwrap();
//! assert_eq!(tree.get_state(MenuId(2)).unwrap().value, MenuValue::Int(42));
//! assert_eq!(tree.find_parent(MenuId(2)).unwrap().id, MenuId(1));
//! ```

pub mod error;
pub mod item;
pub mod tree;
pub mod value;

pub use error::TreeError;
pub use item::{BooleanNaming, EditItemType, ItemKind, MenuId, MenuItem};
pub use tree::{MenuTree, MoveDirection};
pub use value::{MenuState, MenuValue, PortableColor, ScrollPosition};
