use menu_remote::RemoteError;
use menu_tree::{MenuId, TreeError};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("replication range for {name} does not fit: offset {id_offset} + range {maximum_range}")]
    InvalidReplicationRange {
        name: String,
        id_offset: u32,
        maximum_range: u32,
    },

    #[error("menu item {0} is not a submenu")]
    NotASubMenu(MenuId),
}
