//! Menu Manager - the server side of the menu protocol
//!
//! Hosts a `MenuTree` for any number of remote sessions. Clients join,
//! receive the visible tree as a boot sequence and then exchange value
//! changes; the server arbitrates every change against the item's limits
//! before fanning it out.
//!
//! - `server`: sessions, authentication, change arbitration, liveness
//! - `dialog`: the single shared dialog and who may close it
//! - `menu_in_menu`: mirror part of another server's tree into a submenu
//! - `config`: figment-layered configuration and tree loading
//! - `tcp`: the accept loop

pub mod auth;
pub mod config;
pub mod dialog;
pub mod error;
pub mod menu_in_menu;
pub mod metrics;
pub mod server;
pub mod tcp;

pub use auth::{Authenticator, ClientCredential, OpenAuthenticator, PreDefinedAuthenticator};
pub use config::{FileConfig, ManagerConfig, ReplicateConfig, load_config, load_tree};
pub use dialog::{ButtonOutcome, DialogDelegate, DialogManager, DialogShowMode, DialogSnapshot, DialogState};
pub use error::ServerError;
pub use menu_in_menu::{MenuInMenu, MenuInMenuDefinition, ReplicationMode};
pub use metrics::{MetricsSnapshot, ServerMetrics};
pub use server::{MenuManagerListener, MenuManagerServer, SessionInfo};
