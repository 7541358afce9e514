//! Join credential checks.

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

/// Decides whether a remote party may join.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, name: &str, uuid: Uuid) -> bool;
}

/// Accepts everyone.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAuthenticator;

impl Authenticator for OpenAuthenticator {
    fn authenticate(&self, _name: &str, _uuid: Uuid) -> bool {
        true
    }
}

/// One known client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCredential {
    pub name: String,
    pub uuid: Uuid,
}

/// Accepts only the listed name/uuid pairs. Both must match.
#[derive(Debug, Clone, Default)]
pub struct PreDefinedAuthenticator {
    clients: Vec<ClientCredential>,
}

impl PreDefinedAuthenticator {
    pub fn new(clients: Vec<ClientCredential>) -> Self {
        Self { clients }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl Authenticator for PreDefinedAuthenticator {
    fn authenticate(&self, name: &str, uuid: Uuid) -> bool {
        let known = self
            .clients
            .iter()
            .any(|c| c.uuid == uuid && c.name == name);
        if !known {
            debug!(client = name, %uuid, "client not in the predefined list");
        }
        known
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predefined_needs_name_and_uuid() {
        let uuid = Uuid::new_v4();
        let auth = PreDefinedAuthenticator::new(vec![ClientCredential {
            name: "panel".into(),
            uuid,
        }]);
        assert!(auth.authenticate("panel", uuid));
        assert!(!auth.authenticate("other", uuid));
        assert!(!auth.authenticate("panel", Uuid::new_v4()));
    }

    #[test]
    fn open_accepts_anyone() {
        assert!(OpenAuthenticator.authenticate("anyone", Uuid::nil()));
    }
}
