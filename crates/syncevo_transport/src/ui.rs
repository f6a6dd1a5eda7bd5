//! Credential requests to the user interface.

use serde::{Deserialize, Serialize};

/// Identifies a password in a keyring.
///
/// Empty fields are unset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PasswordKey {
    /// User name.
    pub user: String,
    /// Server host name.
    pub server: String,
    /// Authentication domain.
    pub domain: String,
    /// Object on the server, e.g. a path.
    pub object: String,
    /// Protocol, e.g. `https`.
    pub protocol: String,
    /// Authentication type.
    pub authtype: String,
    /// Port, 0 if unset.
    pub port: u16,
}

impl PasswordKey {
    /// Creates a key for `user` on `server`.
    pub fn new(user: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            server: server.into(),
            ..Self::default()
        }
    }

    /// Fills server, protocol and port from a URL like
    /// `https://host:port/path`.
    pub fn for_url(user: impl Into<String>, url: &str) -> Self {
        let mut key = Self {
            user: user.into(),
            ..Self::default()
        };
        let rest = match url.split_once("://") {
            Some((protocol, rest)) => {
                key.protocol = protocol.to_ascii_lowercase();
                rest
            }
            None => url,
        };
        let (authority, object) = match rest.split_once('/') {
            Some((authority, path)) => (authority, format!("/{path}")),
            None => (rest, String::new()),
        };
        key.object = object;
        match authority.rsplit_once(':') {
            Some((host, port)) if port.bytes().all(|b| b.is_ascii_digit()) && !port.is_empty() => {
                key.server = host.to_string();
                key.port = port.parse().unwrap_or(0);
            }
            _ => key.server = authority.to_string(),
        }
        key
    }
}

/// User interface for credential requests.
///
/// Implementations may block until the user answers.
pub trait UserInterface: Send + Sync {
    /// Asks for a password. Returns `None` if the user declined.
    ///
    /// `name` identifies the password in the configuration, `description`
    /// is shown to the user.
    fn ask_password(&self, name: &str, description: &str, key: &PasswordKey) -> Option<String>;

    /// Stores a password. Returns false if it could not be stored.
    fn save_password(&self, name: &str, password: &str, key: &PasswordKey) -> bool;
}

/// Interface that never has a password to offer.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoUserInterface;

impl UserInterface for NoUserInterface {
    fn ask_password(&self, _name: &str, _description: &str, _key: &PasswordKey) -> Option<String> {
        None
    }

    fn save_password(&self, _name: &str, _password: &str, _key: &PasswordKey) -> bool {
        false
    }
}
