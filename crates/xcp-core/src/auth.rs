//! Auth gate: validates an opaque encrypted credential presented inside the
//! node descriptor against a configured allowlist.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::cipher::CipherSuite;
use crate::error::{Error, Result};
use crate::matcher::extract_path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub enabled: bool,
    pub auth_passwords: Vec<String>,
    /// Dotted path, under the node descriptor's `metadata`, carrying the
    /// encrypted credential. Defaults to `"metadata.auth"`.
    pub credential_path: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self { enabled: false, auth_passwords: Vec::new(), credential_path: "metadata.auth".to_string() }
    }
}

pub struct AuthGate {
    config: AuthConfig,
    cipher: Arc<CipherSuite>,
}

impl AuthGate {
    pub fn new(config: AuthConfig, cipher: Arc<CipherSuite>) -> Self {
        Self { config, cipher }
    }

    /// Validate the node descriptor's credential. A no-op when
    /// authentication is disabled.
    pub fn check(&self, node: &Value) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        let credential = extract_path(node, &self.config.credential_path)
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| Error::unauthorized("missing credential in node descriptor"))?;

        let plaintext = self
            .cipher
            .decrypt(&credential)
            .map_err(|_| Error::unauthorized("credential could not be decrypted"))?;

        if self.config.auth_passwords.iter().any(|p| p == &plaintext) {
            Ok(())
        } else {
            Err(Error::unauthorized("credential not in allowlist"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::{CipherKey, CipherSuite};
    use serde_json::json;

    fn gate(passwords: Vec<&str>) -> (AuthGate, Arc<CipherSuite>) {
        let cipher = Arc::new(CipherSuite::new(vec![CipherKey::generate()], vec![]).unwrap());
        let config = AuthConfig {
            enabled: true,
            auth_passwords: passwords.into_iter().map(String::from).collect(),
            ..Default::default()
        };
        (AuthGate::new(config, cipher.clone()), cipher)
    }

    #[test]
    fn wrong_password_is_rejected() {
        let (gate, cipher) = gate(vec!["s1"]);
        let node = json!({"metadata": {"auth": cipher.encrypt("wrong").unwrap()}});
        assert!(gate.check(&node).is_err());
    }

    #[test]
    fn correct_password_is_accepted() {
        let (gate, cipher) = gate(vec!["s1"]);
        let node = json!({"metadata": {"auth": cipher.encrypt("s1").unwrap()}});
        assert!(gate.check(&node).is_ok());
    }

    #[test]
    fn disabled_auth_always_passes() {
        let cipher = Arc::new(CipherSuite::new(vec![CipherKey::generate()], vec![]).unwrap());
        let gate = AuthGate::new(AuthConfig::default(), cipher);
        assert!(gate.check(&json!({})).is_ok());
    }

    #[test]
    fn missing_credential_is_rejected() {
        let (gate, _cipher) = gate(vec!["s1"]);
        assert!(gate.check(&json!({"metadata": {}})).is_err());
    }
}
