//! Node authentication
//!
//! Every node carries an ed25519 keypair for signing request arguments.
//! Keys are generated on first boot and stored base64-encoded under
//! `<config-folder>/signing/`. The public keys of peer nodes are aggregated
//! on central, hash-stamped, and distributed back out; the local copy is
//! persisted as JSON in `<database-folder>/publickeys.txt`.

pub mod acl;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Result, StewardError};
use crate::message::{Message, Node};

/// Public keys of fabric nodes plus a hash over the canonical encoding,
/// used as the quick-diff token in the key distribution protocol.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeysAndHash {
    #[serde(rename = "Keys")]
    pub keys: BTreeMap<Node, Vec<u8>>,
    #[serde(rename = "Hash")]
    pub hash: [u8; 32],
}

impl KeysAndHash {
    /// Recompute the hash from the sorted key map.
    fn rehash(&mut self) -> Result<()> {
        let encoded = serde_cbor::to_vec(&self.keys)?;
        self.hash = sha256(&encoded);
        Ok(())
    }
}

pub(crate) fn sha256(b: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(b);
    hasher.finalize().into()
}

/// Authentication state for one node: its own signing keys and the public
/// keys it trusts.
pub struct NodeAuth {
    signing_key: SigningKey,
    /// Distributed public keys, guarded for the duration of a verify.
    public_keys: Mutex<KeysAndHash>,
    /// Keys announced by nodes but not yet allowed by an operator.
    /// Only populated on the central node.
    pending_keys: Mutex<BTreeMap<Node, Vec<u8>>>,
    key_store_path: PathBuf,
}

impl NodeAuth {
    /// Load signing keys and the public key store, generating the keypair
    /// on first boot.
    pub fn new(config: &Config) -> Result<Self> {
        let sign_folder = config.config_folder.join("signing");
        let signing_key = load_or_generate_signing_key(&sign_folder)?;

        let key_store_path = config.database_folder.join("publickeys.txt");
        let public_keys = load_key_store(&key_store_path)?;

        Ok(Self {
            signing_key,
            public_keys: Mutex::new(public_keys),
            pending_keys: Mutex::new(BTreeMap::new()),
            key_store_path,
        })
    }

    /// This node's public signing key.
    pub fn public_key(&self) -> Vec<u8> {
        self.signing_key.verifying_key().to_bytes().to_vec()
    }

    /// Sign the stringified method arguments of an outgoing message.
    pub fn sign_args(&self, args: &str) -> Vec<u8> {
        self.signing_key.sign(args.as_bytes()).to_bytes().to_vec()
    }

    /// Verify the argument signature of an incoming message.
    ///
    /// Passes when enforcement is off or the method does not require
    /// signing. Otherwise the signature must verify against the stored
    /// public key of the sending node.
    pub fn verify_signature(&self, m: &Message, enforce: bool) -> bool {
        if !enforce || !m.method.requires_signature() {
            return true;
        }

        let keys = self.public_keys.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(key_bytes) = keys.keys.get(&m.from_node) else {
            warn!(from = %m.from_node, "no public key stored for sender");
            return false;
        };

        let Ok(key_array) = <[u8; 32]>::try_from(key_bytes.as_slice()) else {
            return false;
        };
        let Ok(verifying_key) = VerifyingKey::from_bytes(&key_array) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(&m.arg_signature) else {
            return false;
        };

        verifying_key
            .verify(m.args_string().as_bytes(), &signature)
            .is_ok()
    }

    /// Record a key announced by a node. Goes to the pending set until an
    /// operator allows it, unless the same key is already trusted.
    pub fn register_announced_key(&self, node: &str, key: Vec<u8>) {
        let keys = self.public_keys.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if keys.keys.get(node) == Some(&key) {
            return;
        }
        drop(keys);

        self.pending_keys
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(node.to_string(), key);
    }

    /// Move a pending key into the trusted set and persist.
    pub fn allow_key(&self, node: &str) -> Result<bool> {
        let pending = self
            .pending_keys
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(node);

        let Some(key) = pending else {
            return Ok(false);
        };

        let mut keys = self.public_keys.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        keys.keys.insert(node.to_string(), key);
        keys.rehash()?;
        save_key_store(&self.key_store_path, &keys)?;
        info!(node, "public key allowed");
        Ok(true)
    }

    /// Remove a node's key from the trusted set and persist.
    pub fn delete_key(&self, node: &str) -> Result<bool> {
        let mut keys = self.public_keys.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if keys.keys.remove(node).is_none() {
            return Ok(false);
        }
        keys.rehash()?;
        save_key_store(&self.key_store_path, &keys)?;
        info!(node, "public key deleted");
        Ok(true)
    }

    /// Snapshot of the trusted keys and their hash.
    pub fn keys_and_hash(&self) -> KeysAndHash {
        self.public_keys
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Replace the local key set with a delivered update and persist.
    pub fn replace_keys(&self, update: KeysAndHash) -> Result<()> {
        let mut keys = self.public_keys.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *keys = update;
        save_key_store(&self.key_store_path, &keys)?;
        info!(count = keys.keys.len(), "public key store replaced from update");
        Ok(())
    }
}

fn load_or_generate_signing_key(folder: &Path) -> Result<SigningKey> {
    std::fs::create_dir_all(folder)?;

    let private_path = folder.join("private.key");
    let public_path = folder.join("public.key");

    if private_path.exists() {
        let raw = std::fs::read_to_string(&private_path)?;
        let bytes = STANDARD_NO_PAD
            .decode(raw.trim())
            .map_err(|e| StewardError::Key(format!("private key decode: {e}")))?;
        let key_array = <[u8; 32]>::try_from(bytes.as_slice())
            .map_err(|_| StewardError::Key("private key has wrong length".into()))?;
        return Ok(SigningKey::from_bytes(&key_array));
    }

    info!("no signing keys found, generating new keypair");
    let signing_key = SigningKey::generate(&mut OsRng);

    std::fs::write(
        &private_path,
        STANDARD_NO_PAD.encode(signing_key.to_bytes()),
    )?;
    std::fs::write(
        &public_path,
        STANDARD_NO_PAD.encode(signing_key.verifying_key().to_bytes()),
    )?;

    Ok(signing_key)
}

fn load_key_store(path: &Path) -> Result<KeysAndHash> {
    if !path.exists() {
        return Ok(KeysAndHash::default());
    }

    let raw = std::fs::read(path)?;
    Ok(serde_json::from_slice(&raw)?)
}

fn save_key_store(path: &Path, keys: &KeysAndHash) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_vec(keys)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Method;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> Config {
        Config {
            config_folder: dir.path().join("etc"),
            database_folder: dir.path().join("db"),
            ..Default::default()
        }
    }

    #[test]
    fn test_keys_generated_once_and_reloaded() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        let auth = NodeAuth::new(&config).unwrap();
        let pk = auth.public_key();

        // Second boot loads the same key.
        let auth2 = NodeAuth::new(&config).unwrap();
        assert_eq!(auth2.public_key(), pk);

        assert!(config.config_folder.join("signing/private.key").exists());
        assert!(config.config_folder.join("signing/public.key").exists());
    }

    #[test]
    fn test_sign_and_verify() {
        let dir = TempDir::new().unwrap();
        let auth = NodeAuth::new(&test_config(&dir)).unwrap();

        let mut m = Message {
            to_node: "ship1".into(),
            from_node: "operator1".into(),
            method: Method::CliCommand,
            method_args: vec!["bash".into(), "-c".into(), "date".into()],
            ..Default::default()
        };
        m.arg_signature = auth.sign_args(&m.args_string());

        // The sender's key must be trusted for the signature to verify.
        auth.register_announced_key("operator1", auth.public_key());
        auth.allow_key("operator1").unwrap();
        assert!(auth.verify_signature(&m, true));

        // Tampered args fail.
        m.method_args.push("extra".into());
        assert!(!auth.verify_signature(&m, true));

        // Enforcement off passes anything.
        assert!(auth.verify_signature(&m, false));
    }

    #[test]
    fn test_methods_without_signing_pass() {
        let dir = TempDir::new().unwrap();
        let auth = NodeAuth::new(&test_config(&dir)).unwrap();

        let m = Message {
            to_node: "ship1".into(),
            from_node: "nobody".into(),
            method: Method::Ping,
            ..Default::default()
        };
        assert!(auth.verify_signature(&m, true));
    }

    #[test]
    fn test_key_store_hash_changes_with_keys() {
        let dir = TempDir::new().unwrap();
        let auth = NodeAuth::new(&test_config(&dir)).unwrap();

        let empty_hash = auth.keys_and_hash().hash;

        auth.register_announced_key("ship1", vec![1; 32]);
        auth.allow_key("ship1").unwrap();
        let one_hash = auth.keys_and_hash().hash;
        assert_ne!(empty_hash, one_hash);

        auth.delete_key("ship1").unwrap();
        // Hash returns to the value for the empty map.
        let store: KeysAndHash =
            serde_json::from_slice(&std::fs::read(dir.path().join("db/publickeys.txt")).unwrap())
                .unwrap();
        assert!(store.keys.is_empty());
    }
}
