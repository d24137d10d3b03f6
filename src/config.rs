use anyhow::anyhow;
use clap::Parser;
use nostr::key::SecretKey;
use nostr::prelude::FromBech32;
use nostr::{Event, Keys};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Parser, Debug, Clone)]
#[command(version, author, about)]
/// A data vending machine: compute jobs for sats over nostr.
pub struct Config {
    /// Postgres connection string for the user store
    #[clap(long)]
    pub pg_url: String,
    /// Location of the keys file
    #[clap(default_value = ".", long)]
    pub data_dir: String,
    /// Relay to connect to, can be specified multiple times
    #[clap(short, long)]
    pub relay: Vec<String>,
    /// Per-send relay timeout in seconds
    #[clap(default_value_t = 5, long)]
    pub relay_timeout: u64,
    /// Signing key (hex or nsec); generated and persisted when omitted
    #[clap(long)]
    pub private_key: Option<String>,
    /// Display name used in logs and the NIP-89 announcement
    #[clap(default_value_t = String::from("Task DVM"), long)]
    pub name: String,
    /// LNBits instance url
    #[clap(default_value_t = String::from("https://legend.lnbits.com"), long)]
    pub lnbits_url: String,
    /// LNBits invoice key; omitting it disables invoice issuance
    #[clap(long)]
    pub lnbits_invoice_key: Option<String>,
    /// LNBits admin key; omitting it disables refunds
    #[clap(long)]
    pub lnbits_admin_key: Option<String>,
    /// Publish results before payment settles
    #[clap(long)]
    pub show_result_before_payment: bool,
    /// Run the script worker with the interpreter of its own virtualenv
    /// under cache/venvs instead of the system one
    #[clap(long)]
    pub use_own_venv: bool,
    /// Script to register as a subprocess worker
    #[clap(long)]
    pub script: Option<PathBuf>,
    /// Identifier passed to the subprocess worker
    #[clap(default_value_t = String::from("task-dvm"), long)]
    pub identifier: String,
    /// Task name served by the script worker
    #[clap(default_value_t = String::from("generic"), long)]
    pub script_task: String,
    /// Request kind served by the script worker
    #[clap(default_value_t = 5999, long)]
    pub script_kind: u16,
    /// Fixed price of the script worker in sats
    #[clap(default_value_t = 0, long)]
    pub script_fix_cost: u64,
    /// Per-unit price of the script worker in sats
    #[clap(default_value_t = 0, long)]
    pub script_per_unit_cost: u64,
}

impl Config {
    pub fn keys_file(&self) -> PathBuf {
        let mut path = PathBuf::from(&self.data_dir);
        path.push("keys.json");
        path
    }

    pub fn explicit_secret_key(&self) -> anyhow::Result<Option<SecretKey>> {
        self.private_key.as_deref().map(parse_secret_key).transpose()
    }
}

/// Accepts both bech32 (`nsec...`) and raw hex keys.
pub fn parse_secret_key(s: &str) -> anyhow::Result<SecretKey> {
    SecretKey::from_bech32(s)
        .or_else(|_| SecretKey::from_str(s))
        .map_err(|_| anyhow!("private key is neither nsec nor hex"))
}

mod secret_key_serde {
    use super::SecretKey;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::str::FromStr;

    pub fn serialize<S: Serializer>(key: &SecretKey, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&key.display_secret().to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SecretKey, D::Error> {
        let s = String::deserialize(deserializer)?;
        SecretKey::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Signing key plus the announcement events already published with it,
/// persisted across restarts.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerKeys {
    #[serde(with = "secret_key_serde")]
    server_key: SecretKey,
    pub kind0: Option<Event>,
    pub kind31990: Option<Event>,
}

impl ServerKeys {
    fn new(server_key: SecretKey) -> Self {
        ServerKeys {
            server_key,
            kind0: None,
            kind31990: None,
        }
    }

    pub fn keys(&self) -> Keys {
        Keys::new(self.server_key.clone())
    }

    /// Load the persisted keys, seed them from an explicitly configured key,
    /// or generate fresh ones. A configured key that differs from the stored
    /// one takes precedence and resets the announcement state.
    pub fn load(path: &PathBuf, configured: Option<SecretKey>) -> ServerKeys {
        let stored: Option<ServerKeys> = File::open(path)
            .ok()
            .and_then(|file| serde_json::from_reader(BufReader::new(file)).ok());

        let keys = match (stored, configured) {
            (Some(stored), None) => return stored,
            (Some(stored), Some(configured)) if stored.server_key == configured => return stored,
            (_, Some(configured)) => ServerKeys::new(configured),
            (None, None) => ServerKeys::new(
                Keys::generate()
                    .secret_key()
                    .expect("generated keys have a secret key")
                    .clone(),
            ),
        };

        keys.write(path);
        keys
    }

    pub fn write(&self, path: &PathBuf) {
        let json_str = serde_json::to_string(&self).expect("Could not serialize data");

        let mut file = File::create(path).expect("Could not create file");
        file.write_all(json_str.as_bytes())
            .expect("Could not write to file");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use nostr::ToBech32;

    #[test]
    fn parses_hex_and_bech32_keys() {
        let keys = Keys::generate();
        let secret = keys.secret_key().unwrap();

        let hex = secret.display_secret().to_string();
        assert_eq!(parse_secret_key(&hex).unwrap(), secret.clone());

        let nsec = secret.to_bech32().unwrap();
        assert_eq!(parse_secret_key(&nsec).unwrap(), secret.clone());

        assert!(parse_secret_key("not a key").is_err());
    }

    #[test]
    fn server_keys_persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");

        let first = ServerKeys::load(&path, None);
        let reloaded = ServerKeys::load(&path, None);
        assert_eq!(first.keys().public_key(), reloaded.keys().public_key());

        // an explicitly configured key replaces the stored one
        let configured = Keys::generate().secret_key().unwrap().clone();
        let replaced = ServerKeys::load(&path, Some(configured.clone()));
        assert_eq!(replaced.keys().secret_key().unwrap(), &configured);
        assert!(replaced.kind0.is_none());
    }
}
