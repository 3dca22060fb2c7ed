//! Access control schema
//!
//! The central node owns the source schema: a map of ACL triples
//! `(host, source, command)` where host and source may be node-group
//! identifiers and command may be a command-group identifier. Every
//! mutation regenerates the de-grouped, per-host materialization, encodes
//! it deterministically as CBOR and stamps it with a SHA-256 hash. Nodes
//! poll central with their current hash and receive the fresh payload only
//! when it differs.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::sha256;
use crate::error::Result;
use crate::message::Node;

/// Prefix marking a node-group identifier in the schema.
pub const NODE_GROUP_PREFIX: &str = "grp_nodes_";
/// Prefix marking a command-group identifier in the schema.
pub const COMMAND_GROUP_PREFIX: &str = "grp_cmds_";

/// Membership marker. Encodes as an empty CBOR map, so a set of commands
/// travels as `map<command, {}>` on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Present {}

/// The de-grouped commands a host accepts, keyed by the node they may
/// come from.
pub type HostAcl = BTreeMap<Node, BTreeMap<String, Present>>;

/// Operator-maintained source schema. Sorted maps keep the exported form
/// and the generated encodings stable across hosts and runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaMain {
    /// host (or node group) -> source (or node group) -> commands (or
    /// command groups)
    pub acl_map: BTreeMap<Node, BTreeMap<Node, BTreeSet<String>>>,
    pub node_group_map: BTreeMap<String, BTreeSet<Node>>,
    pub command_group_map: BTreeMap<String, BTreeSet<String>>,
}

/// De-grouped materialization for one host: the CBOR payload shipped to
/// the node and the hash used for the quick diff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostAclsSerializedWithHash {
    pub data: Vec<u8>,
    pub hash: [u8; 32],
}

/// Materialized per-host ACLs, regenerated after every schema mutation.
#[derive(Debug, Clone, Default)]
pub struct SchemaGenerated {
    pub generated_acls_map: BTreeMap<Node, HostAclsSerializedWithHash>,
    pub nodes_hash_map: BTreeMap<Node, [u8; 32]>,
}

/// Central ACL authority. Lives only on the configured central node.
#[derive(Debug, Default)]
pub struct CentralAuth {
    schema_main: SchemaMain,
    schema_generated: SchemaGenerated,
}

impl CentralAuth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow `source` to run `command` on `host`. Host and source may be
    /// group identifiers.
    pub fn acl_add_command(&mut self, host: &str, source: &str, command: &str) {
        self.schema_main
            .acl_map
            .entry(host.to_string())
            .or_default()
            .entry(source.to_string())
            .or_default()
            .insert(command.to_string());
        debug!(host, source, command, "acl command added");
        self.generate();
    }

    /// Remove a single command for `source` on `host`.
    pub fn acl_delete_command(&mut self, host: &str, source: &str, command: &str) {
        if let Some(sources) = self.schema_main.acl_map.get_mut(host) {
            if let Some(commands) = sources.get_mut(source) {
                commands.remove(command);
                if commands.is_empty() {
                    sources.remove(source);
                }
            }
            if sources.is_empty() {
                self.schema_main.acl_map.remove(host);
            }
        }
        self.generate();
    }

    /// Remove everything `source` may do on `host`.
    pub fn acl_delete_source(&mut self, host: &str, source: &str) {
        if let Some(sources) = self.schema_main.acl_map.get_mut(host) {
            sources.remove(source);
            if sources.is_empty() {
                self.schema_main.acl_map.remove(host);
            }
        }
        self.generate();
    }

    pub fn group_nodes_add_node(&mut self, group: &str, node: &str) {
        self.schema_main
            .node_group_map
            .entry(group.to_string())
            .or_default()
            .insert(node.to_string());
        self.generate();
    }

    pub fn group_nodes_delete_node(&mut self, group: &str, node: &str) {
        if let Some(nodes) = self.schema_main.node_group_map.get_mut(group) {
            nodes.remove(node);
            if nodes.is_empty() {
                self.schema_main.node_group_map.remove(group);
            }
        }
        self.generate();
    }

    pub fn group_nodes_delete_group(&mut self, group: &str) {
        self.schema_main.node_group_map.remove(group);
        self.generate();
    }

    pub fn group_commands_add_command(&mut self, group: &str, command: &str) {
        self.schema_main
            .command_group_map
            .entry(group.to_string())
            .or_default()
            .insert(command.to_string());
        self.generate();
    }

    pub fn group_commands_delete_command(&mut self, group: &str, command: &str) {
        if let Some(commands) = self.schema_main.command_group_map.get_mut(group) {
            commands.remove(command);
            if commands.is_empty() {
                self.schema_main.command_group_map.remove(group);
            }
        }
        self.generate();
    }

    pub fn group_commands_delete_group(&mut self, group: &str) {
        self.schema_main.command_group_map.remove(group);
        self.generate();
    }

    /// Serialize the source schema for backup or transfer.
    pub fn export(&self) -> Result<Vec<u8>> {
        Ok(serde_cbor::to_vec(&self.schema_main)?)
    }

    /// Replace the source schema with an exported one and regenerate.
    pub fn import(&mut self, data: &[u8]) -> Result<()> {
        self.schema_main = serde_cbor::from_slice(data)?;
        self.generate();
        info!("acl schema imported");
        Ok(())
    }

    /// The materialization for one host, if it has any ACLs.
    pub fn generated_for(&self, host: &str) -> Option<&HostAclsSerializedWithHash> {
        self.schema_generated.generated_acls_map.get(host)
    }

    /// The quick-diff hash for one host.
    pub fn hash_for(&self, host: &str) -> Option<[u8; 32]> {
        self.schema_generated.nodes_hash_map.get(host).copied()
    }

    /// Snapshot of the generated state (for tests and introspection).
    pub fn generated(&self) -> &SchemaGenerated {
        &self.schema_generated
    }

    fn expand_nodes(&self, name: &str) -> Vec<Node> {
        if let Some(members) = name
            .starts_with(NODE_GROUP_PREFIX)
            .then(|| self.schema_main.node_group_map.get(name))
            .flatten()
        {
            members.iter().cloned().collect()
        } else {
            vec![name.to_string()]
        }
    }

    fn expand_commands(&self, name: &str) -> Vec<String> {
        if let Some(members) = name
            .starts_with(COMMAND_GROUP_PREFIX)
            .then(|| self.schema_main.command_group_map.get(name))
            .flatten()
        {
            members.iter().cloned().collect()
        } else {
            vec![name.to_string()]
        }
    }

    /// Rebuild the per-host materialization from the source schema.
    ///
    /// Pure function of the schema: the sorted maps encode to identical
    /// bytes for identical inputs, so the hashes are stable across hosts,
    /// runs and insertion orders.
    fn generate(&mut self) {
        let mut per_host: BTreeMap<Node, HostAcl> = BTreeMap::new();

        for (host_entry, sources) in &self.schema_main.acl_map {
            for host in self.expand_nodes(host_entry) {
                for (source_entry, commands) in sources {
                    for source in self.expand_nodes(source_entry) {
                        for command_entry in commands {
                            for command in self.expand_commands(command_entry) {
                                per_host
                                    .entry(host.clone())
                                    .or_default()
                                    .entry(source.clone())
                                    .or_default()
                                    .insert(command, Present {});
                            }
                        }
                    }
                }
            }
        }

        let mut generated = SchemaGenerated::default();
        for (host, acl) in per_host {
            // Serialization failure cannot happen for string maps; skip
            // the host rather than poison the whole schema if it ever does.
            let Ok(data) = serde_cbor::to_vec(&acl) else {
                continue;
            };
            let Ok(hash) = host_acl_hash(&host, &acl) else {
                continue;
            };
            generated.nodes_hash_map.insert(host.clone(), hash);
            generated
                .generated_acls_map
                .insert(host, HostAclsSerializedWithHash { data, hash });
        }

        self.schema_generated = generated;
    }
}

/// Hash a host's ACL over its slice form: the host node followed by its
/// sources, each with a sorted command list. Slices pin the element order
/// the digest sees, so equal ACLs hash equally everywhere.
fn host_acl_hash(host: &str, acl: &HostAcl) -> Result<[u8; 32]> {
    #[derive(Serialize)]
    struct HostSources<'a> {
        #[serde(rename = "HostNode")]
        host_node: &'a str,
        #[serde(rename = "SourceCommands")]
        source_commands: Vec<SourceCommands<'a>>,
    }

    #[derive(Serialize)]
    struct SourceCommands<'a> {
        #[serde(rename = "Source")]
        source: &'a str,
        #[serde(rename = "Commands")]
        commands: Vec<&'a str>,
    }

    let source_commands = acl
        .iter()
        .map(|(source, commands)| SourceCommands {
            source,
            commands: commands.keys().map(String::as_str).collect(),
        })
        .collect();

    let encoded = serde_cbor::to_vec(&HostSources {
        host_node: host,
        source_commands,
    })?;

    Ok(sha256(&encoded))
}

/// Node-side copy of the ACL delivered from central, persisted so a node
/// keeps enforcing across restarts while central is unreachable.
#[derive(Debug, Default)]
pub struct NodeAcl {
    map: HostAcl,
    hash: [u8; 32],
    file_path: PathBuf,
}

impl NodeAcl {
    /// Load the persisted copy if one exists.
    pub fn load(database_folder: &Path) -> Result<Self> {
        let file_path = database_folder.join("acl.cbor");

        let mut acl = NodeAcl {
            file_path,
            ..Default::default()
        };

        if acl.file_path.exists() {
            let raw = std::fs::read(&acl.file_path)?;
            let stored: HostAclsSerializedWithHash = serde_cbor::from_slice(&raw)?;
            acl.map = serde_cbor::from_slice(&stored.data)?;
            acl.hash = stored.hash;
        }

        Ok(acl)
    }

    /// The hash sent to central in update requests.
    pub fn hash(&self) -> [u8; 32] {
        self.hash
    }

    /// Whether `source` may run `command` here.
    pub fn is_allowed(&self, source: &str, command: &str) -> bool {
        self.map
            .get(source)
            .is_some_and(|commands| commands.contains_key(command))
    }

    /// Install a delivered update (a serialized payload-with-hash) and
    /// persist it.
    pub fn replace(&mut self, payload: &[u8]) -> Result<()> {
        let stored: HostAclsSerializedWithHash = serde_cbor::from_slice(payload)?;
        self.map = serde_cbor::from_slice(&stored.data)?;
        self.hash = stored.hash;

        if let Some(parent) = self.file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.file_path, payload)?;
        info!(sources = self.map.len(), "node acl replaced from update");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_node_acl() {
        let mut c = CentralAuth::new();
        c.acl_add_command("ship101", "admin", "HORSE");
        c.acl_add_command("ship101", "admin", "PIG");

        let generated = c.generated_for("ship101").unwrap();
        let acl: HostAcl = serde_cbor::from_slice(&generated.data).unwrap();
        let commands = acl.get("admin").unwrap();
        assert!(commands.contains_key("HORSE"));
        assert!(commands.contains_key("PIG"));
        assert_eq!(commands.len(), 2);
    }

    #[test]
    fn test_hash_independent_of_insertion_order() {
        let mut a = CentralAuth::new();
        a.acl_add_command("ship101", "admin", "HORSE");
        a.acl_add_command("ship101", "admin", "PIG");
        a.acl_add_command("ship101", "operator1", "date");

        let mut b = CentralAuth::new();
        b.acl_add_command("ship101", "operator1", "date");
        b.acl_add_command("ship101", "admin", "PIG");
        b.acl_add_command("ship101", "admin", "HORSE");

        assert_eq!(
            a.generated_for("ship101").unwrap().hash,
            b.generated_for("ship101").unwrap().hash
        );
        assert_eq!(
            a.generated_for("ship101").unwrap().data,
            b.generated_for("ship101").unwrap().data
        );
    }

    #[test]
    fn test_delete_command_and_source() {
        let mut c = CentralAuth::new();
        c.acl_add_command("ship101", "admin", "HORSE");
        c.acl_add_command("ship101", "admin", "PIG");

        c.acl_delete_command("ship101", "admin", "HORSE");
        let acl: HostAcl =
            serde_cbor::from_slice(&c.generated_for("ship101").unwrap().data).unwrap();
        assert!(!acl.get("admin").unwrap().contains_key("HORSE"));

        c.acl_delete_source("ship101", "admin");
        assert!(c.generated_for("ship101").is_none());
    }

    #[test]
    fn test_node_acl_enforcement_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();

        let mut c = CentralAuth::new();
        c.acl_add_command("ship101", "admin", "dmesg");

        let mut node_acl = NodeAcl::load(dir.path()).unwrap();
        assert!(!node_acl.is_allowed("admin", "dmesg"));

        let payload = serde_cbor::to_vec(c.generated_for("ship101").unwrap()).unwrap();
        node_acl.replace(&payload).unwrap();
        assert!(node_acl.is_allowed("admin", "dmesg"));
        assert!(!node_acl.is_allowed("admin", "reboot"));
        assert!(!node_acl.is_allowed("intruder", "dmesg"));
        assert_eq!(node_acl.hash(), c.hash_for("ship101").unwrap());

        // Persisted copy survives a reload.
        let reloaded = NodeAcl::load(dir.path()).unwrap();
        assert!(reloaded.is_allowed("admin", "dmesg"));
        assert_eq!(reloaded.hash(), node_acl.hash());
    }
}
