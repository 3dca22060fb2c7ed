//! Message, method and subject types
//!
//! A message is the unit of work in the fabric. Every message resolves to a
//! subject `(to-node, method, event)` which owns exactly one publisher
//! process on the sending side and at most one subscriber process per node.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, StewardError};

/// Opaque node identifier, unique per participant.
pub type Node = String;

/// Delivery semantics a method declares for its subject.
///
/// ACK methods expect a reply on the reply inbox; NACK methods are
/// fire-and-forget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Event {
    Ack,
    Nack,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Ack => write!(f, "EventACK"),
            Event::Nack => write!(f, "EventNACK"),
        }
    }
}

/// The request kinds a message can carry.
///
/// The serialized names are the wire names used in ingress JSON/YAML and in
/// broker subjects. Unknown names fail deserialization at ingress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    #[serde(rename = "REQCliCommand")]
    CliCommand,
    #[serde(rename = "REQCliCommandCont")]
    CliCommandCont,
    #[serde(rename = "REQToFileAppend")]
    ToFileAppend,
    #[serde(rename = "REQToFile")]
    ToFile,
    #[serde(rename = "REQCopyFileFrom")]
    CopyFileFrom,
    #[serde(rename = "REQCopyFileTo")]
    CopyFileTo,
    #[serde(rename = "REQHello")]
    Hello,
    #[serde(rename = "REQErrorLog")]
    ErrorLog,
    #[serde(rename = "REQPing")]
    Ping,
    #[serde(rename = "REQPong")]
    Pong,
    #[serde(rename = "REQHttpGet")]
    HttpGet,
    #[serde(rename = "REQTailFile")]
    TailFile,
    #[serde(rename = "REQOpProcessList")]
    OpProcessList,
    #[serde(rename = "REQOpProcessStart")]
    OpProcessStart,
    #[serde(rename = "REQOpProcessStop")]
    OpProcessStop,
    #[serde(rename = "REQRelay")]
    Relay,
    #[serde(rename = "REQPublicKey")]
    PublicKey,
    #[serde(rename = "REQKeysRequestUpdate")]
    KeysRequestUpdate,
    #[serde(rename = "REQKeysDeliverUpdate")]
    KeysDeliverUpdate,
    #[serde(rename = "REQKeysAllow")]
    KeysAllow,
    #[serde(rename = "REQKeysDelete")]
    KeysDelete,
    #[serde(rename = "REQAclRequestUpdate")]
    AclRequestUpdate,
    #[serde(rename = "REQAclDeliverUpdate")]
    AclDeliverUpdate,
    #[serde(rename = "REQAclAddCommand")]
    AclAddCommand,
    #[serde(rename = "REQAclDeleteCommand")]
    AclDeleteCommand,
    #[serde(rename = "REQAclDeleteSource")]
    AclDeleteSource,
    #[serde(rename = "REQAclGroupNodesAddNode")]
    AclGroupNodesAddNode,
    #[serde(rename = "REQAclGroupNodesDeleteNode")]
    AclGroupNodesDeleteNode,
    #[serde(rename = "REQAclGroupNodesDeleteGroup")]
    AclGroupNodesDeleteGroup,
    #[serde(rename = "REQAclGroupCommandsAddCommand")]
    AclGroupCommandsAddCommand,
    #[serde(rename = "REQAclGroupCommandsDeleteCommand")]
    AclGroupCommandsDeleteCommand,
    #[serde(rename = "REQAclGroupCommandsDeleteGroup")]
    AclGroupCommandsDeleteGroup,
    #[serde(rename = "REQAclExport")]
    AclExport,
    #[serde(rename = "REQAclImport")]
    AclImport,
    #[serde(rename = "REQTest")]
    Test,
    #[serde(rename = "REQNone")]
    None,
}

impl Method {
    /// The delivery semantics this method declares.
    pub fn event(&self) -> Event {
        match self {
            Method::Hello
            | Method::KeysRequestUpdate
            | Method::KeysDeliverUpdate
            | Method::AclRequestUpdate
            | Method::AclDeliverUpdate
            | Method::None => Event::Nack,
            _ => Event::Ack,
        }
    }

    /// The wire name, e.g. `REQCliCommand`.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Method::CliCommand => "REQCliCommand",
            Method::CliCommandCont => "REQCliCommandCont",
            Method::ToFileAppend => "REQToFileAppend",
            Method::ToFile => "REQToFile",
            Method::CopyFileFrom => "REQCopyFileFrom",
            Method::CopyFileTo => "REQCopyFileTo",
            Method::Hello => "REQHello",
            Method::ErrorLog => "REQErrorLog",
            Method::Ping => "REQPing",
            Method::Pong => "REQPong",
            Method::HttpGet => "REQHttpGet",
            Method::TailFile => "REQTailFile",
            Method::OpProcessList => "REQOpProcessList",
            Method::OpProcessStart => "REQOpProcessStart",
            Method::OpProcessStop => "REQOpProcessStop",
            Method::Relay => "REQRelay",
            Method::PublicKey => "REQPublicKey",
            Method::KeysRequestUpdate => "REQKeysRequestUpdate",
            Method::KeysDeliverUpdate => "REQKeysDeliverUpdate",
            Method::KeysAllow => "REQKeysAllow",
            Method::KeysDelete => "REQKeysDelete",
            Method::AclRequestUpdate => "REQAclRequestUpdate",
            Method::AclDeliverUpdate => "REQAclDeliverUpdate",
            Method::AclAddCommand => "REQAclAddCommand",
            Method::AclDeleteCommand => "REQAclDeleteCommand",
            Method::AclDeleteSource => "REQAclDeleteSource",
            Method::AclGroupNodesAddNode => "REQAclGroupNodesAddNode",
            Method::AclGroupNodesDeleteNode => "REQAclGroupNodesDeleteNode",
            Method::AclGroupNodesDeleteGroup => "REQAclGroupNodesDeleteGroup",
            Method::AclGroupCommandsAddCommand => "REQAclGroupCommandsAddCommand",
            Method::AclGroupCommandsDeleteCommand => "REQAclGroupCommandsDeleteCommand",
            Method::AclGroupCommandsDeleteGroup => "REQAclGroupCommandsDeleteGroup",
            Method::AclExport => "REQAclExport",
            Method::AclImport => "REQAclImport",
            Method::Test => "REQTest",
            Method::None => "REQNone",
        }
    }

    /// Parse a wire name back into a method.
    pub fn from_wire(name: &str) -> Result<Method> {
        serde_json::from_value(serde_json::Value::String(name.to_string()))
            .map_err(|_| StewardError::UnknownMethod(name.to_string()))
    }

    /// Whether requests of this method must carry a valid argument
    /// signature when signature enforcement is on.
    pub fn requires_signature(&self) -> bool {
        matches!(self, Method::CliCommand | Method::CliCommandCont)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.wire_name())
    }
}

fn default_ack_timeout() -> u64 {
    5
}

fn default_method_timeout() -> i64 {
    10
}

/// The unit of work moving through the fabric.
///
/// Field names mirror the ingress JSON shape, so operator-written message
/// files deserialize directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Target node. Required unless `to_nodes` is used for fan-out.
    #[serde(rename = "toNode", default)]
    pub to_node: Node,

    /// Fan-out targets, expanded into individual messages at ingress.
    #[serde(rename = "toNodes", default)]
    pub to_nodes: Vec<Node>,

    /// Assigned by the ring buffer when the message is persisted.
    #[serde(default)]
    pub id: u64,

    /// Stamped by ingress with the local node name.
    #[serde(rename = "fromNode", default)]
    pub from_node: Node,

    /// The request kind to execute on the target.
    pub method: Method,

    #[serde(rename = "methodArgs", default)]
    pub method_args: Vec<String>,

    /// Raw payload bytes, e.g. file content or handler output.
    #[serde(default)]
    pub data: Vec<u8>,

    /// Seconds to wait for a broker-level ACK before retrying.
    #[serde(rename = "ACKTimeout", default = "default_ack_timeout")]
    pub ack_timeout: u64,

    /// Max publish attempts. 0 means retry forever.
    #[serde(default)]
    pub retries: u32,

    /// Seconds the method handler may run. -1 means effectively no limit.
    #[serde(rename = "methodTimeout", default = "default_method_timeout")]
    pub method_timeout: i64,

    /// Method used for the reply carrying handler output.
    /// Unset defaults to `ToFileAppend`; `None` suppresses the reply.
    #[serde(rename = "replyMethod", default)]
    pub reply_method: Option<Method>,

    #[serde(rename = "replyMethodArgs", default)]
    pub reply_method_args: Vec<String>,

    #[serde(rename = "replyACKTimeout", default = "default_ack_timeout")]
    pub reply_ack_timeout: u64,

    #[serde(rename = "replyRetries", default)]
    pub reply_retries: u32,

    #[serde(rename = "replyMethodTimeout", default = "default_method_timeout")]
    pub reply_method_timeout: i64,

    /// Folder relative to the subscribers data folder for file output.
    #[serde(default)]
    pub directory: String,

    #[serde(rename = "fileName", default)]
    pub file_name: String,

    /// Set on messages constructed as replies to an earlier request.
    #[serde(rename = "isReply", default)]
    pub is_reply: bool,

    /// Data-stripped copy of the request this message replies to.
    #[serde(rename = "previousMessage", default)]
    pub previous_message: Option<Box<Message>>,

    /// ed25519 signature over `method_args.join(" ")`.
    #[serde(rename = "argSignature", default)]
    pub arg_signature: Vec<u8>,
}

impl Default for Message {
    fn default() -> Self {
        Self {
            to_node: String::new(),
            to_nodes: Vec::new(),
            id: 0,
            from_node: String::new(),
            method: Method::None,
            method_args: Vec::new(),
            data: Vec::new(),
            ack_timeout: default_ack_timeout(),
            retries: 0,
            method_timeout: default_method_timeout(),
            reply_method: None,
            reply_method_args: Vec::new(),
            reply_ack_timeout: default_ack_timeout(),
            reply_retries: 0,
            reply_method_timeout: default_method_timeout(),
            directory: String::new(),
            file_name: String::new(),
            is_reply: false,
            previous_message: None,
            arg_signature: Vec::new(),
        }
    }
}

impl Message {
    /// The stringified arguments as covered by the signature and checked
    /// against the ACL.
    pub fn args_string(&self) -> String {
        self.method_args.join(" ")
    }

    /// Copy of this message with the data payload dropped, used as the
    /// `previous_message` of a reply.
    pub fn stripped(&self) -> Message {
        let mut m = self.clone();
        m.data = Vec::new();
        m
    }
}

/// Addressing tuple for one logical channel on the broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subject {
    pub to_node: Node,
    pub event: Event,
    pub method: Method,
}

impl Subject {
    pub fn new(method: Method, to_node: &str) -> Self {
        Self {
            to_node: to_node.to_string(),
            event: method.event(),
            method,
        }
    }

    /// Canonical broker subject name `<toNode>.<method>.<event>`.
    pub fn name(&self) -> String {
        format!("{}.{}.{}", self.to_node, self.method, self.event)
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A message together with its derived subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectAndMessage {
    pub subject: Subject,
    pub message: Message,
}

impl SubjectAndMessage {
    /// Validate addressing and resolve the method's declared event into a
    /// subject.
    pub fn new(message: Message) -> Result<Self> {
        if message.to_node.is_empty() {
            return Err(StewardError::AddressingMissing(format!(
                "toNode empty for method {}",
                message.method
            )));
        }

        let subject = Subject::new(message.method, &message.to_node);
        Ok(Self { subject, message })
    }
}

/// Expand fan-out messages into one message per target node.
///
/// A message with `to_node` set wins over `to_nodes`. A message with
/// neither is dropped by the caller via the error from
/// [`SubjectAndMessage::new`].
pub fn expand_to_nodes(messages: Vec<Message>) -> Vec<Message> {
    let mut out = Vec::with_capacity(messages.len());

    for m in messages {
        if !m.to_node.is_empty() || m.to_nodes.is_empty() {
            out.push(m);
            continue;
        }

        for node in &m.to_nodes {
            let mut single = m.clone();
            single.to_nodes = Vec::new();
            single.to_node = node.clone();
            out.push(single);
        }
    }

    out
}

/// Encode a message for the broker wire and the KV store.
pub fn encode_message(m: &Message) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec(m)?)
}

/// Decode a message from wire bytes.
pub fn decode_message(b: &[u8]) -> Result<Message> {
    Ok(rmp_serde::from_slice(b)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        Message {
            to_node: "ship1".to_string(),
            from_node: "central".to_string(),
            method: Method::CliCommand,
            method_args: vec!["bash".into(), "-c".into(), "tree ./".into()],
            ack_timeout: 5,
            retries: 3,
            method_timeout: 10,
            reply_method: Some(Method::ToFileAppend),
            directory: "cmd_result".into(),
            file_name: "out.log".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_codec_roundtrip() {
        let m = sample();
        let b = encode_message(&m).unwrap();
        let back = decode_message(&b).unwrap();
        assert_eq!(m, back);
    }

    #[test]
    fn test_codec_deterministic() {
        let m = sample();
        assert_eq!(encode_message(&m).unwrap(), encode_message(&m).unwrap());
    }

    #[test]
    fn test_subject_name() {
        let s = Subject::new(Method::CliCommand, "ship1");
        assert_eq!(s.name(), "ship1.REQCliCommand.EventACK");

        let s = Subject::new(Method::Hello, "central");
        assert_eq!(s.name(), "central.REQHello.EventNACK");
    }

    #[test]
    fn test_sam_requires_to_node() {
        let mut m = sample();
        m.to_node = String::new();
        assert!(matches!(
            SubjectAndMessage::new(m),
            Err(StewardError::AddressingMissing(_))
        ));
    }

    #[test]
    fn test_fan_out_expansion() {
        let mut m = sample();
        m.to_node = String::new();
        m.to_nodes = vec!["a".into(), "b".into(), "c".into()];

        let out = expand_to_nodes(vec![m]);
        assert_eq!(out.len(), 3);
        for (i, n) in ["a", "b", "c"].iter().enumerate() {
            assert_eq!(out[i].to_node, *n);
            assert!(out[i].to_nodes.is_empty());
        }
    }

    #[test]
    fn test_to_node_wins_over_to_nodes() {
        let mut m = sample();
        m.to_nodes = vec!["a".into(), "b".into()];

        let out = expand_to_nodes(vec![m]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to_node, "ship1");
    }

    #[test]
    fn test_unknown_method_rejected() {
        let raw = r#"[{"toNode":"ship1","method":"REQNotAThing"}]"#;
        let parsed: std::result::Result<Vec<Message>, _> = serde_yaml::from_str(raw);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_ingress_json_shape() {
        let raw = r#"
          [ { "toNode":"ship1",
              "method":"REQCliCommand",
              "methodArgs":["bash","-c","tree ./"],
              "replyMethod":"REQToFileAppend",
              "ACKTimeout":5,"retries":3,
              "methodTimeout":10,
              "directory":"cmd_result","fileName":"out.log" } ]"#;
        let parsed: Vec<Message> = serde_yaml::from_str(raw).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].method, Method::CliCommand);
        assert_eq!(parsed[0].retries, 3);
        assert_eq!(parsed[0].reply_method, Some(Method::ToFileAppend));
    }

    #[test]
    fn test_method_from_wire() {
        assert_eq!(Method::from_wire("REQPing").unwrap(), Method::Ping);
        assert!(Method::from_wire("bogus").is_err());
    }
}
