//! Control messages exchanged with the management server

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtocolError;
use crate::protocol::{ack, opcode};

/// One JSON control document.
///
/// `ack`, `msg set` and `msg id` are required on the wire; `id` and
/// `dev_type` default to zero since the server does not always echo them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub dev_type: i64,
    pub ack: u8,
    #[serde(rename = "msg set")]
    pub msg_set: u8,
    #[serde(rename = "msg id")]
    pub msg_id: u8,
    #[serde(rename = "msg data", default, skip_serializing_if = "Option::is_none")]
    pub msg_data: Option<Value>,
}

impl ControlMessage {
    pub fn opcode(&self) -> u16 {
        opcode::compose(self.msg_set, self.msg_id)
    }

    pub fn is_ack(&self) -> bool {
        self.ack == ack::ACK
    }

    pub fn from_json(payload: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Look up `msg data.<key>`.
    pub fn data_field(&self, key: &'static str) -> Result<&Value, ProtocolError> {
        self.msg_data
            .as_ref()
            .and_then(|d| d.get(key))
            .ok_or(ProtocolError::MissingField(key))
    }

    pub fn data_f64(&self, key: &'static str) -> Result<f64, ProtocolError> {
        self.data_field(key)?
            .as_f64()
            .ok_or_else(|| ProtocolError::InvalidField {
                field: key,
                reason: "expected a number".into(),
            })
    }

    pub fn data_i64(&self, key: &'static str) -> Result<i64, ProtocolError> {
        self.data_field(key)?
            .as_i64()
            .ok_or_else(|| ProtocolError::InvalidField {
                field: key,
                reason: "expected an integer".into(),
            })
    }

    pub fn data_str(&self, key: &'static str) -> Result<&str, ProtocolError> {
        self.data_field(key)?
            .as_str()
            .ok_or_else(|| ProtocolError::InvalidField {
                field: key,
                reason: "expected a string".into(),
            })
    }
}

/// Immutable per-response builder.
///
/// Carries the addressing fields every outbound message shares. Each call
/// produces a fresh message; nothing is mutated between sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    pub id: i64,
    pub dev_type: i64,
}

impl Envelope {
    pub fn new(id: i64, dev_type: i64) -> Self {
        Self { id, dev_type }
    }

    fn build(&self, ack_flag: u8, op: u16, data: Option<Value>) -> ControlMessage {
        let (msg_set, msg_id) = opcode::split(op);
        ControlMessage {
            id: self.id,
            dev_type: self.dev_type,
            ack: ack_flag,
            msg_set,
            msg_id,
            msg_data: data,
        }
    }

    /// Unsolicited report or query answer (ack = 0).
    pub fn report(&self, op: u16, data: Value) -> ControlMessage {
        self.build(ack::NOT_ACK, op, Some(data))
    }

    /// Acknowledgment of a request (ack = 1).
    pub fn ack(&self, op: u16, data: Value) -> ControlMessage {
        self.build(ack::ACK, op, Some(data))
    }

    /// Acknowledgment carrying only a return code.
    pub fn ack_code(&self, op: u16, code: i64) -> ControlMessage {
        let mut data = Map::new();
        data.insert(crate::protocol::field::RETURN_CODE.into(), Value::from(code));
        self.ack(op, Value::Object(data))
    }

    pub fn heartbeat(&self) -> ControlMessage {
        self.build(ack::NOT_ACK, opcode::HEARTBEAT, None)
    }
}
