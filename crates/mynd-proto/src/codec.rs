//! Line codec for the MCU serial link.
//!
//! ```text
//!   host → MCU   rpi:<id>:<command>\n
//!   MCU → host   mcu:notify:<key>=<v>[,<v>...]\n
//!                mcu:<id>:<key>=<v>[,<v>...]\n
//!                mcu:<id>:error <message>\n
//! ```
//!
//! Request ids only tag outgoing commands.  Replies are never matched against
//! them, so duplicates after the counter wraps are harmless.

use std::sync::atomic::{AtomicU32, Ordering};

/// Outgoing request ids wrap at this value.
pub const REQUEST_ID_MODULUS: u32 = 10_000;

const NOTIFY_PREFIX: &str = "mcu:notify:";
const MCU_PREFIX: &str = "mcu:";
const RPI_PREFIX: &str = "rpi:";
const ERROR_PREFIX: &str = "error ";

/// A scalar field value.  Integers are preferred; anything else stays text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Text(String),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Text(_) => None,
        }
    }
}

/// Right-hand side of `<key>=...`: one value, or a comma-separated list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Single(Value),
    List(Vec<Value>),
}

impl Payload {
    pub fn single(&self) -> Option<&Value> {
        match self {
            Payload::Single(v) => Some(v),
            Payload::List(_) => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        self.single().and_then(Value::as_int)
    }

    pub fn list(&self) -> Option<&[Value]> {
        match self {
            Payload::List(values) => Some(values),
            Payload::Single(_) => None,
        }
    }
}

/// A decoded MCU line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum McuMessage {
    Notify { key: String, payload: Payload },
    Response { id: i64, key: String, payload: Payload },
    ErrorResponse { id: i64, message: String },
}

/// Frame a command for the MCU.  A trailing newline in `command` is not
/// doubled.
pub fn encode(request_id: u32, command: &str) -> String {
    let mut line = format!("{RPI_PREFIX}{request_id}:{command}");
    if !line.ends_with('\n') {
        line.push('\n');
    }
    line
}

/// Decode one line received from the MCU.  Anything that does not follow
/// the grammar yields `None`.
pub fn decode(line: &str) -> Option<McuMessage> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    if let Some(rest) = line.strip_prefix(NOTIFY_PREFIX) {
        let (key, raw) = rest.split_once('=')?;
        return Some(McuMessage::Notify {
            key: key.to_string(),
            payload: parse_payload(raw),
        });
    }

    let rest = line.strip_prefix(MCU_PREFIX)?;
    let (id, body) = rest.split_once(':')?;
    let id: i64 = id.parse().ok()?;

    if let Some(message) = body.strip_prefix(ERROR_PREFIX) {
        return Some(McuMessage::ErrorResponse {
            id,
            message: message.to_string(),
        });
    }

    let (key, raw) = body.split_once('=')?;
    Some(McuMessage::Response {
        id,
        key: key.to_string(),
        payload: parse_payload(raw),
    })
}

/// Inverse of [`encode`]: split an `rpi:<id>:<command>` line back into its
/// id and command body.
pub fn decode_command(line: &str) -> Option<(u32, &str)> {
    let rest = line.strip_suffix('\n').unwrap_or(line).strip_prefix(RPI_PREFIX)?;
    let (id, command) = rest.split_once(':')?;
    Some((id.parse().ok()?, command))
}

fn parse_payload(raw: &str) -> Payload {
    if !raw.contains(',') {
        return Payload::Single(match raw.trim().parse::<i64>() {
            Ok(v) => Value::Int(v),
            Err(_) => Value::Text(raw.to_string()),
        });
    }

    let fields: Vec<&str> = raw.split(',').map(str::trim).collect();
    let ints: Result<Vec<i64>, _> = fields.iter().map(|f| f.parse::<i64>()).collect();
    match ints {
        Ok(ints) => Payload::List(ints.into_iter().map(Value::Int).collect()),
        Err(_) => Payload::List(
            fields
                .into_iter()
                .map(|f| Value::Text(f.to_string()))
                .collect(),
        ),
    }
}

/// Wrapping counter for outgoing request ids.
#[derive(Debug, Default)]
pub struct RequestIds {
    next: AtomicU32,
}

impl RequestIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current id and advances the counter, wrapping to 0 after
    /// `REQUEST_ID_MODULUS - 1`.
    pub fn next_id(&self) -> u32 {
        let mut current = self.next.load(Ordering::Relaxed);
        loop {
            let following = (current + 1) % REQUEST_ID_MODULUS;
            match self.next.compare_exchange_weak(
                current,
                following,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return current,
                Err(actual) => current = actual,
            }
        }
    }
}
