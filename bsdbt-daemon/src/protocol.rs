/*!
 * bsdbtd Wire Protocol
 * One JSON object per line in each direction
 */

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::bluetooth::Device;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid JSON format: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Request must be a JSON object")]
    NotAnObject,

    #[error("Request is missing \"action\"")]
    MissingAction,

    #[error("\"action\" must be a string")]
    ActionNotString,

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Invalid params for {action}: {source}")]
    InvalidParams {
        action: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Request is not valid UTF-8")]
    InvalidUtf8,

    #[error("Request line exceeds {0} bytes")]
    Oversized(usize),
}

/// Raw `pair` parameters, validated by the dispatcher before anything is
/// touched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct PairParams {
    #[serde(default, alias = "mac")]
    pub address: Option<String>,
    #[serde(default)]
    pub pin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Scan,
    Pair(PairParams),
    List,
    Shutdown,
}

impl Request {
    pub fn action(&self) -> &'static str {
        match self {
            Request::Scan => "scan",
            Request::Pair(_) => "pair",
            Request::List => "list",
            Request::Shutdown => "shutdown",
        }
    }

    /// Decodes one request line. Unknown actions are rejected here, so
    /// nothing loosely typed travels past this point.
    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(line)?;
        let Value::Object(mut object) = value else {
            return Err(ProtocolError::NotAnObject);
        };

        let action = match object.get("action") {
            None | Some(Value::Null) => return Err(ProtocolError::MissingAction),
            Some(Value::String(action)) => action.clone(),
            Some(_) => return Err(ProtocolError::ActionNotString),
        };

        match action.as_str() {
            "scan" => Ok(Request::Scan),
            "list" => Ok(Request::List),
            "shutdown" => Ok(Request::Shutdown),
            "pair" => {
                // Older clients put the pair fields next to "action".
                let params = match object.remove("params") {
                    Some(Value::Null) | None => Value::Object(object),
                    Some(params) => params,
                };
                serde_json::from_value(params)
                    .map(Request::Pair)
                    .map_err(|source| ProtocolError::InvalidParams {
                        action: "pair",
                        source,
                    })
            }
            _ => Err(ProtocolError::UnknownAction(action)),
        }
    }

    pub fn to_json(&self) -> Value {
        let params = match self {
            Request::Pair(params) => serde_json::to_value(params).unwrap_or_default(),
            _ => Value::Object(Map::new()),
        };
        json!({ "action": self.action(), "params": params })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Response {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Vec<Device>,
}

impl Response {
    pub fn success() -> Self {
        Self {
            status: Status::Success,
            message: None,
            data: Vec::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn devices(data: Vec<Device>) -> Self {
        Self {
            data,
            ..Self::success()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            message: Some(message.into()),
            data: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    /// Serializes to a single line with trailing newline.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}
