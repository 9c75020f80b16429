//! Kea control channel plumbing: command envelopes and response parsing.

use serde_json::{json, Value};

use heron_common::stats::StatValue;

use crate::store::app::AccessPoint;

/// Kea result codes.
pub const RESULT_SUCCESS: i64 = 0;
pub const RESULT_ERROR: i64 = 1;
pub const RESULT_UNSUPPORTED: i64 = 2;
pub const RESULT_EMPTY: i64 = 3;

/// Build a command envelope. `service` routes the command through the
/// Control Agent to a specific daemon.
pub fn command(name: &str, service: Option<&str>, arguments: Option<Value>) -> Value {
    let mut envelope = json!({ "command": name });
    if let Some(service) = service {
        envelope["service"] = json!([service]);
    }
    if let Some(arguments) = arguments {
        envelope["arguments"] = arguments;
    }
    envelope
}

/// The URL of a Kea Control Agent access point.
pub fn control_url(point: &AccessPoint) -> String {
    let scheme = if point.use_secure_protocol {
        "https"
    } else {
        "http"
    };
    if point.address.contains(':') {
        format!("{scheme}://[{}]:{}/", point.address, point.port)
    } else {
        format!("{scheme}://{}:{}/", point.address, point.port)
    }
}

/// One parsed daemon answer.
#[derive(Debug, Clone, PartialEq)]
pub struct KeaResponse {
    pub result: i64,
    pub text: Option<String>,
    pub arguments: Option<Value>,
}

impl KeaResponse {
    pub fn is_success(&self) -> bool {
        self.result == RESULT_SUCCESS
    }
}

/// Parse the Control Agent reply to a single-service command. The CA
/// wraps daemon answers in a one-element array; a bare object is also
/// accepted.
pub fn parse_response(value: &Value) -> Option<KeaResponse> {
    let object = match value {
        Value::Array(items) => items.first()?,
        other => other,
    };
    Some(KeaResponse {
        result: object.get("result")?.as_i64()?,
        text: object
            .get("text")
            .and_then(Value::as_str)
            .map(str::to_string),
        arguments: object.get("arguments").cloned(),
    })
}

/// Parse a `stat-lease4-get`/`stat-lease6-get` result set into
/// `(local subnet id, column name, value)` triples. Counters keep their
/// full width; Kea's `-1` overflow sentinel passes through.
pub fn parse_stat_result_set(arguments: &Value) -> Vec<(i64, String, StatValue)> {
    let Some(result_set) = arguments.get("result-set") else {
        return Vec::new();
    };
    let Some(columns) = result_set.get("columns").and_then(Value::as_array) else {
        return Vec::new();
    };
    let Some(rows) = result_set.get("rows").and_then(Value::as_array) else {
        return Vec::new();
    };
    let names: Vec<&str> = columns.iter().filter_map(Value::as_str).collect();
    let subnet_column = match names.iter().position(|name| *name == "subnet-id") {
        Some(position) => position,
        None => return Vec::new(),
    };

    let mut stats = Vec::new();
    for row in rows {
        let Some(cells) = row.as_array() else {
            continue;
        };
        let Some(local_subnet_id) = cells.get(subnet_column).and_then(Value::as_i64) else {
            continue;
        };
        for (position, name) in names.iter().enumerate() {
            if position == subnet_column {
                continue;
            }
            let parsed = cells
                .get(position)
                .and_then(|cell| serde_json::from_value::<StatValue>(cell.clone()).ok());
            if let Some(value) = parsed {
                stats.push((local_subnet_id, name.to_string(), value));
            }
        }
    }
    stats
}

/// Pull the local and partner HA states out of `status-get` arguments.
pub fn parse_ha_state(arguments: &Value) -> Option<(String, Option<String>)> {
    let relationships = arguments
        .get("high-availability")
        .and_then(Value::as_array)?;
    let servers = relationships.first()?.get("ha-servers")?;
    let local = servers
        .get("local")
        .and_then(|local| local.get("state"))
        .and_then(Value::as_str)?
        .to_string();
    let partner = servers
        .get("remote")
        .and_then(|remote| remote.get("state"))
        .and_then(Value::as_str)
        .map(str::to_string);
    Some((local, partner))
}
