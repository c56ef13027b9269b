use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifetime/visibility tier of a variable.
///
/// `Session` is cleared when the session completes, `User` survives across
/// sessions for the same participant and bot, `Global` is shared bot-wide.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    #[default]
    Session,
    User,
    Global,
}

/// Mutation operator for variable nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableOp {
    Set,
    Append,
    Prepend,
    Increment,
    Decrement,
}

/// A single variable write requested by a node handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableMutation {
    #[serde(default)]
    pub scope: Scope,
    pub key: String,
    pub op: VariableOp,
    #[serde(default)]
    pub value: Value,
}

/// Scoped key/value overlay merged at lookup time.
///
/// Pure data structure: no I/O, no locking. The session object owns one of
/// these and the storage service persists it as part of the session row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScopedVariables {
    #[serde(default)]
    session: HashMap<String, Value>,
    #[serde(default)]
    user: HashMap<String, Value>,
    #[serde(default)]
    global: HashMap<String, Value>,
}

impl ScopedVariables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unscoped read: session -> user -> global -> None.
    pub fn resolve(&self, key: &str) -> Option<&Value> {
        self.session
            .get(key)
            .or_else(|| self.user.get(key))
            .or_else(|| self.global.get(key))
    }

    pub fn get(&self, scope: Scope, key: &str) -> Option<&Value> {
        self.scope_map(scope).get(key)
    }

    pub fn set(&mut self, scope: Scope, key: impl Into<String>, value: impl Serialize) {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.scope_map_mut(scope).insert(key.into(), value);
    }

    pub fn remove(&mut self, scope: Scope, key: &str) -> Option<Value> {
        self.scope_map_mut(scope).remove(key)
    }

    pub fn clear_scope(&mut self, scope: Scope) {
        self.scope_map_mut(scope).clear();
    }

    pub fn scope_map(&self, scope: Scope) -> &HashMap<String, Value> {
        match scope {
            Scope::Session => &self.session,
            Scope::User => &self.user,
            Scope::Global => &self.global,
        }
    }

    pub fn scope_map_mut(&mut self, scope: Scope) -> &mut HashMap<String, Value> {
        match scope {
            Scope::Session => &mut self.session,
            Scope::User => &mut self.user,
            Scope::Global => &mut self.global,
        }
    }

    pub fn replace_scope(&mut self, scope: Scope, values: HashMap<String, Value>) {
        *self.scope_map_mut(scope) = values;
    }

    /// Apply a single mutation. Increment/decrement coerce a non-numeric
    /// prior value to 0; append/prepend operate on the string rendering.
    pub fn apply(&mut self, mutation: &VariableMutation) {
        let map = self.scope_map_mut(mutation.scope);
        match mutation.op {
            VariableOp::Set => {
                map.insert(mutation.key.clone(), mutation.value.clone());
            }
            VariableOp::Append => {
                let prior = map.get(&mutation.key).map(value_to_string).unwrap_or_default();
                let suffix = value_to_string(&mutation.value);
                map.insert(mutation.key.clone(), Value::String(prior + &suffix));
            }
            VariableOp::Prepend => {
                let prior = map.get(&mutation.key).map(value_to_string).unwrap_or_default();
                let prefix = value_to_string(&mutation.value);
                map.insert(mutation.key.clone(), Value::String(prefix + &prior));
            }
            VariableOp::Increment => {
                let prior = map.get(&mutation.key).map(value_to_number).unwrap_or(0.0);
                let delta = value_to_number(&mutation.value);
                map.insert(mutation.key.clone(), number_value(prior + delta));
            }
            VariableOp::Decrement => {
                let prior = map.get(&mutation.key).map(value_to_number).unwrap_or(0.0);
                let delta = value_to_number(&mutation.value);
                map.insert(mutation.key.clone(), number_value(prior - delta));
            }
        }
    }
}

/// Render `{{name}}` placeholders against the merged variable view.
/// Unknown names render as the empty string.
pub fn render_template(text: &str, vars: &ScopedVariables) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        match after.find("}}") {
            Some(close) => {
                let key = after[..close].trim();
                if let Some(value) = vars.resolve(key) {
                    out.push_str(&value_to_string(value));
                }
                rest = &after[close + 2..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

pub(crate) fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub(crate) fn value_to_number(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().parse().unwrap_or(0.0),
        Value::Bool(true) => 1.0,
        _ => 0.0,
    }
}

fn number_value(n: f64) -> Value {
    // Keep integral results integral so they render without a trailing ".0".
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}
