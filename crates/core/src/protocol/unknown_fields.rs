use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Captures any JSON object fields not named by the surrounding struct, so
/// forward-compatible wire types round-trip fields this binary doesn't know
/// about yet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnknownFields(#[serde(flatten)] pub HashMap<String, Value>);

impl UnknownFields {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
