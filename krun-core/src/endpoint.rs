//! Remote execution targets.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A remote target the orchestrator can execute on.
///
/// The name is stable for the duration of one invocation and doubles as the
/// output prefix; the IP must be routable from the other endpoints in the
/// fleet (peers dial the leader's hub directly).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    pub ip: String,
}

impl Endpoint {
    pub fn new(name: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ip: ip.into(),
        }
    }

    /// The `[name]` prefix prepended to every output line from this endpoint.
    pub fn prefix(&self) -> String {
        format!("[{}]", self.name)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.name.fmt(f)
    }
}
