use serde::{Deserialize, Serialize};
use std::fmt;

use weft_core::{AgentId, SessionId};

use crate::error::{MemoryError, MemoryResult};

/// Visibility class of a shared memory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    /// Visible to everything in the process.
    Global,
    /// Scoped to one workflow run.
    Workflow,
    /// Scoped to one swarm (iterative run).
    Swarm,
    /// Scoped to one debate.
    Debate,
    /// Scoped to one agent session.
    Session,
    /// Private to the agent named by the scope.
    Agent,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Global => "global",
            Namespace::Workflow => "workflow",
            Namespace::Swarm => "swarm",
            Namespace::Debate => "debate",
            Namespace::Session => "session",
            Namespace::Agent => "agent",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fully qualified shared memory key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SharedKey {
    pub namespace: Namespace,
    /// Owner of the namespace instance (run id, session id, agent id).
    /// Empty for [`Namespace::Global`].
    pub scope: String,
    pub key: String,
}

impl SharedKey {
    pub fn new(namespace: Namespace, scope: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            namespace,
            scope: scope.into(),
            key: key.into(),
        }
    }

    pub fn global(key: impl Into<String>) -> Self {
        Self::new(Namespace::Global, "", key)
    }

    pub fn session(session_id: &SessionId, key: impl Into<String>) -> Self {
        Self::new(Namespace::Session, session_id.as_str(), key)
    }

    pub fn workflow(run_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(Namespace::Workflow, run_id, key)
    }

    pub fn swarm(run_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(Namespace::Swarm, run_id, key)
    }

    pub fn agent(agent_id: &AgentId, key: impl Into<String>) -> Self {
        Self::new(Namespace::Agent, agent_id.as_str(), key)
    }

    /// Check that `agent` may touch this entry. Only the agent namespace is
    /// restricted.
    pub fn check_access(&self, agent: &AgentId) -> MemoryResult<()> {
        if self.namespace == Namespace::Agent && self.scope != agent.as_str() {
            return Err(MemoryError::AccessDenied {
                key: self.to_string(),
                agent: agent.to_string(),
            });
        }
        Ok(())
    }

    pub(crate) fn in_scope(&self, namespace: Namespace, scope: &str) -> bool {
        self.namespace == namespace && self.scope == scope
    }
}

impl fmt::Display for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scope.is_empty() {
            write!(f, "{}:{}", self.namespace, self.key)
        } else {
            write!(f, "{}:{}:{}", self.namespace, self.scope, self.key)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(SharedKey::global("k").to_string(), "global:k");
        let session = SessionId::new("run-1-stage0-a").unwrap();
        assert_eq!(
            SharedKey::session(&session, "notes").to_string(),
            "session:run-1-stage0-a:notes"
        );
    }

    #[test]
    fn test_agent_namespace_is_private() {
        let owner = AgentId::new_unchecked("alice");
        let other = AgentId::new_unchecked("bob");
        let key = SharedKey::agent(&owner, "scratch");

        assert!(key.check_access(&owner).is_ok());
        assert!(matches!(
            key.check_access(&other),
            Err(MemoryError::AccessDenied { .. })
        ));
        // other namespaces are open
        assert!(SharedKey::workflow("run-1", "x").check_access(&other).is_ok());
    }
}
