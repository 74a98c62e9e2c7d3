//! Central error taxonomy for the module host.
//!
//! Every fallible framework operation returns [`CoreError`]. The variants map
//! onto the failure classes a running host has to distinguish: configuration
//! problems are fatal at startup, everything else surfaces through the event
//! stream and the logger without taking other modules down.

use thiserror::Error;

/// A single configuration problem, addressed by its document path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigIssue {
    /// Dotted path into the configuration document, e.g. `hardware.foo.port`.
    pub path: String,
    /// Human-readable reason for the rejection.
    pub reason: String,
}

impl ConfigIssue {
    pub fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.reason)
    }
}

/// Collection of configuration problems reported by one validation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigIssues(pub Vec<ConfigIssue>);

impl ConfigIssues {
    pub fn push(&mut self, path: impl Into<String>, reason: impl Into<String>) {
        self.0.push(ConfigIssue::new(path, reason));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConfigIssue> {
        self.0.iter()
    }
}

impl std::fmt::Display for ConfigIssues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, issue) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "  {issue}")?;
        }
        Ok(())
    }
}

/// Lifecycle hook that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    Activate,
    Deactivate,
}

impl std::fmt::Display for HookPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HookPhase::Activate => f.write_str("on_activate"),
            HookPhase::Deactivate => f.write_str("on_deactivate"),
        }
    }
}

/// Framework-wide error type.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed configuration. Fails fast at startup, never silent.
    #[error("configuration rejected:\n{0}")]
    Validation(ConfigIssues),

    /// The `module.Class` locator could not be resolved to a registered
    /// module class. The module stays in the table as a broken row.
    #[error("cannot resolve module class '{locator}': {reason}")]
    Resolution { locator: String, reason: String },

    /// Missing required option, failed checker, unrepresentable status value
    /// or unresolvable required connector. Aborts activation.
    #[error("module '{module}': {problem}")]
    Descriptor { module: String, problem: String },

    /// Exception inside `on_activate`/`on_deactivate`.
    #[error("module '{module}': {phase} failed: {reason}")]
    Hook {
        module: String,
        phase: HookPhase,
        reason: String,
    },

    /// State machine misuse, e.g. activation from a non-deactivated state.
    #[error("module '{module}': cannot {operation} from state '{state}'")]
    InvalidTransition {
        module: String,
        operation: &'static str,
        state: &'static str,
    },

    /// Use of a module that is not (or no longer) activated.
    #[error("module '{module}' is not active")]
    NotActive { module: String },

    /// Unknown module name.
    #[error("no module named '{name}' is managed by this host")]
    UnknownModule { name: String },

    /// Unknown method or attribute on a module's dispatch surface.
    #[error("module '{module}' has no {kind} named '{name}'")]
    UnknownMember {
        module: String,
        kind: &'static str,
        name: String,
    },

    /// Write attempt on a frozen config option (set exactly once).
    #[error("option '{option}' on module '{module}' is immutable after construction")]
    OptionFrozen { module: String, option: String },

    /// Use of an optional connector that has no configured target.
    #[error("connector '{connector}' (interface '{interface}') is not connected")]
    UnboundConnector {
        connector: String,
        interface: String,
    },

    /// Cyclic connector graph.
    #[error("cyclic module dependency: {cycle}")]
    DependencyCycle { cycle: String },

    /// Cross-thread dispatch timed out; the callee keeps the work.
    #[error("dispatch to worker '{worker}' timed out after {millis} ms")]
    DispatchTimeout { worker: String, millis: u64 },

    /// Cross-thread dispatch was dropped before producing a reply.
    #[error("dispatch to worker '{worker}' was cancelled")]
    DispatchCancelled { worker: String },

    /// Remote channel failure: connect, I/O or malformed frame.
    #[error("transport error with '{peer}': {reason}")]
    Transport { peer: String, reason: String },

    /// Error raised on the remote side, re-raised locally with a tag.
    #[error("remote error [{class}]: {message}")]
    Remote {
        class: String,
        message: String,
        trace: Vec<String>,
    },

    /// Acquire on a module whose descriptor lacks `allow_remote`.
    #[error("module '{module}' is not shared for remote access")]
    NotRemotable { module: String },

    /// A remote handle that no longer matches a live activation.
    #[error("remote handle {handle} is stale; re-acquire the module")]
    StaleHandle { handle: u64 },

    /// A client proxy refusing use after a transport failure.
    #[error("remote proxy for '{module}' is broken; re-acquire the module")]
    ProxyBroken { module: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_yaml::Error),
}

impl CoreError {
    /// Short class name used on the wire and in event records.
    pub fn class_name(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "ValidationError",
            CoreError::Resolution { .. } => "ResolutionError",
            CoreError::Descriptor { .. } => "DescriptorError",
            CoreError::Hook { .. } => "HookError",
            CoreError::InvalidTransition { .. } => "InvalidTransition",
            CoreError::NotActive { .. } => "NotActive",
            CoreError::UnknownModule { .. } => "UnknownModule",
            CoreError::UnknownMember { .. } => "UnknownMember",
            CoreError::OptionFrozen { .. } => "OptionFrozen",
            CoreError::UnboundConnector { .. } => "UnboundConnector",
            CoreError::DependencyCycle { .. } => "DependencyCycle",
            CoreError::DispatchTimeout { .. } => "DispatchTimeout",
            CoreError::DispatchCancelled { .. } => "DispatchCancelled",
            CoreError::Transport { .. } => "TransportError",
            CoreError::Remote { .. } => "RemoteError",
            CoreError::NotRemotable { .. } => "NotRemotable",
            CoreError::StaleHandle { .. } => "StaleHandle",
            CoreError::ProxyBroken { .. } => "ProxyBroken",
            CoreError::Io(_) => "IoError",
            CoreError::Serialization(_) => "SerializationError",
        }
    }
}

pub type Result<T, E = CoreError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issues_display_one_per_line() {
        let mut issues = ConfigIssues::default();
        issues.push("hardware.foo", "name 'foo' already defined under logic");
        issues.push("global.remote_modules_server.port", "port must be non-zero");
        let text = issues.to_string();
        assert!(text.contains("hardware.foo: name 'foo' already defined under logic"));
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn class_names_are_stable() {
        let err = CoreError::NotRemotable {
            module: "cam".into(),
        };
        assert_eq!(err.class_name(), "NotRemotable");
    }
}
