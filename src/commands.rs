//! Builders for switch API command strings.
//!
//! Pure string formatting with no state: the engine writes these strings
//! verbatim (plus the frame terminator). Only the vocabulary the crate's
//! own tests and docs lean on is covered; anything else can be sent with
//! [`EventSocket::api`](crate::EventSocket::api) directly.

use std::fmt;

/// Generic API command, optionally taking arguments: `api <name> [args]`.
pub fn api(name: &str, args: &str) -> String {
    if args.is_empty() {
        format!("api {name}")
    } else {
        format!("api {name} {args}")
    }
}

/// Switch status summary.
pub fn status() -> String {
    api("status", "")
}

/// Switch control messages, e.g. `fsctl hupall normal_clearing`.
pub fn fsctl(args: &[&str]) -> String {
    api("fsctl", &args.join(" "))
}

/// Hang up every call, optionally with a cause.
pub fn hupall(cause: Option<&str>) -> String {
    api("hupall", cause.unwrap_or_default())
}

/// Park a call.
pub fn uuid_park(uuid: &str) -> String {
    api("uuid_park", uuid)
}

/// Bridge two call legs together. At least one leg must be answered.
pub fn uuid_bridge(uuid1: &str, uuid2: &str) -> String {
    api("uuid_bridge", &format!("{uuid1} {uuid2}"))
}

/// Access the switch's core hash table, e.g.
/// `hash(&["insert", "realm", "key", "value"])`.
pub fn hash(args: &[&str]) -> String {
    api("hash", &args.join("/"))
}

/// List callcenter queues. Consume the response with
/// [`Frame::db_records`](crate::Frame::db_records).
pub fn callcenter_queue_list() -> String {
    api("callcenter_config", "queue list")
}

/// List callcenter agents. Consume the response with
/// [`Frame::db_records`](crate::Frame::db_records).
pub fn callcenter_agent_list() -> String {
    api("callcenter_config", "agent list")
}

/// List the tiers of a callcenter queue.
pub fn callcenter_tier_list(queue: &str) -> String {
    api("callcenter_config", &format!("tier list '{queue}'"))
}

/// Builder for the `originate` command.
///
/// ```
/// use switchboard::commands::Originate;
///
/// let cmd = Originate::new("sofia/user/coltrane")
///     .extension("1234")
///     .variable("origination_caller_id_number", "5551234");
/// assert_eq!(
///     cmd.to_string(),
///     "api originate {origination_caller_id_number=5551234}sofia/user/coltrane 1234"
/// );
/// ```
#[derive(Debug, Clone, Default)]
pub struct Originate {
    url: String,
    extension: Option<String>,
    dialplan: Option<String>,
    context: Option<String>,
    variables: Vec<(String, String)>,
}

impl Originate {
    /// Originate a call to `url` (e.g. `sofia/user/coltrane`).
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Destination extension.
    pub fn extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into());
        self
    }

    /// Dialplan to execute the extension in.
    pub fn dialplan(mut self, dialplan: impl Into<String>) -> Self {
        self.dialplan = Some(dialplan.into());
        self
    }

    /// Dialplan context.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Add an originate-time channel variable (`{name=value}` prefix).
    pub fn variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.push((name.into(), value.into()));
        self
    }
}

impl fmt::Display for Originate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "api originate ")?;
        if !self.variables.is_empty() {
            let vars = self
                .variables
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(",");
            write!(f, "{{{vars}}}")?;
        }
        write!(f, "{}", self.url)?;
        for part in [&self.extension, &self.dialplan, &self.context]
            .into_iter()
            .flatten()
        {
            write!(f, " {part}")?;
        }
        Ok(())
    }
}
