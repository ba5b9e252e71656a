//! GET2 / RETURN2 command rendering and job response parsing.
//!
//! Commands are single lines of space-separated `key=value` pairs. A job
//! response is a `&`-separated list of url-encoded `key=value` pairs; an empty
//! response means the server had nothing to hand out. CHAFF and SETAFF keep a
//! server's copy of the worker's preferred affinities current.

use std::fmt;
use std::time::Instant;

use crate::core::affinity::AffinityFilter;
use crate::core::job::{Job, ServerAddress};
use crate::core::SchedulerError;

/// Which jobs a worker is willing to take in a GET2 request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AffinityPreference {
    /// Worker-node affinities first, then any job.
    PreferredAffsOrAnyJob,
    /// Worker-node affinities only.
    PreferredAffinities,
    /// Worker-node affinities, claiming affinities nobody serves yet.
    ClaimNewPreferredAffs,
    /// Any job; explicit affinities are tried first.
    #[default]
    AnyJob,
    /// Only the affinities listed in the request.
    ExplicitAffinitiesOnly,
}

impl AffinityPreference {
    /// GET2 flags for this preference.
    #[must_use]
    pub const fn flags(self) -> &'static str {
        match self {
            Self::PreferredAffsOrAnyJob => "wnode_aff=1 any_aff=1",
            Self::PreferredAffinities => "wnode_aff=1 any_aff=0",
            Self::ClaimNewPreferredAffs => "wnode_aff=1 any_aff=0 exclusive_new_aff=1",
            Self::AnyJob => "wnode_aff=0 any_aff=1",
            Self::ExplicitAffinitiesOnly => "wnode_aff=0 any_aff=0",
        }
    }

    /// Whether a job outside the requested affinities may be handed out.
    #[must_use]
    pub const fn allows_any(self) -> bool {
        matches!(self, Self::PreferredAffsOrAnyJob | Self::AnyJob)
    }

    /// Whether servers match against the worker's preferred affinities.
    #[must_use]
    pub const fn uses_worker_affinities(self) -> bool {
        matches!(
            self,
            Self::PreferredAffsOrAnyJob | Self::PreferredAffinities | Self::ClaimNewPreferredAffs
        )
    }

    /// Preference to use for one request. Without `any_affinity` only the
    /// listed affinities may match.
    #[must_use]
    pub const fn for_request(self, any_affinity: bool) -> Self {
        if any_affinity {
            self
        } else {
            Self::ExplicitAffinitiesOnly
        }
    }

    fn from_flags(wnode: bool, any: bool, exclusive_new: bool) -> Self {
        match (wnode, any, exclusive_new) {
            (true, true, _) => Self::PreferredAffsOrAnyJob,
            (true, false, true) => Self::ClaimNewPreferredAffs,
            (true, false, false) => Self::PreferredAffinities,
            (false, true, _) => Self::AnyJob,
            (false, false, _) => Self::ExplicitAffinitiesOnly,
        }
    }
}

/// A GET2 request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GetCommand {
    /// Matching policy.
    pub preference: AffinityPreference,
    /// Explicit affinities, best first.
    pub affinities: Vec<String>,
    /// Notification port and wait timeout in seconds.
    pub notify: Option<(u16, u32)>,
    /// Restrict to one job group.
    pub group: Option<String>,
    /// Serve `affinities` strictly in the listed order.
    pub prioritized: bool,
}

impl GetCommand {
    /// Request with `preference` and no explicit affinities.
    #[must_use]
    pub fn new(preference: AffinityPreference) -> Self {
        Self {
            preference,
            ..Self::default()
        }
    }

    /// Request built from a strategy filter. A non-empty filter is sent as
    /// a prioritized list.
    #[must_use]
    pub fn for_filter(preference: AffinityPreference, filter: &AffinityFilter, any_affinity: bool) -> Self {
        Self {
            preference: preference.for_request(any_affinity),
            affinities: filter.tokens().to_vec(),
            prioritized: !filter.is_empty(),
            ..Self::default()
        }
    }

    /// Ask the server to notify `port` for up to `timeout_secs`.
    #[must_use]
    pub const fn with_notify(mut self, port: u16, timeout_secs: u32) -> Self {
        self.notify = Some((port, timeout_secs));
        self
    }

    /// Ask the server to notify `port` until `deadline`. The timeout is the
    /// remaining time rounded up to whole seconds; nothing is added once the
    /// deadline has passed.
    #[must_use]
    pub fn with_deadline(self, port: u16, deadline: Instant) -> Self {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
        if secs == 0 {
            return self;
        }
        self.with_notify(port, u32::try_from(secs).unwrap_or(u32::MAX))
    }

    /// Restrict the request to `group`.
    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Parse a rendered GET2 line.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Protocol` for anything that is not a
    /// well-formed GET2 command.
    pub fn parse(line: &str) -> Result<Self, SchedulerError> {
        let mut words = line.split_whitespace();
        if words.next() != Some("GET2") {
            return Err(SchedulerError::Protocol(format!("not a GET2 command: `{line}`")));
        }

        let (mut wnode, mut any, mut exclusive_new) = (false, false, false);
        let mut port = None;
        let mut timeout = None;
        let mut cmd = Self::default();

        for word in words {
            let (key, value) = word
                .split_once('=')
                .ok_or_else(|| SchedulerError::Protocol(format!("malformed argument `{word}`")))?;
            match key {
                "wnode_aff" => wnode = parse_flag(key, value)?,
                "any_aff" => any = parse_flag(key, value)?,
                "exclusive_new_aff" => exclusive_new = parse_flag(key, value)?,
                "prioritized_aff" => cmd.prioritized = parse_flag(key, value)?,
                "aff" => cmd.affinities = value.split(',').map(String::from).collect(),
                "group" => cmd.group = Some(value.trim_matches('"').to_string()),
                "port" => port = Some(parse_number(key, value)?),
                "timeout" => timeout = Some(parse_number(key, value)?),
                _ => return Err(SchedulerError::Protocol(format!("unknown GET2 argument `{key}`"))),
            }
        }

        cmd.preference = AffinityPreference::from_flags(wnode, any, exclusive_new);
        cmd.notify = match (port, timeout) {
            (Some(port), Some(timeout)) => Some((port, timeout)),
            (None, None) => None,
            _ => return Err(SchedulerError::Protocol("port and timeout go together".into())),
        };
        Ok(cmd)
    }
}

impl fmt::Display for GetCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GET2 {}", self.preference.flags())?;
        if !self.affinities.is_empty() {
            write!(f, " aff={}", self.affinities.join(","))?;
        }
        if let Some((port, timeout)) = self.notify {
            write!(f, " port={port} timeout={timeout}")?;
        }
        if let Some(group) = &self.group {
            write!(f, " group=\"{group}\"")?;
        }
        if self.prioritized {
            f.write_str(" prioritized_aff=1")?;
        }
        Ok(())
    }
}

/// Parse the server's answer to GET2. `Ok(None)` means no job.
///
/// # Errors
///
/// Returns `SchedulerError::Protocol` when the response cannot be decoded.
pub fn parse_job_response(response: &str, server: &ServerAddress) -> Result<Option<Job>, SchedulerError> {
    let response = response.trim();
    if response.is_empty() {
        return Ok(None);
    }

    let mut job = Job::new("", "", server.clone());
    let mut has_key = false;

    for pair in response.split('&') {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| SchedulerError::Protocol(format!("malformed pair `{pair}` from {server}")))?;
        let value = urlencoding::decode(raw)
            .map_err(|e| SchedulerError::Protocol(format!("bad encoding for `{key}` from {server}: {e}")))?
            .into_owned();
        match key {
            "job_key" => {
                has_key = !value.is_empty();
                job.id = value;
            }
            "input" => job.input = value,
            "auth_token" => job.auth_token = value,
            "affinity" => job.affinity = value,
            "client_ip" => job.client_ip = non_empty(value),
            "client_sid" => job.session_id = non_empty(value),
            "mask" => job.mask = parse_number(key, &value)?,
            "ncbi_phid" => job.page_hit_id = non_empty(value),
            _ => {}
        }
    }

    Ok(has_key.then_some(job))
}

/// Render a job the way a server answers GET2.
#[must_use]
pub fn format_job_response(job: &Job) -> String {
    let mask = job.mask.to_string();
    let mut pairs = vec![
        ("job_key", job.id.as_str()),
        ("input", job.input.as_str()),
        ("auth_token", job.auth_token.as_str()),
        ("affinity", job.affinity.as_str()),
    ];
    if let Some(ip) = &job.client_ip {
        pairs.push(("client_ip", ip.as_str()));
    }
    if let Some(sid) = &job.session_id {
        pairs.push(("client_sid", sid.as_str()));
    }
    pairs.push(("mask", mask.as_str()));
    if let Some(phid) = &job.page_hit_id {
        pairs.push(("ncbi_phid", phid.as_str()));
    }

    pairs
        .into_iter()
        .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// A change to the preferred affinities a server keeps for this worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AffinityUpdate {
    /// CHAFF: add and remove individual affinities.
    Change {
        /// Affinities to add.
        add: Vec<String>,
        /// Affinities to remove.
        del: Vec<String>,
    },
    /// SETAFF: replace the whole set.
    Set(Vec<String>),
}

impl AffinityUpdate {
    /// CHAFF adding a single affinity.
    #[must_use]
    pub fn add(affinity: impl Into<String>) -> Self {
        Self::Change {
            add: vec![affinity.into()],
            del: Vec::new(),
        }
    }

    /// SETAFF carrying `affinities`.
    #[must_use]
    pub fn set<I, S>(affinities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Set(affinities.into_iter().map(Into::into).collect())
    }

    /// Parse a rendered CHAFF or SETAFF line.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Protocol` for any other command or a
    /// malformed argument.
    pub fn parse(line: &str) -> Result<Self, SchedulerError> {
        let mut words = line.split_whitespace();
        match words.next() {
            Some("CHAFF") => {
                let (mut add, mut del) = (Vec::new(), Vec::new());
                for word in words {
                    match word.split_once('=') {
                        Some(("add", v)) => add = split_list(v),
                        Some(("del", v)) => del = split_list(v),
                        _ => return Err(SchedulerError::Protocol(format!("unexpected CHAFF argument `{word}`"))),
                    }
                }
                Ok(Self::Change { add, del })
            }
            Some("SETAFF") => match (words.next(), words.next()) {
                (Some(word), None) => match word.split_once('=') {
                    Some(("aff", v)) => Ok(Self::Set(split_list(v.trim_matches('"')))),
                    _ => Err(SchedulerError::Protocol(format!("unexpected SETAFF argument `{word}`"))),
                },
                _ => Err(SchedulerError::Protocol(format!("malformed SETAFF command: `{line}`"))),
            },
            _ => Err(SchedulerError::Protocol(format!("not an affinity command: `{line}`"))),
        }
    }
}

impl fmt::Display for AffinityUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Change { add, del } => {
                f.write_str("CHAFF")?;
                if !add.is_empty() {
                    write!(f, " add={}", add.join(","))?;
                }
                if !del.is_empty() {
                    write!(f, " del={}", del.join(","))?;
                }
                Ok(())
            }
            Self::Set(affinities) => write!(f, "SETAFF aff=\"{}\"", affinities.join(",")),
        }
    }
}

/// Render the RETURN2 command for a leased job.
#[must_use]
pub fn return_command(job: &Job, blacklist: bool) -> String {
    let mut cmd = format!("RETURN2 job_key={} auth_token={}", job.id, job.auth_token);
    if !blacklist {
        cmd.push_str(" blacklist=0");
    }
    cmd
}

/// Job key and auth token named by a RETURN2 line.
///
/// # Errors
///
/// Returns `SchedulerError::Protocol` when either is missing.
pub fn parse_return_command(line: &str) -> Result<(String, String), SchedulerError> {
    let mut words = line.split_whitespace();
    if words.next() != Some("RETURN2") {
        return Err(SchedulerError::Protocol(format!("not a RETURN2 command: `{line}`")));
    }
    let mut key = None;
    let mut token = None;
    for word in words {
        match word.split_once('=') {
            Some(("job_key", v)) => key = Some(v.to_string()),
            Some(("auth_token", v)) => token = Some(v.to_string()),
            Some(("blacklist", _)) => {}
            _ => return Err(SchedulerError::Protocol(format!("unexpected RETURN2 argument `{word}`"))),
        }
    }
    match (key, token) {
        (Some(key), Some(token)) => Ok((key, token)),
        _ => Err(SchedulerError::Protocol(format!("incomplete RETURN2 command: `{line}`"))),
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool, SchedulerError> {
    match value {
        "1" => Ok(true),
        "0" => Ok(false),
        _ => Err(SchedulerError::Protocol(format!("`{key}` must be 0 or 1, got `{value}`"))),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, SchedulerError> {
    value
        .parse()
        .map_err(|_| SchedulerError::Protocol(format!("`{key}` is not a number: `{value}`")))
}

fn split_list(value: &str) -> Vec<String> {
    value.split(',').filter(|s| !s.is_empty()).map(String::from).collect()
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}
