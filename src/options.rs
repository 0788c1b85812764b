//! Spawn options for one application identity.
//!
//! Options travel over the wire as an alternating key/value vector appended
//! to the `get` command. Environment variables are deliberately absent from
//! that vector; they are delivered lazily through the
//! `getEnvironmentVariables` exchange as a NUL-separated scalar.

use crate::error::{PoolError, Result};

/// Parameters describing how to spawn and schedule workers for one
/// application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolOptions {
    /// Filesystem root of the application.
    pub app_root: String,
    /// Routing identity. Two requests with equal `app_group_name` share
    /// workers; defaults to `app_root`.
    pub app_group_name: String,
    /// Free-form application kind tag, e.g. "rack" or "wsgi".
    pub app_type: String,
    /// Command line used to start one worker.
    pub start_command: String,
    /// Run workers as this user (empty = inherit).
    pub user: String,
    /// Run workers as this group (empty = inherit).
    pub group: String,
    /// Environment variables for spawned workers. `None` means the caller
    /// has not delivered them yet.
    pub environment: Option<Vec<(String, String)>>,
    /// Lower bound on workers kept alive for this group.
    pub min_processes: u32,
    /// Upper bound on workers for this group. 0 = use the pool default.
    pub max_processes: u32,
    /// Concurrent sessions one worker accepts. 0 = unlimited.
    pub concurrency: u32,
    /// Minimum interval between filesystem stats, in seconds.
    pub stat_throttle_rate: u32,
    /// Idle lifetime of the group's preloader, in seconds.
    pub max_preloader_idle_time: u32,
}

impl PoolOptions {
    /// Options for an application root, with defaults for everything else.
    pub fn new(app_root: impl Into<String>) -> Self {
        let app_root = app_root.into();
        Self {
            app_group_name: app_root.clone(),
            app_root,
            app_type: String::new(),
            start_command: String::new(),
            user: String::new(),
            group: String::new(),
            environment: None,
            min_processes: 0,
            max_processes: 0,
            concurrency: 1,
            stat_throttle_rate: 0,
            max_preloader_idle_time: 300,
        }
    }

    /// Serialize into the alternating key/value wire vector.
    ///
    /// Keys with empty or default-deferred values are omitted; the parser
    /// restores their defaults. The environment rides along only when
    /// `include_env` is set and it has been delivered.
    pub fn to_vec(&self, include_env: bool) -> Vec<String> {
        let mut fields = Vec::new();
        let mut push = |key: &str, value: String| {
            if !value.is_empty() {
                fields.push(key.to_string());
                fields.push(value);
            }
        };

        push("appRoot", self.app_root.clone());
        if self.app_group_name != self.app_root {
            push("appGroupName", self.app_group_name.clone());
        }
        push("appType", self.app_type.clone());
        push("startCommand", self.start_command.clone());
        push("user", self.user.clone());
        push("group", self.group.clone());
        push("minProcesses", self.min_processes.to_string());
        push("maxProcesses", self.max_processes.to_string());
        push("concurrency", self.concurrency.to_string());
        push("statThrottleRate", self.stat_throttle_rate.to_string());
        push(
            "maxPreloaderIdleTime",
            self.max_preloader_idle_time.to_string(),
        );
        if include_env {
            if let Some(env) = &self.environment {
                push("environment", serialize_environment(env));
            }
        }
        fields
    }

    /// Parse the alternating key/value vector produced by [`to_vec`].
    ///
    /// Unknown keys are ignored so that newer clients can talk to older
    /// servers; duplicate keys take the last value.
    ///
    /// [`to_vec`]: PoolOptions::to_vec
    pub fn from_vec(fields: &[String]) -> Result<Self> {
        if fields.len() % 2 != 0 {
            return Err(PoolError::Protocol(
                "option vector has a key without a value".into(),
            ));
        }

        let mut app_root = None;
        let mut options = PoolOptions::new("");
        let mut app_group_name = None;

        for pair in fields.chunks_exact(2) {
            let (key, value) = (pair[0].as_str(), pair[1].as_str());
            match key {
                "appRoot" => app_root = Some(value.to_string()),
                "appGroupName" => app_group_name = Some(value.to_string()),
                "appType" => options.app_type = value.to_string(),
                "startCommand" => options.start_command = value.to_string(),
                "user" => options.user = value.to_string(),
                "group" => options.group = value.to_string(),
                "environment" => {
                    options.environment = Some(parse_environment(value.as_bytes())?)
                }
                "minProcesses" => options.min_processes = parse_number(key, value)?,
                "maxProcesses" => options.max_processes = parse_number(key, value)?,
                "concurrency" => options.concurrency = parse_number(key, value)?,
                "statThrottleRate" => options.stat_throttle_rate = parse_number(key, value)?,
                "maxPreloaderIdleTime" => {
                    options.max_preloader_idle_time = parse_number(key, value)?
                }
                _ => {}
            }
        }

        let app_root = app_root
            .ok_or_else(|| PoolError::Protocol("option vector is missing appRoot".into()))?;
        options.app_group_name = app_group_name.unwrap_or_else(|| app_root.clone());
        options.app_root = app_root;
        Ok(options)
    }

    /// Effective per-group worker cap, falling back to the pool default.
    pub fn effective_max_processes(&self, pool_default: u32) -> u32 {
        if self.max_processes == 0 {
            pool_default
        } else {
            self.max_processes
        }
    }
}

fn parse_number(key: &str, value: &str) -> Result<u32> {
    value
        .parse()
        .map_err(|_| PoolError::Protocol(format!("option {} is not a number: {:?}", key, value)))
}

/// Serialize environment variables as NUL-separated name/value alternation.
pub fn serialize_environment(env: &[(String, String)]) -> String {
    let mut out = String::new();
    for (name, value) in env {
        out.push_str(name);
        out.push('\0');
        out.push_str(value);
        out.push('\0');
    }
    out
}

/// Parse the scalar produced by [`serialize_environment`]. An empty blob
/// means "no variables".
pub fn parse_environment(blob: &[u8]) -> Result<Vec<(String, String)>> {
    if blob.is_empty() {
        return Ok(Vec::new());
    }
    let text = std::str::from_utf8(blob)
        .map_err(|_| PoolError::Protocol("environment blob is not UTF-8".into()))?;
    let mut parts: Vec<&str> = text.split('\0').collect();
    // A well-formed blob ends with a NUL, leaving one empty trailing part.
    if parts.last() == Some(&"") {
        parts.pop();
    }
    if parts.len() % 2 != 0 {
        return Err(PoolError::Protocol(
            "environment blob has a name without a value".into(),
        ));
    }
    Ok(parts
        .chunks_exact(2)
        .map(|pair| (pair[0].to_string(), pair[1].to_string()))
        .collect())
}
