use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    /// Initial bandwidth limits
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Keep-alive policy for accepted connections
    #[serde(default)]
    pub keepalive: KeepAliveConfig,
    /// Upper bound on the token wait of one read/write (milliseconds)
    ///
    /// Absent means reads and writes wait as long as the limiters require.
    #[serde(default)]
    pub acquire_timeout_ms: Option<u64>,
    /// Prometheus endpoint
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Periodic throughput report
    #[serde(default)]
    pub report: ReportConfig,
    /// Limit changes, relative to the first accepted connection
    #[serde(default)]
    pub schedule: Vec<LimitUpdateConfig>,
}

// ============================================================================
// Limits
// ============================================================================

/// Bandwidth limits in bytes/second, also used as burst sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_per_connection")]
    pub per_connection: u64,
    #[serde(default = "default_global")]
    pub global: u64,
}

fn default_per_connection() -> u64 {
    3 * 1024
}

fn default_global() -> u64 {
    10 * 1024
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            per_connection: default_per_connection(),
            global: default_global(),
        }
    }
}

/// A scheduled limit change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct LimitUpdateConfig {
    /// Seconds after the first accepted connection
    pub after_secs: u64,
    pub per_connection: u64,
    pub global: u64,
}

// ============================================================================
// Keep-alive
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct KeepAliveConfig {
    /// Probe period (milliseconds)
    #[serde(default = "default_keepalive_interval_ms")]
    pub interval_ms: u64,
    /// Reject connections whose transport cannot enable keep-alive
    #[serde(default = "default_keepalive_required")]
    pub required: bool,
}

fn default_keepalive_interval_ms() -> u64 {
    5000
}

fn default_keepalive_required() -> bool {
    true
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_keepalive_interval_ms(),
            required: default_keepalive_required(),
        }
    }
}

// ============================================================================
// Server / Metrics / Report
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Size of the per-connection read buffer (bytes)
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
}

fn default_listen_port() -> u16 {
    8080
}

fn default_read_buffer_size() -> usize {
    1024
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    /// Address for the `/metrics` endpoint; disabled when absent
    #[serde(default)]
    pub listen_addr: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportConfig {
    /// Interval between throughput log lines (milliseconds)
    #[serde(default = "default_report_interval_ms")]
    pub interval_ms: u64,
}

fn default_report_interval_ms() -> u64 {
    5000
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_report_interval_ms(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                listen_addr: "127.0.0.1".to_string(),
                listen_port: default_listen_port(),
                read_buffer_size: default_read_buffer_size(),
            },
            limits: LimitsConfig::default(),
            keepalive: KeepAliveConfig::default(),
            acquire_timeout_ms: None,
            metrics: MetricsConfig::default(),
            report: ReportConfig::default(),
            schedule: Vec::new(),
        }
    }
}

impl Config {
    /// Listen address string (addr:port)
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.listen_addr, self.server.listen_port)
    }

    /// Check values serde cannot express
    pub fn validate(&self) -> Result<(), String> {
        if self.server.read_buffer_size == 0 {
            return Err("server.read_buffer_size must be positive".to_string());
        }
        let buffer = self.server.read_buffer_size as u64;

        // Every limit the server may run under has to admit a full read
        check_limits("limits", self.limits.per_connection, self.limits.global, buffer)?;
        for (i, update) in self.schedule.iter().enumerate() {
            check_limits(
                &format!("schedule[{}]", i),
                update.per_connection,
                update.global,
                buffer,
            )?;
        }
        if self.report.interval_ms == 0 {
            return Err("report.interval_ms must be positive".to_string());
        }
        Ok(())
    }

    /// Schedule sorted by trigger time
    pub fn sorted_schedule(&self) -> Vec<LimitUpdateConfig> {
        let mut schedule = self.schedule.clone();
        schedule.sort_by_key(|u| u.after_secs);
        schedule
    }
}

fn check_limits(
    section: &str,
    per_connection: u64,
    global: u64,
    buffer: u64,
) -> Result<(), String> {
    if per_connection == 0 {
        return Err(format!("{}.per_connection must be positive", section));
    }
    if global == 0 {
        return Err(format!("{}.global must be positive", section));
    }
    let burst = per_connection.min(global);
    if buffer > burst {
        return Err(format!(
            "server.read_buffer_size ({}) exceeds the smaller burst of {} ({})",
            buffer, section, burst
        ));
    }
    Ok(())
}
