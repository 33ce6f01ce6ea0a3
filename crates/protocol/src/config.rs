use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::messages::Actuator;

/// Top-level client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrivewayConfig {
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    /// Actuators this client controls. Frames for other actuators are ignored.
    #[serde(default = "default_actuators")]
    pub actuators: Vec<Actuator>,
    #[serde(default)]
    pub ice: IceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Controller host, optionally with port (`gate.example.com:8080`)
    #[serde(default = "default_host")]
    pub host: String,
    /// Access token, used as a path segment (prefer DRIVEWAY_TOKEN env)
    #[serde(default)]
    pub token: String,
    /// Use wss:// and https:// instead of ws:// and http://
    #[serde(default)]
    pub secure: bool,
    /// Signaling path under the token: "ws" (gate + garage) or "mono" (gate only)
    #[serde(default = "default_signaling_path")]
    pub signaling_path: String,
    /// Port of the SDP negotiation endpoint on the same hostname
    #[serde(default = "default_negotiation_port")]
    pub negotiation_port: u16,
    /// PEM certificate to pin for wss:// connections
    pub tls_cert: Option<String>,
}

/// Timer windows, all in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Watchdog window; a ping must arrive within it
    #[serde(default = "default_liveness_timeout_ms")]
    pub liveness_timeout_ms: u64,
    /// Delay before reconnecting after a lost connection
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    /// How long the window may stay unfocused before everything is torn down
    #[serde(default = "default_inactivity_timeout_ms")]
    pub inactivity_timeout_ms: u64,
    /// Minimum time an actuator shows as busy after its state echo
    #[serde(default = "default_busy_display_ms")]
    pub busy_display_ms: u64,
    /// Upper bound on the offer/answer HTTP exchange
    #[serde(default = "default_negotiation_timeout_ms")]
    pub negotiation_timeout_ms: u64,
    /// Delay before the incoming track is attached to playback surfaces
    #[serde(default)]
    pub track_attach_delay_ms: u64,
}

/// ICE servers for the peer connection. The controller usually sits on the
/// same LAN or behind a forwarded port, so none are configured by default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IceConfig {
    #[serde(default)]
    pub stun_urls: Vec<String>,
}

impl Default for DrivewayConfig {
    fn default() -> Self {
        Self {
            controller: ControllerConfig::default(),
            timing: TimingConfig::default(),
            actuators: default_actuators(),
            ice: IceConfig::default(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            token: String::new(),
            secure: false,
            signaling_path: default_signaling_path(),
            negotiation_port: default_negotiation_port(),
            tls_cert: None,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            liveness_timeout_ms: default_liveness_timeout_ms(),
            restart_delay_ms: default_restart_delay_ms(),
            inactivity_timeout_ms: default_inactivity_timeout_ms(),
            busy_display_ms: default_busy_display_ms(),
            negotiation_timeout_ms: default_negotiation_timeout_ms(),
            track_attach_delay_ms: 0,
        }
    }
}

impl ControllerConfig {
    /// Host without the port, as the browser's `location.hostname`.
    pub fn hostname(&self) -> &str {
        split_host_port(&self.host).0
    }

    /// `ws(s)://<host>/<token>/<path>`
    pub fn signaling_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!(
            "{scheme}://{}/{}/{}",
            self.host,
            self.token,
            self.signaling_path.trim_matches('/')
        )
    }

    /// `http(s)://<hostname>:<negotiation_port>/<token>`
    pub fn negotiation_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!(
            "{scheme}://{}:{}/{}",
            self.hostname(),
            self.negotiation_port,
            self.token
        )
    }
}

impl TimingConfig {
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }
    pub fn busy_display(&self) -> Duration {
        Duration::from_millis(self.busy_display_ms)
    }
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }
    pub fn track_attach_delay(&self) -> Duration {
        Duration::from_millis(self.track_attach_delay_ms)
    }
}

/// Split `host[:port]`, leaving bracketed IPv6 literals intact.
fn split_host_port(host: &str) -> (&str, Option<&str>) {
    match host.rsplit_once(':') {
        Some((name, port))
            if !port.is_empty()
                && port.chars().all(|c| c.is_ascii_digit())
                && (!name.contains(':') || name.ends_with(']')) =>
        {
            (name, Some(port))
        }
        _ => (host, None),
    }
}

impl DrivewayConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, client should not start) or
    /// "WARNING:" (advisory).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        // --- Controller ---
        if self.controller.host.trim().is_empty() {
            issues.push("ERROR: controller.host must not be empty.".to_string());
        }
        if self.controller.host.contains('/') {
            issues.push(format!(
                "ERROR: controller.host '{}' must be a host[:port], not a URL.",
                self.controller.host
            ));
        }
        if self.controller.token.is_empty() {
            issues.push(
                "ERROR: no access token. Set controller.token or DRIVEWAY_TOKEN.".to_string(),
            );
        } else if self.controller.token.contains('/') {
            issues.push("ERROR: controller.token must not contain '/'.".to_string());
        }
        if self.controller.negotiation_port == 0 {
            issues.push("ERROR: controller.negotiation_port must be between 1 and 65535, got 0.".to_string());
        }
        if self.controller.signaling_path.trim_matches('/').is_empty() {
            issues.push("ERROR: controller.signaling_path must not be empty.".to_string());
        }
        if self.controller.tls_cert.is_some() && !self.controller.secure {
            issues.push(
                "WARNING: controller.tls_cert is set but controller.secure is false; \
                 the certificate will not be used."
                    .to_string(),
            );
        }
        if let Some(cert) = &self.controller.tls_cert
            && !std::path::Path::new(cert).exists()
        {
            issues.push(format!("ERROR: controller.tls_cert '{cert}' does not exist."));
        }

        // --- Actuators ---
        if self.actuators.is_empty() {
            issues.push("ERROR: at least one actuator must be configured.".to_string());
        }
        let mut seen = self.actuators.clone();
        seen.sort();
        seen.dedup();
        if seen.len() != self.actuators.len() {
            issues.push("WARNING: actuators contains duplicates.".to_string());
        }
        if self.controller.signaling_path.trim_matches('/') == "mono"
            && self.actuators.contains(&Actuator::Garage)
        {
            issues.push(
                "WARNING: the 'mono' endpoint only serves the gate; garage will never become ready."
                    .to_string(),
            );
        }

        // --- Timing ---
        let t = &self.timing;
        for (name, value) in [
            ("liveness_timeout_ms", t.liveness_timeout_ms),
            ("restart_delay_ms", t.restart_delay_ms),
            ("inactivity_timeout_ms", t.inactivity_timeout_ms),
            ("negotiation_timeout_ms", t.negotiation_timeout_ms),
        ] {
            if value == 0 {
                issues.push(format!("ERROR: timing.{name} must be greater than 0."));
            }
        }
        if t.liveness_timeout_ms != 0 && t.liveness_timeout_ms < 1000 {
            issues.push(format!(
                "WARNING: timing.liveness_timeout_ms is {} but the controller pings once a second; \
                 the connection will be dropped constantly.",
                t.liveness_timeout_ms
            ));
        }

        // --- STUN URLs ---
        for url in &self.ice.stun_urls {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                issues.push(format!(
                    "ERROR: STUN URL '{}' must start with 'stun:' or 'stuns:'.",
                    url
                ));
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

fn default_host() -> String {
    "localhost:8080".to_string()
}
fn default_signaling_path() -> String {
    "ws".to_string()
}
fn default_negotiation_port() -> u16 {
    8031
}
fn default_actuators() -> Vec<Actuator> {
    vec![Actuator::Gate, Actuator::Garage]
}
fn default_liveness_timeout_ms() -> u64 {
    1500
}
fn default_restart_delay_ms() -> u64 {
    2000
}
fn default_inactivity_timeout_ms() -> u64 {
    3000
}
fn default_busy_display_ms() -> u64 {
    1000
}
fn default_negotiation_timeout_ms() -> u64 {
    10_000
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> DrivewayConfig {
        let mut config = DrivewayConfig::default();
        config.controller.token = "s3cret".to_string();
        config
    }

    #[test]
    fn default_config_from_empty_string() {
        let config: DrivewayConfig =
            toml::from_str("").expect("empty string should deserialize to default config");

        assert_eq!(config.controller.host, "localhost:8080");
        assert!(config.controller.token.is_empty());
        assert!(!config.controller.secure);
        assert_eq!(config.controller.signaling_path, "ws");
        assert_eq!(config.controller.negotiation_port, 8031);
        assert!(config.controller.tls_cert.is_none());

        assert_eq!(config.timing.liveness_timeout_ms, 1500);
        assert_eq!(config.timing.restart_delay_ms, 2000);
        assert_eq!(config.timing.inactivity_timeout_ms, 3000);
        assert_eq!(config.timing.busy_display_ms, 1000);
        assert_eq!(config.timing.negotiation_timeout_ms, 10_000);
        assert_eq!(config.timing.track_attach_delay_ms, 0);

        assert_eq!(config.actuators, vec![Actuator::Gate, Actuator::Garage]);
        assert!(config.ice.stun_urls.is_empty());
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let config: DrivewayConfig = toml::from_str(
            r#"
            actuators = ["gate"]

            [controller]
            host = "driveway.example.org"
            token = "abc"
            signaling_path = "mono"

            [timing]
            liveness_timeout_ms = 2500
            "#,
        )
        .unwrap();

        assert_eq!(config.actuators, vec![Actuator::Gate]);
        assert_eq!(config.controller.signaling_path, "mono");
        assert_eq!(config.controller.negotiation_port, 8031);
        assert_eq!(config.timing.liveness_timeout(), Duration::from_millis(2500));
        assert_eq!(config.timing.restart_delay(), Duration::from_secs(2));
    }

    #[test]
    fn unknown_actuator_is_rejected() {
        let result: Result<DrivewayConfig, _> = toml::from_str(r#"actuators = ["door"]"#);
        assert!(result.is_err());
    }

    #[test]
    fn urls_follow_controller_layout() {
        let mut config = valid();
        config.controller.host = "gate.example.com:8080".to_string();
        assert_eq!(config.controller.hostname(), "gate.example.com");
        assert_eq!(
            config.controller.signaling_url(),
            "ws://gate.example.com:8080/s3cret/ws"
        );
        assert_eq!(
            config.controller.negotiation_url(),
            "http://gate.example.com:8031/s3cret"
        );

        config.controller.secure = true;
        config.controller.signaling_path = "/mono/".to_string();
        assert_eq!(
            config.controller.signaling_url(),
            "wss://gate.example.com:8080/s3cret/mono"
        );
        assert_eq!(
            config.controller.negotiation_url(),
            "https://gate.example.com:8031/s3cret"
        );
    }

    #[test]
    fn hostname_without_port() {
        let mut config = valid();
        config.controller.host = "192.168.1.10".to_string();
        assert_eq!(config.controller.hostname(), "192.168.1.10");
        config.controller.host = "[::1]:8080".to_string();
        assert_eq!(config.controller.hostname(), "[::1]");
        config.controller.host = "[::1]".to_string();
        assert_eq!(config.controller.hostname(), "[::1]");
    }

    #[test]
    fn valid_config_passes() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn missing_token_is_an_error() {
        let issues = DrivewayConfig::default().validate().unwrap_err();
        assert!(issues.iter().any(|i| i.starts_with("ERROR:") && i.contains("token")));
    }

    #[test]
    fn zero_timers_are_errors() {
        let mut config = valid();
        config.timing.liveness_timeout_ms = 0;
        config.timing.restart_delay_ms = 0;
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("liveness_timeout_ms")));
        assert!(issues.iter().any(|i| i.contains("restart_delay_ms")));
    }

    #[test]
    fn short_watchdog_is_a_warning() {
        let mut config = valid();
        config.timing.liveness_timeout_ms = 500;
        let issues = config.validate().unwrap_err();
        assert_eq!(issues.len(), 1);
        assert!(issues[0].starts_with("WARNING:"));
    }

    #[test]
    fn mono_endpoint_with_garage_warns() {
        let mut config = valid();
        config.controller.signaling_path = "mono".to_string();
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("mono")));
    }

    #[test]
    fn empty_actuators_is_an_error() {
        let mut config = valid();
        config.actuators.clear();
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("actuator")));
    }

    #[test]
    fn bad_stun_url() {
        let mut config = valid();
        config.ice.stun_urls = vec!["stun.example.com:3478".to_string()];
        let issues = config.validate().unwrap_err();
        assert!(issues[0].contains("stun"));
    }
}
