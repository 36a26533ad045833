use std::env;
use std::time::Duration;

use tracing::warn;
use url::Url;

use crate::coalescer::DEFAULT_FRAME_INTERVAL;

pub const DEFAULT_WS_URL: &str = "ws://127.0.0.1:8000/ws";
pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8000";

/// Reconnection and heartbeat tuning for a [`crate::ReconnectingChannel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Delay before the first reconnection attempt; doubles per attempt.
    pub base_delay: Duration,
    /// Reconnection attempts made before the channel gives up.
    pub max_attempts: u32,
    pub heartbeat_interval: Duration,
    /// Upper bound on a single WebSocket dial.
    pub connect_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_attempts: 5,
            heartbeat_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Client configuration, normally loaded from `NOTESYNC_*` environment
/// variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub ws_url: String,
    pub api_url: String,
    /// Bearer token for the AI streaming endpoint.
    pub token: Option<String>,
    pub channel: ChannelConfig,
    pub frame_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            token: None,
            channel: ChannelConfig::default(),
            frame_interval: DEFAULT_FRAME_INTERVAL,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup. Unparseable numbers fall
    /// back to the defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let millis = |key: &str, fallback: Duration| {
            lookup(key)
                .and_then(|value| value.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(fallback)
        };

        let channel = ChannelConfig {
            base_delay: millis("NOTESYNC_RECONNECT_BASE_MS", defaults.channel.base_delay),
            max_attempts: lookup("NOTESYNC_RECONNECT_MAX_ATTEMPTS")
                .and_then(|value| value.trim().parse().ok())
                .unwrap_or(defaults.channel.max_attempts),
            heartbeat_interval: lookup("NOTESYNC_HEARTBEAT_SECS")
                .and_then(|value| value.trim().parse::<u64>().ok())
                .filter(|secs| {
                    if *secs == 0 {
                        warn!(target: "notesync::config", "ignoring zero NOTESYNC_HEARTBEAT_SECS");
                    }
                    *secs > 0
                })
                .map(Duration::from_secs)
                .unwrap_or(defaults.channel.heartbeat_interval),
            connect_timeout: millis(
                "NOTESYNC_CONNECT_TIMEOUT_MS",
                defaults.channel.connect_timeout,
            ),
        };

        Self {
            ws_url: normalize_localhost(
                lookup("NOTESYNC_WS_URL").unwrap_or(defaults.ws_url),
            ),
            api_url: normalize_localhost(
                lookup("NOTESYNC_API_URL").unwrap_or(defaults.api_url),
            ),
            token: lookup("NOTESYNC_TOKEN").filter(|token| !token.trim().is_empty()),
            channel,
            frame_interval: millis("NOTESYNC_FRAME_MS", defaults.frame_interval),
        }
    }
}

// Avoids the IPv6 (::1) preference some resolvers apply to `localhost`.
pub(crate) fn normalize_localhost(url: String) -> String {
    match Url::parse(&url) {
        Ok(mut parsed) => {
            if pin_loopback_host(&mut parsed) {
                parsed.into()
            } else {
                url
            }
        }
        Err(_) => url,
    }
}

/// Rewrites a `localhost` host to `127.0.0.1`. Only the host is touched;
/// `localhost` inside a longer host name or the path is left alone.
pub(crate) fn pin_loopback_host(url: &mut Url) -> bool {
    url.host_str() == Some("localhost") && url.set_host(Some("127.0.0.1")).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = SyncConfig::from_lookup(|_| None);
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.channel.base_delay, Duration::from_millis(1000));
        assert_eq!(config.channel.max_attempts, 5);
        assert_eq!(config.channel.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.frame_interval, Duration::from_millis(16));
    }

    #[test]
    fn reads_overrides() {
        let config = SyncConfig::from_lookup(lookup_from(&[
            ("NOTESYNC_WS_URL", "wss://notes.example.com/ws"),
            ("NOTESYNC_API_URL", "https://notes.example.com"),
            ("NOTESYNC_TOKEN", "abc123"),
            ("NOTESYNC_RECONNECT_BASE_MS", "250"),
            ("NOTESYNC_RECONNECT_MAX_ATTEMPTS", "8"),
            ("NOTESYNC_HEARTBEAT_SECS", "10"),
            ("NOTESYNC_FRAME_MS", "33"),
        ]));

        assert_eq!(config.ws_url, "wss://notes.example.com/ws");
        assert_eq!(config.api_url, "https://notes.example.com");
        assert_eq!(config.token.as_deref(), Some("abc123"));
        assert_eq!(config.channel.base_delay, Duration::from_millis(250));
        assert_eq!(config.channel.max_attempts, 8);
        assert_eq!(config.channel.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.frame_interval, Duration::from_millis(33));
    }

    #[test]
    fn bad_numbers_fall_back_and_localhost_is_normalized() {
        let config = SyncConfig::from_lookup(lookup_from(&[
            ("NOTESYNC_WS_URL", "ws://localhost:9000/ws"),
            ("NOTESYNC_RECONNECT_MAX_ATTEMPTS", "lots"),
            ("NOTESYNC_TOKEN", "  "),
        ]));

        assert_eq!(config.ws_url, "ws://127.0.0.1:9000/ws");
        assert_eq!(config.channel.max_attempts, 5);
        assert_eq!(config.token, None);
    }

    #[test]
    fn localhost_is_only_rewritten_as_the_whole_host() {
        let config = SyncConfig::from_lookup(lookup_from(&[
            ("NOTESYNC_WS_URL", "wss://devlocalhost.example.com/ws"),
            ("NOTESYNC_API_URL", "https://notes.example.com/localhost/api"),
        ]));
        assert_eq!(config.ws_url, "wss://devlocalhost.example.com/ws");
        assert_eq!(config.api_url, "https://notes.example.com/localhost/api");

        assert_eq!(
            normalize_localhost("http://localhost:8000/localhost".into()),
            "http://127.0.0.1:8000/localhost"
        );
        assert_eq!(normalize_localhost("not a url".into()), "not a url");
    }

    #[test]
    fn zero_heartbeat_falls_back_to_default() {
        let config = SyncConfig::from_lookup(lookup_from(&[("NOTESYNC_HEARTBEAT_SECS", "0")]));
        assert_eq!(config.channel.heartbeat_interval, Duration::from_secs(30));
    }
}
