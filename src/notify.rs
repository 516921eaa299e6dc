//! Outbound notifications for rule alerts and engine lifecycle events.
//!
//! Local sinks (the tracing log and an optional JSONL file) are written on the
//! calling thread. Remote deliveries (Telegram, webhook) are queued to one
//! `fre-notify` thread that shells out to `curl`, so a slow endpoint never
//! holds up a rule worker. A full queue drops the delivery and counts it.

#![allow(missing_docs)]

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Sender, TrySendError, bounded};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;

// ──────────────────── events ────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    const fn marker(self) -> &'static str {
        match self {
            Self::Info => "\u{2139}\u{FE0F}",
            Self::Warning => "\u{26A0}\u{FE0F}",
            Self::Critical => "\u{1F6A8}",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationEvent {
    /// A rule won its alert guard for a device.
    RuleAlert {
        imei: String,
        rule: String,
        message: String,
    },
    EngineStarted {
        version: String,
        rules_loaded: usize,
    },
    EngineStopped {
        reason: String,
        uptime_secs: u64,
    },
    RulesReloaded {
        rules_loaded: usize,
        digest: String,
    },
}

impl NotificationEvent {
    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self {
            Self::RuleAlert { .. } => Severity::Critical,
            Self::EngineStopped { .. } => Severity::Warning,
            Self::EngineStarted { .. } | Self::RulesReloaded { .. } => Severity::Info,
        }
    }

    /// One-line description.
    #[must_use]
    pub fn headline(&self) -> String {
        match self {
            Self::RuleAlert { message, .. } => message.clone(),
            Self::EngineStarted {
                version,
                rules_loaded,
            } => format!("fre {version} up, {rules_loaded} rules loaded"),
            Self::EngineStopped {
                reason,
                uptime_secs,
            } => format!(
                "fre down ({reason}) after {}h{:02}m",
                uptime_secs / 3600,
                (uptime_secs % 3600) / 60
            ),
            Self::RulesReloaded {
                rules_loaded,
                digest,
            } => format!(
                "{rules_loaded} rules published, digest {}",
                digest.get(..12).unwrap_or(digest)
            ),
        }
    }
}

// ──────────────────── configuration ────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NotificationConfig {
    /// Master switch.
    pub enabled: bool,
    /// Events below this severity are not written to the log.
    pub log_min_severity: Severity,
    /// Pending remote deliveries before new ones are dropped.
    pub queue_capacity: usize,
    pub telegram: TelegramConfig,
    pub webhook: WebhookConfig,
    pub file: FileConfig,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_min_severity: Severity::Info,
            queue_capacity: 256,
            telegram: TelegramConfig::default(),
            webhook: WebhookConfig::default(),
            file: FileConfig::default(),
        }
    }
}

/// Telegram Bot API. Token and chats are normally injected through
/// `FRE_TELEGRAM_BOT_TOKEN` / `FRE_TELEGRAM_CHAT_IDS`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TelegramConfig {
    pub enabled: bool,
    pub bot_token: String,
    pub chat_ids: Vec<String>,
    pub min_severity: Severity,
    pub api_base: String,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bot_token: String::new(),
            chat_ids: Vec::new(),
            min_severity: Severity::Critical,
            api_base: "https://api.telegram.org".to_string(),
        }
    }
}

/// JSON POST of every event at or above `min_severity`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub url: String,
    pub min_severity: Severity,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            min_severity: Severity::Critical,
        }
    }
}

/// Append-only JSONL event log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FileConfig {
    pub enabled: bool,
    pub path: PathBuf,
}

impl Default for FileConfig {
    fn default() -> Self {
        let home = std::env::var_os("HOME").map_or_else(|| PathBuf::from("/tmp"), PathBuf::from);
        Self {
            enabled: false,
            path: home.join(".local/share/fre/notifications.jsonl"),
        }
    }
}

// ──────────────────── sinks ────────────────────

/// A rendered HTTP POST waiting for the delivery thread.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Outbound {
    sink: &'static str,
    url: String,
    body: String,
}

fn html_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

struct TelegramSink {
    endpoint: String,
    chat_ids: Vec<String>,
    min_severity: Severity,
}

impl TelegramSink {
    fn from_config(config: &TelegramConfig) -> Option<Self> {
        if !config.enabled || config.bot_token.is_empty() || config.chat_ids.is_empty() {
            return None;
        }
        Some(Self {
            endpoint: format!(
                "{}/bot{}/sendMessage",
                config.api_base.trim_end_matches('/'),
                config.bot_token
            ),
            chat_ids: config.chat_ids.clone(),
            min_severity: config.min_severity,
        })
    }

    fn text(event: &NotificationEvent) -> String {
        let marker = event.severity().marker();
        match event {
            NotificationEvent::RuleAlert {
                imei,
                rule,
                message,
            } => format!(
                "{marker} <b>{}</b> IMEI {}\n{}",
                html_escape(rule),
                html_escape(imei),
                html_escape(message)
            ),
            other => format!("{marker} {}", html_escape(&other.headline())),
        }
    }

    fn render(&self, event: &NotificationEvent) -> Vec<Outbound> {
        if event.severity() < self.min_severity {
            return Vec::new();
        }
        let text = Self::text(event);
        self.chat_ids
            .iter()
            .map(|chat_id| Outbound {
                sink: "telegram",
                url: self.endpoint.clone(),
                body: json!({ "chat_id": chat_id, "text": text, "parse_mode": "HTML" })
                    .to_string(),
            })
            .collect()
    }
}

struct WebhookSink {
    url: String,
    min_severity: Severity,
}

impl WebhookSink {
    fn from_config(config: &WebhookConfig) -> Option<Self> {
        (config.enabled && !config.url.trim().is_empty()).then(|| Self {
            url: config.url.clone(),
            min_severity: config.min_severity,
        })
    }

    fn render(&self, event: &NotificationEvent) -> Option<Outbound> {
        (event.severity() >= self.min_severity).then(|| Outbound {
            sink: "webhook",
            url: self.url.clone(),
            body: json!({
                "source": "fre",
                "severity": event.severity(),
                "headline": event.headline(),
                "event": event,
            })
            .to_string(),
        })
    }
}

struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    fn append(&self, event: &NotificationEvent) {
        let line = json!({
            "ts": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            "severity": event.severity(),
            "headline": event.headline(),
            "event": event,
        });
        if let Some(parent) = self.path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| writeln!(file, "{line}"));
        if let Err(error) = written {
            tracing::warn!(path = %self.path.display(), %error, "notification file append failed");
        }
    }
}

fn log_event(event: &NotificationEvent) {
    let headline = event.headline();
    match event.severity() {
        Severity::Critical => tracing::warn!(target: "fleet_rule_engine::notify", event = ?event, "{headline}"),
        Severity::Warning => tracing::warn!(target: "fleet_rule_engine::notify", "{headline}"),
        Severity::Info => tracing::info!(target: "fleet_rule_engine::notify", "{headline}"),
    }
}

// ──────────────────── delivery thread ────────────────────

struct Outbox {
    tx: Mutex<Option<Sender<Outbound>>>,
    join: Mutex<Option<JoinHandle<()>>>,
    dropped: AtomicU64,
}

impl Outbox {
    /// `None` when the thread cannot be spawned; remote sinks are then off.
    fn start(capacity: usize) -> Option<Self> {
        let (tx, rx) = bounded::<Outbound>(capacity.max(1));
        let spawned = thread::Builder::new()
            .name("fre-notify".to_string())
            .spawn(move || {
                while let Ok(request) = rx.recv() {
                    post(&request);
                }
            });
        match spawned {
            Ok(join) => Some(Self {
                tx: Mutex::new(Some(tx)),
                join: Mutex::new(Some(join)),
                dropped: AtomicU64::new(0),
            }),
            Err(error) => {
                tracing::warn!(%error, "failed to spawn notification thread; remote sinks disabled");
                None
            }
        }
    }

    fn enqueue(&self, request: Outbound) {
        let sink = request.sink;
        let result = match self.tx.lock().as_ref() {
            Some(tx) => tx.try_send(request).map_err(|e| match e {
                TrySendError::Full(_) => "queue full",
                TrySendError::Disconnected(_) => "delivery thread gone",
            }),
            None => Err("closed"),
        };
        if let Err(reason) = result {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(sink, reason, dropped, "notification dropped");
        }
    }

    /// Stop accepting work and wait for queued deliveries.
    fn close(&self) {
        self.tx.lock().take();
        if let Some(join) = self.join.lock().take() {
            let _ = join.join();
        }
    }
}

impl Drop for Outbox {
    fn drop(&mut self) {
        self.close();
    }
}

fn post(request: &Outbound) {
    let status = Command::new("curl")
        .args(["--silent", "--fail", "--max-time", "5"])
        .args(["--header", "Content-Type: application/json"])
        .args(["--data-binary", &request.body])
        .arg(&request.url)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    // the telegram URL embeds the bot token, so it is never logged
    match status {
        Ok(status) if status.success() => {
            tracing::debug!(sink = request.sink, "notification delivered");
        }
        Ok(status) => {
            tracing::warn!(sink = request.sink, code = ?status.code(), "notification delivery failed");
        }
        Err(error) => tracing::warn!(sink = request.sink, %error, "curl unavailable"),
    }
}

// ──────────────────── manager ────────────────────

/// Fans events out to every configured sink. Shared by all workers.
pub struct NotificationManager {
    enabled: bool,
    log_min_severity: Severity,
    file: Option<JsonlSink>,
    telegram: Option<TelegramSink>,
    webhook: Option<WebhookSink>,
    outbox: Option<Outbox>,
    events: AtomicU64,
}

impl NotificationManager {
    #[must_use]
    pub fn from_config(config: &NotificationConfig) -> Self {
        if !config.enabled {
            return Self::disabled();
        }
        let telegram = TelegramSink::from_config(&config.telegram);
        let webhook = WebhookSink::from_config(&config.webhook);
        let outbox = if telegram.is_some() || webhook.is_some() {
            Outbox::start(config.queue_capacity)
        } else {
            None
        };
        if config.telegram.enabled && telegram.is_none() {
            tracing::warn!("telegram enabled without bot_token/chat_ids; sink skipped");
        }
        Self {
            enabled: true,
            log_min_severity: config.log_min_severity,
            file: config.file.enabled.then(|| JsonlSink {
                path: config.file.path.clone(),
            }),
            telegram,
            webhook,
            outbox,
            events: AtomicU64::new(0),
        }
    }

    /// A manager that ignores every event.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            log_min_severity: Severity::Info,
            file: None,
            telegram: None,
            webhook: None,
            outbox: None,
            events: AtomicU64::new(0),
        }
    }

    pub fn notify(&self, event: &NotificationEvent) {
        if !self.enabled {
            return;
        }
        self.events.fetch_add(1, Ordering::Relaxed);

        if event.severity() >= self.log_min_severity {
            log_event(event);
        }
        if let Some(file) = &self.file {
            file.append(event);
        }
        let Some(outbox) = &self.outbox else {
            return;
        };
        if let Some(telegram) = &self.telegram {
            telegram.render(event).into_iter().for_each(|r| outbox.enqueue(r));
        }
        if let Some(request) = self.webhook.as_ref().and_then(|w| w.render(event)) {
            outbox.enqueue(request);
        }
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Active sinks beyond the log.
    #[must_use]
    pub fn sink_names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.file.is_some() {
            names.push("file");
        }
        if self.outbox.is_some() {
            if self.telegram.is_some() {
                names.push("telegram");
            }
            if self.webhook.is_some() {
                names.push("webhook");
            }
        }
        names
    }

    /// Events accepted since construction.
    #[must_use]
    pub fn events_seen(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }

    /// Remote deliveries lost to a full or closed queue.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.outbox
            .as_ref()
            .map_or(0, |o| o.dropped.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert() -> NotificationEvent {
        NotificationEvent::RuleAlert {
            imei: "860000000000001".to_string(),
            rule: "jammer".to_string(),
            message: "Possible jammer <speed 40 & gsm 3>".to_string(),
        }
    }

    #[test]
    fn severities() {
        assert!(Severity::Info < Severity::Warning && Severity::Warning < Severity::Critical);
        assert_eq!(alert().severity(), Severity::Critical);
        let stopped = NotificationEvent::EngineStopped {
            reason: "signal".to_string(),
            uptime_secs: 3_725,
        };
        assert_eq!(stopped.severity(), Severity::Warning);
        assert_eq!(stopped.headline(), "fre down (signal) after 1h02m");
    }

    #[test]
    fn reload_headline_shortens_digest() {
        let event = NotificationEvent::RulesReloaded {
            rules_loaded: 4,
            digest: "0123456789abcdef0123".to_string(),
        };
        assert_eq!(event.headline(), "4 rules published, digest 0123456789ab");
    }

    #[test]
    fn telegram_renders_one_request_per_chat() {
        let sink = TelegramSink::from_config(&TelegramConfig {
            enabled: true,
            bot_token: "TOKEN".to_string(),
            chat_ids: vec!["111".to_string(), "-222".to_string()],
            ..TelegramConfig::default()
        })
        .unwrap();
        let requests = sink.render(&alert());
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].url, "https://api.telegram.org/botTOKEN/sendMessage");

        let body: serde_json::Value = serde_json::from_str(&requests[1].body).unwrap();
        assert_eq!(body["chat_id"], "-222");
        let text = body["text"].as_str().unwrap();
        assert!(text.contains("<b>jammer</b>"));
        assert!(text.contains("&lt;speed 40 &amp; gsm 3&gt;"));

        let info = NotificationEvent::EngineStarted {
            version: "0.3.0".to_string(),
            rules_loaded: 2,
        };
        assert!(sink.render(&info).is_empty());
    }

    #[test]
    fn telegram_needs_credentials() {
        let config = TelegramConfig {
            enabled: true,
            ..TelegramConfig::default()
        };
        assert!(TelegramSink::from_config(&config).is_none());
    }

    #[test]
    fn webhook_body_carries_event() {
        let sink = WebhookSink::from_config(&WebhookConfig {
            enabled: true,
            url: "http://127.0.0.1:9/hook".to_string(),
            min_severity: Severity::Warning,
        })
        .unwrap();
        let request = sink.render(&alert()).unwrap();
        let body: serde_json::Value = serde_json::from_str(&request.body).unwrap();
        assert_eq!(body["severity"], "critical");
        assert_eq!(body["event"]["type"], "rule_alert");
        assert_eq!(body["event"]["imei"], "860000000000001");

        let reload = NotificationEvent::RulesReloaded {
            rules_loaded: 1,
            digest: "d".to_string(),
        };
        assert!(sink.render(&reload).is_none());
    }

    #[test]
    fn disabled_manager_ignores_events() {
        let manager = NotificationManager::disabled();
        manager.notify(&alert());
        assert!(!manager.is_enabled());
        assert_eq!(manager.events_seen(), 0);
        assert!(manager.sink_names().is_empty());
    }

    #[test]
    fn default_manager_logs_only() {
        let manager = NotificationManager::from_config(&NotificationConfig::default());
        manager.notify(&alert());
        assert_eq!(manager.events_seen(), 1);
        assert!(manager.sink_names().is_empty());
        assert_eq!(manager.dropped(), 0);
    }

    #[test]
    fn file_sink_appends_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("events.jsonl");
        let config = NotificationConfig {
            file: FileConfig {
                enabled: true,
                path: path.clone(),
            },
            ..NotificationConfig::default()
        };
        let manager = NotificationManager::from_config(&config);
        assert_eq!(manager.sink_names(), vec!["file"]);
        manager.notify(&alert());
        manager.notify(&NotificationEvent::EngineStarted {
            version: "0.3.0".to_string(),
            rules_loaded: 2,
        });

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"]["type"], "rule_alert");
        assert_eq!(lines[0]["severity"], "critical");
        assert_eq!(lines[1]["severity"], "info");
    }

    #[test]
    fn closed_outbox_counts_drops() {
        let outbox = Outbox::start(4).unwrap();
        outbox.close();
        outbox.enqueue(Outbound {
            sink: "webhook",
            url: "http://127.0.0.1:9/".to_string(),
            body: "{}".to_string(),
        });
        assert_eq!(outbox.dropped.load(Ordering::Relaxed), 1);
    }
}
