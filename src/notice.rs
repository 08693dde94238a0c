// User-visible notices: attachment rejections, failures and "stopped" messages

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
    pub emitted_at: DateTime<Utc>,
}

impl Notice {
    pub fn info(message: impl Into<String>) -> Self {
        Self::new(NoticeLevel::Info, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(NoticeLevel::Error, message)
    }

    fn new(level: NoticeLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            emitted_at: Utc::now(),
        }
    }
}

/// Sending half of the notification channel.
///
/// Emitting never fails: once the receiver is gone notices are dropped.
#[derive(Debug, Clone, Default)]
pub struct NoticeSink {
    tx: Option<mpsc::UnboundedSender<Notice>>,
}

impl NoticeSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that discards everything.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn emit(&self, notice: Notice) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(notice);
        }
    }
}
