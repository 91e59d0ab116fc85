//! Localized "new draw" push notifications.

use async_trait::async_trait;
use lotto_core::DrawRecord;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "lotto-notify";

pub const FCM_ENDPOINT: &str = "https://fcm.googleapis.com/v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicMessage {
    pub topic: String,
    pub title: String,
    pub body: String,
}

/// One message per subscriber language, plus the language-neutral topic.
pub fn topic_messages(draw_date: &str) -> Vec<TopicMessage> {
    [
        (
            "lottery_updates_zh",
            "【Lotto Go】开奖结果更新 🎉".to_string(),
            format!("泰国彩票 ({draw_date}) 已开奖，快来查看您的好运吧！"),
        ),
        (
            "lottery_updates_th",
            "【Lotto Go】ผลสลากออกแล้ว 🎉".to_string(),
            format!("สลากกินแบ่งรัฐบาล งวดวันที่ {draw_date} ตรวจผลได้แล้ววันนี้!"),
        ),
        (
            "lottery_updates_en",
            "【Lotto Go】Results Updated 🎉".to_string(),
            format!("Thai Lottery ({draw_date}) results are now available. Check your luck!"),
        ),
        (
            "lottery_updates",
            "🎉 Lottery Results Updated!".to_string(),
            format!("New draw results for {draw_date} are available now!"),
        ),
    ]
    .into_iter()
    .map(|(topic, title, body)| TopicMessage {
        topic: topic.to_string(),
        title,
        body,
    })
    .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotifyReport {
    pub attempted: usize,
    pub delivered: usize,
    /// `(topic, error)` for each message that was not accepted.
    pub failures: Vec<(String, String)>,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("push service returned {status} for topic {topic}: {body}")]
    Rejected {
        topic: String,
        status: u16,
        body: String,
    },
    #[error("no notification delivered ({attempted} attempted)")]
    NothingDelivered { report: NotifyReport, attempted: usize },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    /// Announce `record` as the newest draw. Fails only if nothing was delivered.
    async fn notify(&self, record: &DrawRecord) -> Result<NotifyReport, NotifyError>;
}

/// Writes the messages to the log instead of sending them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, record: &DrawRecord) -> Result<NotifyReport, NotifyError> {
        let messages = topic_messages(record.draw_date());
        for msg in &messages {
            info!(topic = %msg.topic, title = %msg.title, body = %msg.body, "notification (log only)");
        }
        Ok(NotifyReport {
            attempted: messages.len(),
            delivered: messages.len(),
            failures: Vec::new(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FcmCredentials {
    pub project_id: String,
    /// Pre-minted OAuth2 bearer token for the messaging scope.
    pub access_token: String,
}

/// Firebase Cloud Messaging HTTP v1 topic sender.
pub struct FcmNotifier {
    client: reqwest::Client,
    endpoint: String,
    credentials: FcmCredentials,
}

impl FcmNotifier {
    pub fn new(credentials: FcmCredentials) -> Self {
        Self::with_endpoint(credentials, FCM_ENDPOINT)
    }

    pub fn with_endpoint(credentials: FcmCredentials, endpoint: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            credentials,
        }
    }

    fn send_url(&self) -> String {
        format!(
            "{}/projects/{}/messages:send",
            self.endpoint, self.credentials.project_id
        )
    }

    pub fn message_payload(msg: &TopicMessage) -> serde_json::Value {
        serde_json::json!({
            "message": {
                "topic": msg.topic,
                "notification": {
                    "title": msg.title,
                    "body": msg.body,
                },
                "android": {
                    "priority": "high",
                    "notification": {
                        "channel_id": "fcm_channel",
                        "icon": "launcher_icon",
                        "sound": "default",
                    },
                },
            }
        })
    }

    async fn send_one(&self, msg: &TopicMessage) -> Result<(), NotifyError> {
        let resp = self
            .client
            .post(self.send_url())
            .bearer_auth(&self.credentials.access_token)
            .json(&Self::message_payload(msg))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected {
                topic: msg.topic.clone(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for FcmNotifier {
    fn name(&self) -> &str {
        "fcm"
    }

    async fn notify(&self, record: &DrawRecord) -> Result<NotifyReport, NotifyError> {
        let messages = topic_messages(record.draw_date());
        let mut report = NotifyReport {
            attempted: messages.len(),
            ..NotifyReport::default()
        };
        for msg in &messages {
            match self.send_one(msg).await {
                Ok(()) => {
                    info!(topic = %msg.topic, draw_date = record.draw_date(), "notification sent");
                    report.delivered += 1;
                }
                Err(err) => {
                    warn!(topic = %msg.topic, error = %err, "notification failed");
                    report.failures.push((msg.topic.clone(), err.to_string()));
                }
            }
        }
        if report.delivered == 0 && report.attempted > 0 {
            return Err(NotifyError::NothingDelivered {
                attempted: report.attempted,
                report,
            });
        }
        Ok(report)
    }
}
