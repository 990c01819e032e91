//! Tenant notifications
//!
//! Each tenant gets up to four messages per run: shelved instances,
//! deleted instances, upcoming shelves and upcoming deletions.

mod html;
mod mailer;
mod message;

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::actions::{ActionOutcome, ActionStatus};
use crate::lifecycle::{ClassificationResult, ClassifiedInstance, Verdict};
use crate::settings::LifecyclePolicy;

pub use html::{ActionRow, HtmlRenderer, WarningRow};
pub use mailer::{HttpMailer, LogMailer, Mailer};
pub use message::{action_message, days_remaining};

/// Default subject prefix
pub const DEFAULT_SUBJECT_PREFIX: &str = "Cloud lifecycle";

/// Errors raised while building or sending notifications
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("invalid notification template: {0}")]
    Template(#[from] handlebars::TemplateError),

    #[error("failed to render notification: {0}")]
    Render(#[from] handlebars::RenderError),

    #[error("mail relay request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("mail relay returned {status}: {body}")]
    Relay { status: u16, body: String },

    #[error("invalid mail relay url: {0}")]
    Url(#[from] url::ParseError),
}

/// Category of a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Shelve,
    Delete,
    ShelveWarning,
    DeleteWarning,
}

impl NotificationKind {
    pub const ALL: [NotificationKind; 4] = [
        NotificationKind::Shelve,
        NotificationKind::Delete,
        NotificationKind::ShelveWarning,
        NotificationKind::DeleteWarning,
    ];

    fn verdict(&self) -> Verdict {
        match self {
            NotificationKind::Shelve => Verdict::Shelve,
            NotificationKind::Delete => Verdict::Delete,
            NotificationKind::ShelveWarning => Verdict::ShelveWarn,
            NotificationKind::DeleteWarning => Verdict::DeleteWarn,
        }
    }

    pub fn subject(&self, prefix: &str) -> String {
        match self {
            NotificationKind::Shelve => format!("{prefix} SHELVE notification"),
            NotificationKind::Delete => format!("{prefix} DELETE notification"),
            NotificationKind::ShelveWarning => format!("{prefix} before SHELVE warning"),
            NotificationKind::DeleteWarning => format!("{prefix} before DELETE warning"),
        }
    }

    fn paragraph(&self, tenant: &str) -> String {
        match self {
            NotificationKind::Shelve => {
                format!("The following instances in the {tenant} tenant have been shelved:")
            }
            NotificationKind::Delete => {
                format!("The following instances in the {tenant} tenant have been deleted:")
            }
            NotificationKind::ShelveWarning => {
                format!("The following instances in the {tenant} tenant will be shelved soon:")
            }
            NotificationKind::DeleteWarning => {
                format!("The following instances in the {tenant} tenant will be deleted soon:")
            }
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationKind::Shelve => write!(f, "shelve"),
            NotificationKind::Delete => write!(f, "delete"),
            NotificationKind::ShelveWarning => write!(f, "shelve_warning"),
            NotificationKind::DeleteWarning => write!(f, "delete_warning"),
        }
    }
}

/// A rendered message for one tenant
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub tenant: String,
    pub kind: NotificationKind,
    pub recipients: Vec<String>,
    pub subject: String,
    pub html_body: String,
}

/// Builds notifications from a classification result
pub struct NotificationBuilder {
    renderer: HtmlRenderer,
    subject_prefix: String,
}

impl NotificationBuilder {
    pub fn new(subject_prefix: impl Into<String>) -> Result<Self, NotifyError> {
        Ok(Self {
            renderer: HtmlRenderer::new()?,
            subject_prefix: subject_prefix.into(),
        })
    }

    /// One notification per tenant and category
    ///
    /// Tenants without a recipient (and no default address) are logged and
    /// skipped.
    pub fn build(
        &self,
        result: &ClassificationResult,
        outcomes: &[ActionOutcome],
        policy: &LifecyclePolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<Notification>, NotifyError> {
        let statuses: HashMap<(&str, &str, Verdict), &ActionStatus> = outcomes
            .iter()
            .map(|o| {
                (
                    (o.tenant.as_str(), o.instance_id.as_str(), o.action),
                    &o.status,
                )
            })
            .collect();

        let mut notifications = Vec::new();
        for kind in NotificationKind::ALL {
            let Some(bucket) = result.bucket(kind.verdict()) else {
                continue;
            };
            for (tenant, instances) in bucket {
                let Some(recipient) = policy.recipient(tenant) else {
                    warn!(
                        tenant = %tenant,
                        kind = %kind,
                        "No notification address for tenant, skipping"
                    );
                    continue;
                };

                let html_body = self.render(kind, tenant, instances, &statuses, now)?;
                notifications.push(Notification {
                    tenant: tenant.clone(),
                    kind,
                    recipients: vec![recipient.to_string()],
                    subject: kind.subject(&self.subject_prefix),
                    html_body,
                });
            }
        }

        Ok(notifications)
    }

    fn render<'a>(
        &self,
        kind: NotificationKind,
        tenant: &'a str,
        instances: &'a [ClassifiedInstance],
        statuses: &HashMap<(&'a str, &'a str, Verdict), &ActionStatus>,
        now: DateTime<Utc>,
    ) -> Result<String, NotifyError> {
        let paragraph = kind.paragraph(tenant);
        let details = |instance: &ClassifiedInstance| {
            action_message(&instance.snapshot, instance.verdict, &instance.settings, now)
        };

        match kind {
            NotificationKind::Shelve | NotificationKind::Delete => {
                let rows: Vec<ActionRow> = instances
                    .iter()
                    .map(|instance| ActionRow {
                        instance: instance.snapshot.name.clone(),
                        details: details(instance),
                        status: statuses
                            .get(&(tenant, instance.snapshot.id.as_str(), instance.verdict))
                            .map(|status| status.to_string())
                            .unwrap_or_else(|| "Not attempted".to_string()),
                    })
                    .collect();
                self.renderer.render_actions(&paragraph, &rows)
            }
            NotificationKind::ShelveWarning | NotificationKind::DeleteWarning => {
                let rows: Vec<WarningRow> = instances
                    .iter()
                    .map(|instance| WarningRow {
                        instance: instance.snapshot.name.clone(),
                        details: details(instance),
                    })
                    .collect();
                self.renderer.render_warnings(&paragraph, &rows)
            }
        }
    }
}

/// Outcome of a notification pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliverySummary {
    pub sent: usize,
    pub failed: usize,
    /// Per category counts of sent messages
    pub by_kind: BTreeMap<String, usize>,
}

/// Send every notification, logging failures instead of aborting
pub async fn deliver(mailer: &dyn Mailer, notifications: &[Notification]) -> DeliverySummary {
    let mut summary = DeliverySummary::default();

    for notification in notifications {
        match mailer.send(notification).await {
            Ok(()) => {
                summary.sent += 1;
                *summary
                    .by_kind
                    .entry(notification.kind.to_string())
                    .or_default() += 1;
            }
            Err(e) => {
                warn!(
                    tenant = %notification.tenant,
                    kind = %notification.kind,
                    mailer = mailer.name(),
                    error = %e,
                    "Failed to send notification"
                );
                summary.failed += 1;
            }
        }
    }

    summary
}
