use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use gpuwatch_core::jobs::JobPayload;
use gpuwatch_core::{AlertSubscription, PriceQuote};
use gpuwatch_storage::{EnqueueOptions, JobQueue, PipelineStore, StoreError};
use serde::Serialize;
use tracing::{debug, info, warn};

pub const ALERT_COOLDOWN_HOURS: i64 = 12;
pub const ALERT_BATCH_SIZE: i64 = 250;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AlertMatchReport {
    pub scanned: usize,
    pub notified: usize,
}

/// Matches confirmed subscriptions against the current cheapest price in their scope.
pub struct AlertMatcher {
    store: Arc<dyn PipelineStore>,
    queue: Arc<dyn JobQueue>,
    public_url: String,
    cooldown: Duration,
    batch_size: i64,
}

impl AlertMatcher {
    pub fn new(store: Arc<dyn PipelineStore>, queue: Arc<dyn JobQueue>, public_url: &str) -> Self {
        Self {
            store,
            queue,
            public_url: public_url.trim_end_matches('/').to_string(),
            cooldown: Duration::hours(ALERT_COOLDOWN_HOURS),
            batch_size: ALERT_BATCH_SIZE,
        }
    }

    pub async fn run(&self) -> Result<AlertMatchReport, StoreError> {
        self.run_at(Utc::now()).await
    }

    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<AlertMatchReport, StoreError> {
        let due = self
            .store
            .due_alert_subscriptions(now - self.cooldown, self.batch_size)
            .await?;
        let mut report = AlertMatchReport {
            scanned: due.len(),
            notified: 0,
        };

        for subscription in due {
            let Some(quote) = self
                .store
                .min_active_price(subscription.gpu_model_id, subscription.provider_id)
                .await?
            else {
                continue;
            };
            if quote.price_per_gpu_hour > subscription.target_price_per_gpu_hour {
                debug!(subscription_id = %subscription.id, price = quote.price_per_gpu_hour, "target not reached");
                continue;
            }

            let payload = self.email_for(&subscription, &quote);
            if let Err(err) = self.queue.enqueue(&payload, EnqueueOptions::default()).await {
                // Not stamped, so the next cycle retries this subscription.
                warn!(subscription_id = %subscription.id, error = %err, "could not enqueue alert email");
                continue;
            }
            self.store
                .mark_subscription_notified(subscription.id, now)
                .await?;
            report.notified += 1;
        }

        info!(scanned = report.scanned, notified = report.notified, "alert matching finished");
        Ok(report)
    }

    fn email_for(&self, subscription: &AlertSubscription, quote: &PriceQuote) -> JobPayload {
        let subject = format!(
            "GPU price alert: ${:.2}/GPU-hr on {}",
            quote.price_per_gpu_hour, quote.provider_name
        );
        let text = format!(
            "{provider} is offering {instance} at ${price:.2} per GPU-hour, at or below your target of ${target:.2}.\n\n\
             Unsubscribe: {base}/api/alerts/unsubscribe/{token}\n",
            provider = quote.provider_name,
            instance = quote.instance_type,
            price = quote.price_per_gpu_hour,
            target = subscription.target_price_per_gpu_hour,
            base = self.public_url,
            token = subscription.unsubscribe_token,
        );
        JobPayload::Email {
            to: subscription.email.clone(),
            subject,
            text,
        }
    }
}
