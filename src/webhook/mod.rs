//! Forwards decoded device records to the configured HTTP sink (spec §4.5).
//!
//! A webhook failure must never affect the device connection: every call here is logged
//! and absorbed, never propagated to the caller as an error the session loop would have to
//! handle (mirrors the teacher's `utils::api` pattern of warning and returning `None`/unit
//! on a failed downstream call rather than bubbling an error up into the connection path).

use std::time::Duration;

use log::warn;
use reqwest::Client;

use crate::protocol::DeviceRecord;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct WebhookSink {
    client: Client,
    url: String,
    secret_key: String,
}

impl WebhookSink {
    pub fn new(url: String, secret_key: String) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build webhook HTTP client");
        WebhookSink { client, url, secret_key }
    }

    /// Posts a record and returns immediately after one attempt; any failure is logged and
    /// dropped. This is the path used from the session supervisor's hot loop (spec §4.5,
    /// "fire-and-forget").
    pub async fn forward(&self, record: &DeviceRecord) {
        if let Err(err) = self.post(record).await {
            warn!("webhook delivery failed for {}: {}", record.imei, err);
        }
    }

    /// Posts a record with exponential backoff retries, for callers that can afford to wait
    /// (spec §4.5's optional retry variant). Gives up silently after `max_attempts`.
    pub async fn forward_with_retry(&self, record: &DeviceRecord, max_attempts: u32) {
        let mut delay = RETRY_BASE_DELAY;
        for attempt in 1..=max_attempts {
            match self.post(record).await {
                Ok(()) => return,
                Err(err) if attempt == max_attempts => {
                    warn!("webhook delivery failed for {} after {} attempts: {}", record.imei, attempt, err);
                }
                Err(err) => {
                    warn!("webhook delivery attempt {} failed for {}: {}", attempt, record.imei, err);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }

    async fn post(&self, record: &DeviceRecord) -> Result<(), reqwest::Error> {
        self.client
            .post(&self.url)
            .bearer_auth(&self.secret_key)
            .json(record)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use httpmock::prelude::*;

    use crate::listener::Protocol;
    use crate::protocol::PacketType;

    fn sample_record() -> DeviceRecord {
        DeviceRecord {
            imei: "123456789012345".to_string(),
            protocol: Protocol::Gt06,
            packet_type: PacketType::Location,
            timestamp: Utc::now(),
            location: None,
            sensors: None,
            status: None,
            raw_hex: "7878".to_string(),
        }
    }

    #[tokio::test]
    async fn test_forward_posts_json_body_with_bearer_auth() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/records").header("authorization", "Bearer secret");
            then.status(200);
        });

        let sink = WebhookSink::new(server.url("/records"), "secret".to_string());
        sink.forward(&sample_record()).await;

        mock.assert();
    }

    #[tokio::test]
    async fn test_forward_with_retry_gives_up_after_max_attempts() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/records");
            then.status(500);
        });

        let sink = WebhookSink::new(server.url("/records"), "secret".to_string());
        sink.forward_with_retry(&sample_record(), 2).await;

        mock.assert_hits(2);
    }
}
