//! HTTP client for the remote calendar provider.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::instrument;

use crate::error::ProviderError;
use crate::types::{Event, EventListResponse, EventWindow};

const CALENDAR_API_BASE: &str = "https://www.googleapis.com/calendar/v3";
const HTTP_TIMEOUT_SECS: u64 = 30;

pub struct CalendarClient {
    client: reqwest::Client,
    access_token: String,
    base_url: String,
}

impl CalendarClient {
    /// # Errors
    ///
    /// Fails if the underlying HTTP client cannot be constructed (missing
    /// TLS backend, for instance).
    pub fn new(access_token: &str) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            access_token: access_token.to_string(),
            base_url: CALENDAR_API_BASE.to_string(),
        })
    }

    #[cfg(test)]
    #[allow(clippy::unwrap_used)]
    pub fn new_with_base_url(access_token: &str, base_url: &str) -> Self {
        let mut client = Self::new(access_token).unwrap();
        client.base_url = base_url.to_string();
        client
    }

    fn auth_header(&self) -> String {
        format!("Bearer {}", self.access_token)
    }

    /// List events in `[time_min, time_max]` from the primary calendar.
    ///
    /// With `changed_since` set, the provider filters by change time and
    /// returns cancelled events as explicit markers; without it, cancelled
    /// events are omitted entirely.
    #[instrument(skip(self), level = "info")]
    pub async fn list_events(
        &self,
        time_min: DateTime<Utc>,
        time_max: DateTime<Utc>,
        changed_since: Option<DateTime<Utc>>,
        max_results: u32,
    ) -> Result<EventWindow, ProviderError> {
        let mut url = format!(
            "{}/calendars/primary/events?timeMin={}&timeMax={}&maxResults={}&singleEvents=true",
            self.base_url,
            urlencoding::encode(&time_min.to_rfc3339()),
            urlencoding::encode(&time_max.to_rfc3339()),
            max_results,
        );

        match changed_since {
            Some(since) => {
                url.push_str(&format!(
                    "&updatedMin={}&showDeleted=true",
                    urlencoding::encode(&since.to_rfc3339()),
                ));
            }
            None => url.push_str("&orderBy=startTime"),
        }

        let response = self
            .client
            .get(&url)
            .header("Authorization", self.auth_header())
            .send()
            .await?;

        let resp: EventListResponse = self.handle_response(response).await?;
        Ok(EventWindow {
            summary: resp.summary.unwrap_or_default(),
            events: resp.items.into_iter().map(Event::from_api).collect(),
        })
    }

    /// Helper to handle API responses and errors.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, ProviderError> {
        let status = response.status();

        if status.is_success() {
            response
                .json()
                .await
                .map_err(|e| ProviderError::Api(format!("JSON parse error: {}", e)))
        } else if status.as_u16() == 401 || status.as_u16() == 403 {
            Err(ProviderError::Unauthorized)
        } else if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(60);
            Err(ProviderError::RateLimited(retry_after))
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(ProviderError::Api(format!("{}: {}", status, text)))
        }
    }
}
