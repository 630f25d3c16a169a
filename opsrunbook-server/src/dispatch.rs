use async_trait::async_trait;
use opsrunbook_core::{ClientError, ReviewCycleTrigger, ReviewEvent};
use reqwest::Client;
use std::time::Duration;
use tracing::info;

use crate::clients::http_client;

/// Forwards accepted review events to the downstream review-cycle service.
/// Without a URL the dispatch is only logged.
pub struct HttpReviewTrigger {
    client: Client,
    url: Option<String>,
}

impl HttpReviewTrigger {
    pub fn new(url: Option<String>, timeout: Duration) -> Self {
        Self {
            client: http_client(timeout),
            url,
        }
    }
}

#[async_trait]
impl ReviewCycleTrigger for HttpReviewTrigger {
    async fn dispatch(&self, event: &ReviewEvent) -> Result<(), ClientError> {
        let Some(url) = &self.url else {
            info!(
                "Review cycle for {}#{} due (delivery {}); no dispatch URL configured",
                event.repo_full_name, event.pr_number, event.delivery_id
            );
            return Ok(());
        };

        let response = self
            .client
            .post(url)
            .json(event)
            .send()
            .await
            .map_err(|e| ClientError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }

        info!(
            "Dispatched review cycle for {}#{} (delivery {})",
            event.repo_full_name, event.pr_number, event.delivery_id
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use chrono::Utc;
    use serde_json::Value;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    fn event() -> ReviewEvent {
        ReviewEvent {
            delivery_id: "d-1".to_string(),
            event_type: "issue_comment".to_string(),
            action: "created".to_string(),
            repo_full_name: "acme/orders".to_string(),
            pr_number: 7,
            installation_id: None,
            sender_login: "alice".to_string(),
            comment_body: "looks good".to_string(),
            comment_url: None,
            pr_url: None,
            review_state: None,
            command: None,
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_without_url_dispatch_is_a_no_op() {
        let trigger = HttpReviewTrigger::new(None, Duration::from_secs(1));
        assert!(trigger.dispatch(&event()).await.is_ok());
    }

    #[tokio::test]
    async fn test_posts_event_and_reports_failures() {
        let seen: Arc<Mutex<Vec<Value>>> = Arc::default();
        let sink = seen.clone();
        let app = Router::new()
            .route(
                "/cycle",
                post(move |Json(body): Json<Value>| {
                    let sink = sink.clone();
                    async move {
                        sink.lock().unwrap().push(body);
                        StatusCode::ACCEPTED
                    }
                }),
            )
            .route("/broken", post(|| async { StatusCode::BAD_GATEWAY }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let trigger = HttpReviewTrigger::new(Some(format!("{}/cycle", base)), Duration::from_secs(5));
        trigger.dispatch(&event()).await.unwrap();
        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["repo_full_name"], "acme/orders");
        assert_eq!(seen[0]["pr_number"], 7);

        let broken = HttpReviewTrigger::new(Some(format!("{}/broken", base)), Duration::from_secs(5));
        assert!(matches!(
            broken.dispatch(&event()).await,
            Err(ClientError::Status { status: 502, .. })
        ));
    }
}
