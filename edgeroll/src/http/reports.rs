//! Status reports over HTTP

use async_trait::async_trait;
use edgeroll_api::ReportStatusRequest;
use tracing::warn;

use crate::errors::FleetError;
use crate::http::client::HttpClient;
use crate::models::update::StatusReport;
use crate::update::reporter::DeviceUpdateReporter;
use crate::utils::{calc_exp_backoff, CooldownOptions};

pub const REPORTS_PATH: &str = "/api/v1/updates/reports";

/// Posts device reports to the control plane, retrying transient failures
pub struct HttpReporter {
    client: HttpClient,
    attempts: u32,
    backoff: CooldownOptions,
}

impl HttpReporter {
    pub fn new(client: HttpClient) -> Self {
        Self {
            client,
            attempts: 3,
            backoff: CooldownOptions::default(),
        }
    }

    pub fn with_retries(mut self, attempts: u32, backoff: CooldownOptions) -> Self {
        self.attempts = attempts.max(1);
        self.backoff = backoff;
        self
    }
}

#[async_trait]
impl DeviceUpdateReporter for HttpReporter {
    async fn report(&self, report: StatusReport) -> Result<(), FleetError> {
        let body = ReportStatusRequest::from(&report);
        let mut attempt = 0;
        loop {
            match self.client.post(REPORTS_PATH, &body).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt + 1 < self.attempts => {
                    let delay = calc_exp_backoff(&self.backoff, attempt);
                    warn!(status = %report.status, "Report failed, retrying in {:?}: {}", delay, e);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
    use chrono::Utc;

    use crate::models::deployment::DeviceStatus;

    #[derive(Clone, Default)]
    struct Received {
        reports: Arc<Mutex<Vec<ReportStatusRequest>>>,
        failures_left: Arc<Mutex<u32>>,
    }

    async fn receive(
        State(received): State<Received>,
        Json(body): Json<ReportStatusRequest>,
    ) -> StatusCode {
        let mut failures = received.failures_left.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return StatusCode::SERVICE_UNAVAILABLE;
        }
        received.reports.lock().unwrap().push(body);
        StatusCode::ACCEPTED
    }

    async fn serve(received: Received) -> String {
        let app = Router::new()
            .route(REPORTS_PATH, post(receive))
            .with_state(received);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn report() -> StatusReport {
        StatusReport {
            device_id: "dev-1".to_string(),
            campaign_id: "c1".to_string(),
            deployment_id: Some("dep-1".to_string()),
            status: DeviceStatus::Installed,
            progress: 100,
            error_message: None,
            reported_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_report_retries_transient_failures() {
        let received = Received::default();
        *received.failures_left.lock().unwrap() = 1;
        let base = serve(received.clone()).await;

        let client = HttpClient::new(&base, Duration::from_secs(5)).unwrap();
        let reporter = HttpReporter::new(client).with_retries(
            3,
            CooldownOptions {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                multiplier: 2.0,
            },
        );
        reporter.report(report()).await.unwrap();

        let reports = received.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, "installed");
        assert_eq!(reports[0].deployment_id.as_deref(), Some("dep-1"));
    }
}
