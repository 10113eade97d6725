//! Dead-man's-switch signaling for monitor runs.
//!
//! A healthy scan pings the success URL. A scan that found gaps or staleness
//! pings the failure URL with a diagnostic body. A scan that could not run
//! sends nothing, so the external switch times out on its own.

use std::fmt::Write as _;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;
use tracing::info;
use tracing::warn;
use url::Url;

use crate::error::GaplessErr;
use crate::error::Result;
use crate::monitor::ScanOutcome;
use crate::monitor::ScanReport;
use crate::monitor::ScanStatus;

const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(10);

/// `[heartbeat]` table in `config.toml`.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct HeartbeatToml {
    pub success_url: Option<String>,
    /// Defaults to `success_url` with `/fail` appended.
    pub failure_url: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingChannel {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PingOutcome {
    Sent { channel: PingChannel, status: u16 },
    /// The endpoint could not be reached or answered with an error status.
    Failed { channel: PingChannel, message: String },
    /// The scan failed, so no ping was sent.
    Suppressed,
}

#[derive(Debug, Clone)]
pub struct HeartbeatReporter {
    client: reqwest::Client,
    success_url: Url,
    failure_url: Url,
    gap_report_limit: usize,
}

impl HeartbeatReporter {
    pub fn new(
        success_url: Url,
        failure_url: Option<Url>,
        timeout: Duration,
        gap_report_limit: usize,
    ) -> Result<Self> {
        let failure_url = match failure_url {
            Some(url) => url,
            None => default_failure_url(&success_url)?,
        };
        let client = build_client(timeout)?;
        Ok(Self {
            client,
            success_url,
            failure_url,
            gap_report_limit,
        })
    }

    /// Build a reporter from config. `None` when no success URL is configured.
    pub fn from_toml(toml: &HeartbeatToml, gap_report_limit: usize) -> Result<Option<Self>> {
        let Some(success_url) = toml.success_url.as_deref() else {
            return Ok(None);
        };
        let success_url = parse_url("heartbeat.success_url", success_url)?;
        let failure_url = toml
            .failure_url
            .as_deref()
            .map(|url| parse_url("heartbeat.failure_url", url))
            .transpose()?;
        let timeout = toml
            .timeout_secs
            .map_or(DEFAULT_PING_TIMEOUT, Duration::from_secs);
        Self::new(success_url, failure_url, timeout, gap_report_limit).map(Some)
    }

    pub fn failure_url(&self) -> &Url {
        &self.failure_url
    }

    /// Route one scan outcome to the matching endpoint.
    ///
    /// Ping failures are logged and returned, never raised.
    pub async fn report(&self, outcome: &ScanOutcome) -> PingOutcome {
        let report = match outcome {
            ScanOutcome::Failed(err) => {
                info!("scan failed ({err}); withholding heartbeat");
                return PingOutcome::Suppressed;
            }
            ScanOutcome::Completed(report) => report,
        };
        let (channel, url) = match report.status {
            ScanStatus::Healthy => (PingChannel::Success, &self.success_url),
            ScanStatus::GapsFound | ScanStatus::Stale => (PingChannel::Failure, &self.failure_url),
            ScanStatus::ScanFailed => return PingOutcome::Suppressed,
        };
        let body = diagnostic_body(report, self.gap_report_limit);
        self.ping(channel, url, body).await
    }

    async fn ping(&self, channel: PingChannel, url: &Url, body: String) -> PingOutcome {
        send_ping(&self.client, channel, url, body).await
    }
}

/// Periodic success ping for a long-running job such as the streamer.
///
/// The job pings while it is making progress. When it stops, the external
/// switch times out and alerts.
#[derive(Debug, Clone)]
pub struct LivenessPinger {
    client: reqwest::Client,
    url: Url,
}

impl LivenessPinger {
    pub fn new(url: Url, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            url,
        })
    }

    /// Parse `url` from the config field `field`.
    pub fn from_config(field: &str, url: &str, timeout: Option<Duration>) -> Result<Self> {
        Self::new(
            parse_url(field, url)?,
            timeout.unwrap_or(DEFAULT_PING_TIMEOUT),
        )
    }

    pub async fn ping(&self, body: String) -> PingOutcome {
        send_ping(&self.client, PingChannel::Success, &self.url, body).await
    }
}

fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|err| GaplessErr::Config(format!("failed to build http client: {err}")))
}

async fn send_ping(
    client: &reqwest::Client,
    channel: PingChannel,
    url: &Url,
    body: String,
) -> PingOutcome {
    debug!("sending {channel:?} heartbeat to {url}");
    match client.post(url.clone()).body(body).send().await {
        Ok(resp) if resp.status().is_success() => PingOutcome::Sent {
            channel,
            status: resp.status().as_u16(),
        },
        Ok(resp) => {
            let message = format!("{url} returned {}", resp.status());
            warn!("failed to send {channel:?} heartbeat: {message}");
            PingOutcome::Failed { channel, message }
        }
        Err(err) => {
            let message = err.to_string();
            warn!("failed to send {channel:?} heartbeat to {url}: {message}");
            PingOutcome::Failed { channel, message }
        }
    }
}

fn parse_url(field: &str, value: &str) -> Result<Url> {
    Url::parse(value).map_err(|err| GaplessErr::Config(format!("invalid {field} {value}: {err}")))
}

fn default_failure_url(success_url: &Url) -> Result<Url> {
    let mut url = success_url.clone();
    let path = format!("{}/fail", success_url.path().trim_end_matches('/'));
    url.set_path(&path);
    if url.cannot_be_a_base() {
        return Err(GaplessErr::Config(format!(
            "cannot derive a failure url from {success_url}"
        )));
    }
    Ok(url)
}

/// Plain-text summary of a scan, sent as the ping body.
pub fn diagnostic_body(report: &ScanReport, gap_limit: usize) -> String {
    let mut body = String::new();
    let _ = writeln!(body, "Status: {}", report.status);
    let fresh = if report.is_stale() { "no" } else { "yes" };
    match report.staleness {
        Some(staleness) => {
            let _ = writeln!(
                body,
                "Fresh: {fresh} (staleness {}s, threshold {}s)",
                staleness.as_secs(),
                report.staleness_threshold.as_secs()
            );
        }
        None => {
            let _ = writeln!(body, "Fresh: {fresh} (no blocks stored)");
        }
    }
    if let (Some(max), Some(latest)) = (report.stats.max, report.latest_observed_at) {
        let _ = writeln!(body, "Latest block: {max} at {}", latest.to_rfc3339());
    }
    let _ = writeln!(
        body,
        "Records: total={} expected={} missing={} completeness={:.4}%",
        report.stats.total,
        report.stats.expected(),
        report.stats.missing(),
        report.stats.completeness_pct()
    );
    let _ = writeln!(body, "Window: {}", report.window);
    let _ = writeln!(
        body,
        "Gaps: {} ({} blocks missing)",
        report.gaps.len(),
        report.missing_in_gaps()
    );
    let largest = report.largest_gaps(gap_limit);
    if !largest.is_empty() {
        let _ = writeln!(body, "Largest gaps:");
        for gap in &largest {
            let _ = writeln!(body, "  [{}, {}] ({} blocks)", gap.start, gap.end, gap.size());
        }
        if report.gaps.len() > largest.len() {
            let _ = writeln!(body, "  ... {} more", report.gaps.len() - largest.len());
        }
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SequenceRange;
    use crate::monitor::Gap;
    use chrono::DateTime;
    use chrono::Utc;
    use gapless_state::CanonicalStats;
    use pretty_assertions::assert_eq;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;
    use wiremock::matchers::method;
    use wiremock::matchers::path;

    fn report(status: ScanStatus, gaps: Vec<Gap>, staleness_secs: u64) -> ScanReport {
        ScanReport {
            window: SequenceRange { start: 1, end: 10 },
            gaps,
            staleness: Some(Duration::from_secs(staleness_secs)),
            staleness_threshold: Duration::from_secs(960),
            latest_observed_at: DateTime::<Utc>::from_timestamp(1_700_000_000, 0),
            stats: CanonicalStats {
                total: 6,
                min: Some(1),
                max: Some(10),
            },
            status,
        }
    }

    fn reporter_for(server: &MockServer) -> HeartbeatReporter {
        let success_url = Url::parse(&format!("{}/ping/abc", server.uri())).expect("url");
        HeartbeatReporter::new(success_url, None, Duration::from_secs(5), 20).expect("reporter")
    }

    async fn mount_ok(server: &MockServer, route: &str) {
        Mock::given(method("POST"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200))
            .mount(server)
            .await;
    }

    #[test]
    fn failure_url_defaults_to_fail_suffix() {
        let success = Url::parse("https://hc-ping.com/uuid-123/").expect("url");
        let failure = default_failure_url(&success).expect("failure url");
        assert_eq!(failure.as_str(), "https://hc-ping.com/uuid-123/fail");
    }

    #[tokio::test]
    async fn healthy_scan_pings_success_url() {
        let server = MockServer::start().await;
        mount_ok(&server, "/ping/abc").await;
        mount_ok(&server, "/ping/abc/fail").await;
        let reporter = reporter_for(&server);

        let outcome = reporter
            .report(&ScanOutcome::Completed(report(ScanStatus::Healthy, Vec::new(), 30)))
            .await;

        assert_eq!(
            outcome,
            PingOutcome::Sent {
                channel: PingChannel::Success,
                status: 200
            }
        );
        let requests = server.received_requests().await.expect("requests");
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].url.path(), "/ping/abc");
    }

    #[tokio::test]
    async fn gaps_ping_failure_url_with_diagnostics() {
        let server = MockServer::start().await;
        mount_ok(&server, "/ping/abc").await;
        mount_ok(&server, "/ping/abc/fail").await;
        let reporter = reporter_for(&server);
        let gaps = vec![Gap { start: 4, end: 6 }, Gap { start: 9, end: 9 }];

        let outcome = reporter
            .report(&ScanOutcome::Completed(report(ScanStatus::GapsFound, gaps, 30)))
            .await;

        assert_eq!(
            outcome,
            PingOutcome::Sent {
                channel: PingChannel::Failure,
                status: 200
            }
        );
        let requests = server.received_requests().await.expect("requests");
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].url.path(), "/ping/abc/fail");
        let body = String::from_utf8(requests[0].body.clone()).expect("utf8 body");
        assert!(body.contains("Status: GAPS_FOUND"), "{body}");
        assert!(body.contains("[4, 6] (3 blocks)"), "{body}");
        assert!(body.contains("[9, 9] (1 blocks)"), "{body}");
    }

    #[tokio::test]
    async fn stale_scan_pings_failure_url() {
        let server = MockServer::start().await;
        mount_ok(&server, "/ping/abc/fail").await;
        let reporter = reporter_for(&server);

        let outcome = reporter
            .report(&ScanOutcome::Completed(report(ScanStatus::Stale, Vec::new(), 5_000)))
            .await;

        assert_eq!(
            outcome,
            PingOutcome::Sent {
                channel: PingChannel::Failure,
                status: 200
            }
        );
        let requests = server.received_requests().await.expect("requests");
        let body = String::from_utf8(requests[0].body.clone()).expect("utf8 body");
        assert!(body.contains("Fresh: no (staleness 5000s, threshold 960s)"), "{body}");
    }

    #[tokio::test]
    async fn failed_scan_sends_nothing() {
        let server = MockServer::start().await;
        mount_ok(&server, "/ping/abc").await;
        mount_ok(&server, "/ping/abc/fail").await;
        let reporter = reporter_for(&server);

        let outcome = reporter
            .report(&ScanOutcome::Failed(GaplessErr::Store {
                operation: "scan",
                message: "database is locked".to_string(),
            }))
            .await;

        assert_eq!(outcome, PingOutcome::Suppressed);
        let requests = server.received_requests().await.expect("requests");
        assert_eq!(requests.len(), 0);
    }

    #[tokio::test]
    async fn endpoint_errors_are_reported_not_raised() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let reporter = reporter_for(&server);

        let outcome = reporter
            .report(&ScanOutcome::Completed(report(ScanStatus::Healthy, Vec::new(), 1)))
            .await;

        assert!(matches!(
            outcome,
            PingOutcome::Failed {
                channel: PingChannel::Success,
                ..
            }
        ));
    }

    #[test]
    fn from_toml_without_success_url_is_disabled() {
        let reporter = HeartbeatReporter::from_toml(&HeartbeatToml::default(), 20).expect("ok");
        assert!(reporter.is_none());
    }

    #[test]
    fn from_toml_rejects_invalid_urls() {
        let err = HeartbeatReporter::from_toml(
            &HeartbeatToml {
                success_url: Some("not a url".to_string()),
                ..HeartbeatToml::default()
            },
            20,
        )
        .expect_err("invalid url");
        assert!(matches!(err, GaplessErr::Config(_)));
    }

    #[test]
    fn diagnostic_body_truncates_gap_list() {
        let gaps = (0..5)
            .map(|idx| Gap {
                start: idx * 10,
                end: idx * 10 + idx,
            })
            .collect();
        let body = diagnostic_body(&report(ScanStatus::GapsFound, gaps, 1), 2);
        assert!(body.contains("Gaps: 5 (15 blocks missing)"), "{body}");
        assert!(body.contains("  [40, 44] (5 blocks)"), "{body}");
        assert!(body.contains("  [30, 33] (4 blocks)"), "{body}");
        assert!(!body.contains("[20, 22]"), "{body}");
        assert!(body.contains("... 3 more"), "{body}");
    }
}
