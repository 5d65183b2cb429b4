use crate::config::Config;
use crate::telemetry::{Point, MEASUREMENT};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::fmt::Write as _;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("InfluxDB request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("InfluxDB rejected write ({status}): {body}")]
    Rejected { status: StatusCode, body: String },
    #[error("InfluxDB ping returned {0}")]
    Unhealthy(StatusCode),
}

impl SinkError {
    /// Whether the sink handle itself should be torn down and rebuilt.
    pub fn is_connection_loss(&self) -> bool {
        match self {
            SinkError::Transport(_) | SinkError::Unhealthy(_) => true,
            SinkError::Rejected { status, .. } => {
                status.is_server_error()
                    || *status == StatusCode::UNAUTHORIZED
                    || *status == StatusCode::FORBIDDEN
            }
        }
    }
}

/// Batched point writer. One call is one batch; implementations either
/// accept the whole batch or fail it.
#[async_trait]
pub trait PointSink: Send + Sync {
    async fn write(&self, points: &[Point]) -> Result<(), SinkError>;
}

#[derive(Clone)]
pub struct InfluxSink {
    client: Client,
    write_url: String,
    ping_url: String,
    token: String,
    org: String,
    bucket: String,
}

impl InfluxSink {
    pub fn new(config: &Config) -> Result<Self, SinkError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(config.write_timeout())
            .danger_accept_invalid_certs(!config.influxdb_verify_tls)
            .build()?;
        let base = config.influxdb_base_url();
        Ok(Self {
            client,
            write_url: format!("{base}/api/v2/write"),
            ping_url: format!("{base}/ping"),
            token: config.influxdb_token.clone(),
            org: config.influxdb_org.clone(),
            bucket: config.influxdb_bucket.clone(),
        })
    }

    pub async fn connect(config: &Config) -> Result<Self, SinkError> {
        let sink = Self::new(config)?;
        sink.ping().await?;
        tracing::info!(url = %sink.write_url, bucket = %sink.bucket, "connected to InfluxDB");
        Ok(sink)
    }

    pub async fn ping(&self) -> Result<(), SinkError> {
        let response = self.client.get(&self.ping_url).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(SinkError::Unhealthy(response.status()))
        }
    }
}

#[async_trait]
impl PointSink for InfluxSink {
    async fn write(&self, points: &[Point]) -> Result<(), SinkError> {
        if points.is_empty() {
            return Ok(());
        }
        let body = encode_batch(points);
        let mut request = self
            .client
            .post(&self.write_url)
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "ns"),
            ])
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body);
        if !self.token.is_empty() {
            request = request.header("Authorization", format!("Token {}", self.token));
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            tracing::debug!(len = points.len(), "wrote points batch");
            return Ok(());
        }
        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        Err(SinkError::Rejected { status, body })
    }
}

pub fn encode_batch(points: &[Point]) -> String {
    let mut out = String::with_capacity(points.len() * 96);
    for point in points {
        encode_point(&mut out, point);
        out.push('\n');
    }
    out
}

/// Line protocol, tags in key order, empty tag values omitted.
pub fn encode_point(out: &mut String, point: &Point) {
    out.push_str(MEASUREMENT);
    for (key, value) in [
        ("Channel", point.channel.as_str()),
        ("Data_Type", point.data_type.as_str()),
        ("Device", point.device.as_str()),
        ("IO_Type", point.io_type.as_str()),
    ] {
        if value.is_empty() {
            continue;
        }
        out.push(',');
        out.push_str(key);
        out.push('=');
        escape_tag(out, value);
    }
    let nanos = point
        .timestamp
        .timestamp_nanos_opt()
        .unwrap_or_else(|| point.timestamp.timestamp_micros().saturating_mul(1000));
    let _ = write!(out, " value={:?} {}", point.value, nanos);
}

fn escape_tag(out: &mut String, value: &str) {
    for ch in value.chars() {
        match ch {
            ',' | '=' | ' ' | '\\' => {
                out.push('\\');
                out.push(ch);
            }
            '\n' | '\r' => out.push(' '),
            _ => out.push(ch),
        }
    }
}
