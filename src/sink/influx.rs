use std::io::Write;

use anyhow::{Context, Result};

use crate::config::SinkConfig;

use super::line_protocol::encode_points;
use super::{Batch, PointWriter, WriteError};

/// Longest response body kept for an error message.
const MAX_ERROR_BODY: usize = 512;

/// InfluxDB 1.x HTTP writer.
///
/// Each batch becomes one `POST /write?db=..&rp=..&precision=ns` request
/// carrying line protocol, optionally gzip-compressed. There is no
/// queueing and no retry: a failed request loses its batch.
pub struct InfluxWriter {
    cfg: SinkConfig,
    client: reqwest::Client,
    write_url: String,
    ping_url: String,
}

impl InfluxWriter {
    /// Creates a new writer with the given configuration.
    pub fn new(cfg: SinkConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .user_agent(concat!("snoopd/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building HTTP client")?;

        let base = cfg.address.trim_end_matches('/');
        let write_url = format!("{base}/write");
        let ping_url = format!("{base}/ping");

        Ok(Self {
            cfg,
            client,
            write_url,
            ping_url,
        })
    }

    /// Checks the server answers `/ping`.
    pub async fn ping(&self) -> Result<()> {
        let mut request = self.client.get(&self.ping_url);
        if !self.cfg.username.is_empty() {
            request = request.basic_auth(&self.cfg.username, Some(&self.cfg.password));
        }

        let resp = request.send().await.context("sending ping request")?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("ping returned unexpected status: {status}");
        }

        Ok(())
    }

    /// Returns the writer configuration.
    pub fn config(&self) -> &SinkConfig {
        &self.cfg
    }
}

impl PointWriter for InfluxWriter {
    fn name(&self) -> &str {
        "influxdb"
    }

    async fn write(&self, batch: &Batch) -> Result<(), WriteError> {
        if batch.is_empty() {
            return Ok(());
        }

        let body = encode_points(batch.points());
        let raw_len = body.len();
        let payload = compress(body.into_bytes(), &self.cfg.compression)
            .map_err(WriteError::Encode)?;

        let mut request = self
            .client
            .post(&self.write_url)
            .query(&[
                ("db", batch.database()),
                ("rp", batch.retention_policy()),
                ("precision", "ns"),
            ])
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(payload);

        if let Some(encoding) = content_encoding(&self.cfg.compression) {
            request = request.header("Content-Encoding", encoding);
        }

        if !self.cfg.username.is_empty() {
            request = request.basic_auth(&self.cfg.username, Some(&self.cfg.password));
        }

        for (k, v) in &self.cfg.headers {
            request = request.header(k.as_str(), v.as_str());
        }

        let resp = request.send().await.map_err(WriteError::Request)?;

        let status = resp.status();
        // Drain body for connection reuse; keep it for the error message.
        let body = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(WriteError::Status {
                status,
                body: truncate_body(body),
            });
        }

        tracing::trace!(
            points = batch.len(),
            bytes = raw_len,
            database = batch.database(),
            "wrote batch to InfluxDB",
        );

        Ok(())
    }
}

fn truncate_body(mut body: String) -> String {
    let trimmed_len = body.trim_end().len();
    body.truncate(trimmed_len);
    if body.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    body
}

// --- Compression ---

/// Compresses data using the specified algorithm.
fn compress(data: Vec<u8>, algorithm: &str) -> std::io::Result<Vec<u8>> {
    match algorithm {
        "none" | "" => Ok(data),
        "gzip" => compress_gzip(&data),
        other => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("unsupported compression: {other}"),
        )),
    }
}

/// Returns the Content-Encoding header value for the algorithm.
fn content_encoding(algorithm: &str) -> Option<&'static str> {
    match algorithm {
        "gzip" => Some("gzip"),
        _ => None,
    }
}

fn compress_gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compress_none() {
        let data = b"kprobe v=1i 0\n".to_vec();
        let result = compress(data.clone(), "none").expect("compress none");
        assert_eq!(result, data);
    }

    #[test]
    fn test_compress_gzip_roundtrip() {
        let data = b"kprobe,probe=execve argv=\"/bin/ls\" 0\n".to_vec();
        let compressed = compress(data.clone(), "gzip").expect("gzip compress");
        assert_ne!(compressed, data);

        use flate2::read::GzDecoder;
        use std::io::Read;
        let mut decoder = GzDecoder::new(compressed.as_slice());
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .expect("gzip decompress");
        assert_eq!(decompressed, data);
    }

    #[test]
    fn test_compress_unknown_algorithm() {
        let err = compress(Vec::new(), "brotli").expect_err("unsupported");
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_content_encoding() {
        assert_eq!(content_encoding("gzip"), Some("gzip"));
        assert_eq!(content_encoding("none"), None);
        assert_eq!(content_encoding(""), None);
    }

    #[test]
    fn test_urls_strip_trailing_slash() {
        let writer = InfluxWriter::new(SinkConfig {
            address: "http://influx:8086/".to_string(),
            ..Default::default()
        })
        .expect("writer");
        assert_eq!(writer.write_url, "http://influx:8086/write");
        assert_eq!(writer.ping_url, "http://influx:8086/ping");
        assert_eq!(writer.name(), "influxdb");
    }

    #[test]
    fn test_truncate_body() {
        assert_eq!(truncate_body("bad field\n".to_string()), "bad field");
        let long = "é".repeat(MAX_ERROR_BODY);
        let out = truncate_body(long);
        assert!(out.len() <= MAX_ERROR_BODY);
    }
}
