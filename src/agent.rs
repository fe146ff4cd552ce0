use anyhow::Result;
use reqwest::{
    blocking::{multipart, Client, Response},
    StatusCode,
};
use serde::Deserialize;
use serde_json::Value;
use serde_with::{serde_as, DefaultOnNull};
use thiserror::Error;

use crate::{
    config::AgentConfig,
    model::{TorrentStatus, COMPLETE_PERCENT},
};

const TORRENT_MIME: &str = "application/x-bittorrent";

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),
    #[error("response parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type AgentResult<T> = std::result::Result<T, AgentError>;

/// The two operations the download agent exposes.
pub trait Agent: Send + Sync {
    fn start_download(&self, file_name: &str, bytes: Vec<u8>) -> AgentResult<()>;
    fn download_progress(&self, name: &str) -> AgentResult<TorrentStatus>;
}

pub struct AgentClient {
    http: Client,
    base_url: String,
}

impl AgentClient {
    pub fn new(config: AgentConfig) -> Result<Self> {
        let base_url = config.base_url();
        let AgentConfig {
            timeout,
            user_agent,
            ..
        } = config;
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()?;
        Ok(Self { http, base_url })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Agent for AgentClient {
    fn start_download(&self, file_name: &str, bytes: Vec<u8>) -> AgentResult<()> {
        let part = multipart::Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str(TORRENT_MIME)?;
        let form = multipart::Form::new().part("torrent", part);
        let response = self
            .http
            .post(self.endpoint("/start-download"))
            .multipart(form)
            .send()?;
        let body: Value = read_json(response)?;
        log::debug!("agent accepted {file_name}: {body}");
        Ok(())
    }

    fn download_progress(&self, name: &str) -> AgentResult<TorrentStatus> {
        let response = self
            .http
            .get(self.endpoint("/download-progress"))
            .query(&[("torrent_name", name)])
            .send()?;
        let wire: ProgressWire = read_json(response)?;
        Ok(TorrentStatus::from(wire))
    }
}

fn read_json<T>(response: Response) -> AgentResult<T>
where
    T: for<'de> Deserialize<'de>,
{
    let status = response.status();
    if !status.is_success() {
        return Err(AgentError::HttpStatus(status));
    }
    let bytes = response.bytes()?;
    serde_json::from_slice(&bytes).map_err(AgentError::from)
}

#[serde_as]
#[derive(Debug, Deserialize)]
struct ProgressWire {
    name: String,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    progress: f64,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default, rename = "downloadSpeed", alias = "download_speed")]
    download_speed: f64,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    size: f64,
}

impl From<ProgressWire> for TorrentStatus {
    fn from(wire: ProgressWire) -> Self {
        // The agent rounds to two decimals; only a literal 100 counts as done.
        let progress = if wire.progress.is_finite() {
            wire.progress.floor().clamp(0.0, f64::from(COMPLETE_PERCENT)) as u8
        } else {
            0
        };
        TorrentStatus {
            name: wire.name,
            progress,
            download_speed: non_negative(wire.download_speed),
            size: non_negative(wire.size).round() as u64,
        }
    }
}

fn non_negative(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(body: &str) -> AgentResult<TorrentStatus> {
        let wire: ProgressWire = serde_json::from_str(body)?;
        Ok(TorrentStatus::from(wire))
    }

    #[test]
    fn parses_integer_progress() {
        let status = parse(
            r#"{"name":"x.torrent","progress":40,"downloadSpeed":1024,"size":10240}"#,
        )
        .unwrap();
        assert_eq!(
            status,
            TorrentStatus {
                name: "x.torrent".to_string(),
                progress: 40,
                download_speed: 1024.0,
                size: 10240,
            }
        );
    }

    #[test]
    fn fractional_progress_is_floored() {
        let status = parse(
            r#"{"name":"x.torrent","progress":99.99,"downloadSpeed":12.5,"size":512.4}"#,
        )
        .unwrap();
        assert_eq!(status.progress, 99);
        assert!(!status.is_complete());
        assert_eq!(status.size, 512);
        assert_eq!(status.download_speed, 12.5);
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let status = parse(
            r#"{"name":"x.torrent","progress":140,"downloadSpeed":-3,"size":null}"#,
        )
        .unwrap();
        assert_eq!(status.progress, 100);
        assert_eq!(status.download_speed, 0.0);
        assert_eq!(status.size, 0);
    }

    #[test]
    fn missing_name_is_a_parse_error() {
        let err = parse(r#"{"progress":10}"#).unwrap_err();
        assert!(matches!(err, AgentError::Parse(_)));
    }

    #[test]
    fn endpoints_join_base_url() {
        let config = AgentConfig {
            url: Some("http://agent.local:9000".to_string()),
            ..AgentConfig::default()
        };
        let client = AgentClient::new(config).unwrap();
        assert_eq!(
            client.endpoint("/download-progress"),
            "http://agent.local:9000/download-progress"
        );
    }
}
