use bytes::Bytes;
use crate::error::{ErrorCode, FeedError};

/// First line sent by a viewer or writer on a new connection
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// `STREAM <topic>[,<topic>...]`
    Stream(Vec<String>),
    /// `FETCH <topic>`
    Fetch(String),
    /// `PUBLISH <topic> <json>`
    Publish { topic: String, payload: Bytes },
    /// `REFRESH`
    Refresh,
}

impl Request {
    pub fn parse(line: &str) -> Result<Self, FeedError> {
        let line = line.trim();
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();

        match command.to_ascii_uppercase().as_str() {
            "STREAM" => {
                let topics: Vec<String> = rest
                    .split(',')
                    .map(str::trim)
                    .filter(|topic| !topic.is_empty())
                    .map(str::to_string)
                    .collect();
                if topics.is_empty() {
                    return Err(malformed("STREAM requires at least one topic"));
                }
                Ok(Self::Stream(topics))
            }
            "FETCH" => {
                if rest.is_empty() || rest.contains(' ') {
                    return Err(malformed("FETCH requires exactly one topic"));
                }
                Ok(Self::Fetch(rest.to_string()))
            }
            "PUBLISH" => {
                let (topic, payload) = rest
                    .split_once(' ')
                    .ok_or_else(|| malformed("PUBLISH requires a topic and a payload"))?;
                let payload = payload.trim();
                serde_json::from_str::<serde::de::IgnoredAny>(payload)
                    .map_err(|e| FeedError::new(ErrorCode::MalformedMessage, format!("Payload is not JSON: {}", e)))?;
                Ok(Self::Publish {
                    topic: topic.to_string(),
                    payload: Bytes::copy_from_slice(payload.as_bytes()),
                })
            }
            "REFRESH" => {
                if !rest.is_empty() {
                    return Err(malformed("REFRESH takes no arguments"));
                }
                Ok(Self::Refresh)
            }
            _ => Err(malformed(&format!("Unknown command: {}", command))),
        }
    }
}

fn malformed(message: &str) -> FeedError {
    FeedError::new(ErrorCode::MalformedMessage, message)
}
