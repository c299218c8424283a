use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Supported programming languages, keyed by their wire id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    JavaScript,
    Go,
    Java,
    Bash,
}

impl Language {
    pub const ALL: [Language; 5] = [
        Language::Python,
        Language::JavaScript,
        Language::Go,
        Language::Java,
        Language::Bash,
    ];

    /// Resolve the `language_id` carried by a submission
    pub fn from_id(id: i64) -> Option<Self> {
        match id {
            1 => Some(Language::Python),
            2 => Some(Language::JavaScript),
            3 => Some(Language::Go),
            4 => Some(Language::Java),
            9 => Some(Language::Bash),
            _ => None,
        }
    }

    pub fn id(self) -> i64 {
        match self {
            Language::Python => 1,
            Language::JavaScript => 2,
            Language::Go => 3,
            Language::Java => 4,
            Language::Bash => 9,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::Go => "go",
            Language::Java => "java",
            Language::Bash => "bash",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "python" => Ok(Language::Python),
            "javascript" => Ok(Language::JavaScript),
            "go" => Ok(Language::Go),
            "java" => Ok(Language::Java),
            "bash" => Ok(Language::Bash),
            _ => Err(format!("Unsupported language: {}", s)),
        }
    }
}

/// Code execution request as it travels through the intake queue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionMessage {
    /// Caller-chosen id, unique per attempt; also the result store key
    #[serde(default)]
    pub id: String,
    /// Base64 encoded source code
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub language_id: i64,
    /// Routing key for push delivery
    #[serde(default)]
    pub connection_id: String,
    /// Base64 encoded standard input
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
}

impl SubmissionMessage {
    /// Build a submission from plain source text, encoding it for transport.
    pub fn from_source(
        id: impl Into<String>,
        language: Language,
        source: &str,
        connection_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            code: STANDARD.encode(source),
            language_id: language.id(),
            connection_id: connection_id.into(),
            stdin: None,
        }
    }

    pub fn with_stdin(mut self, stdin: &str) -> Self {
        self.stdin = Some(STANDARD.encode(stdin));
        self
    }

    /// Check that every required field is present and the language is known.
    pub fn validate(&self) -> Result<Language, Error> {
        if self.id.trim().is_empty() {
            return Err(Error::Validation("id is required".into()));
        }
        if self.code.is_empty() {
            return Err(Error::Validation("code is required".into()));
        }
        if self.connection_id.trim().is_empty() {
            return Err(Error::Validation("connection_id is required".into()));
        }
        Language::from_id(self.language_id).ok_or(Error::UnsupportedLanguage(self.language_id))
    }

    /// Decode the transport-encoded source code.
    pub fn decode_source(&self) -> Result<String, Error> {
        decode_field("code", &self.code)
    }

    /// Decode the transport-encoded stdin. An empty field means no input.
    pub fn decode_stdin(&self) -> Result<Option<String>, Error> {
        match self.stdin.as_deref() {
            None | Some("") => Ok(None),
            Some(encoded) => decode_field("stdin", encoded).map(Some),
        }
    }
}

fn decode_field(field: &str, encoded: &str) -> Result<String, Error> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| Error::Decode(format!("{} is not valid base64: {}", field, e)))?;
    String::from_utf8(bytes).map_err(|_| Error::Decode(format!("{} is not valid UTF-8", field)))
}

/// Execution outcome routed back to a live connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultMessage {
    pub connection_id: String,
    pub output: String,
}

/// Resource limits for local process execution
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    /// Maximum CPU time (seconds)
    pub cpu_time: u32,
    /// Maximum size of any file written, including captured output (bytes)
    pub file_size: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_time: 30,
            file_size: 10 * 1024 * 1024, // 10MB
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_ids_round_trip() {
        for language in Language::ALL {
            assert_eq!(Language::from_id(language.id()), Some(language));
            assert_eq!(language.name().parse::<Language>(), Ok(language));
        }
        assert_eq!(Language::from_id(7), None);
    }

    #[test]
    fn submission_wire_format() {
        let json = r#"{"id":"r1","code":"cHJpbnQoMSsxKQ==","language_id":1,"connection_id":"c1"}"#;
        let submission: SubmissionMessage = serde_json::from_str(json).unwrap();

        assert_eq!(submission.validate().unwrap(), Language::Python);
        assert_eq!(submission.decode_source().unwrap(), "print(1+1)");
        assert_eq!(submission.decode_stdin().unwrap(), None);

        let encoded = serde_json::to_value(&submission).unwrap();
        assert!(encoded.get("stdin").is_none());
    }

    #[test]
    fn missing_fields_fail_validation() {
        let submission: SubmissionMessage =
            serde_json::from_str(r#"{"code":"eA==","language_id":1}"#).unwrap();
        assert!(matches!(submission.validate(), Err(Error::Validation(_))));

        let submission = SubmissionMessage::from_source("r1", Language::Python, "x", "");
        assert!(matches!(submission.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn unknown_language_is_rejected() {
        let mut submission = SubmissionMessage::from_source("r1", Language::Python, "x", "c1");
        submission.language_id = 42;
        assert!(matches!(
            submission.validate(),
            Err(Error::UnsupportedLanguage(42))
        ));
    }

    #[test]
    fn stdin_decoding() {
        let submission =
            SubmissionMessage::from_source("r1", Language::Bash, "cat", "c1").with_stdin("hello");
        assert_eq!(submission.decode_stdin().unwrap().as_deref(), Some("hello"));

        let mut broken = submission.clone();
        broken.stdin = Some("not base64!".into());
        assert!(matches!(broken.decode_stdin(), Err(Error::Decode(_))));

        broken.stdin = Some(String::new());
        assert_eq!(broken.decode_stdin().unwrap(), None);
    }
}
