use serde::{Deserialize, Serialize};

use crate::error::ScanError;

/// Outcome of a completed scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanVerdict {
    pub infected: bool,
    /// Signature name reported for an infected object.
    pub signature: Option<String>,
}

impl ScanVerdict {
    pub fn clean() -> Self {
        Self {
            infected: false,
            signature: None,
        }
    }

    pub fn infected(signature: impl Into<String>) -> Self {
        Self {
            infected: true,
            signature: Some(signature.into()),
        }
    }

    /// Parse a clamd scan reply: `stream: OK`, `stream: <sig> FOUND` or
    /// `... ERROR`.
    pub fn parse_clamd_reply(reply: &str) -> Result<Self, ScanError> {
        let reply = reply.trim_end_matches(['\0', '\n', '\r']).trim();
        if reply.ends_with("ERROR") {
            return Err(ScanError::Protocol(reply.to_owned()));
        }
        let body = reply
            .rsplit_once("stream: ")
            .map_or(reply, |(_, rest)| rest)
            .trim();
        if body == "OK" {
            return Ok(Self::clean());
        }
        match body.strip_suffix(" FOUND") {
            Some(signature) if !signature.trim().is_empty() => Ok(Self::infected(signature.trim())),
            _ => Err(ScanError::Protocol(format!("unexpected reply: {reply}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_reply() {
        assert_eq!(
            ScanVerdict::parse_clamd_reply("stream: OK\0").unwrap(),
            ScanVerdict::clean()
        );
    }

    #[test]
    fn found_reply() {
        let verdict = ScanVerdict::parse_clamd_reply("stream: Win.Test.EICAR_HDB-1 FOUND\n").unwrap();
        assert!(verdict.infected);
        assert_eq!(verdict.signature.as_deref(), Some("Win.Test.EICAR_HDB-1"));
    }

    #[test]
    fn session_prefixed_reply() {
        let verdict = ScanVerdict::parse_clamd_reply("1: stream: Eicar-Signature FOUND").unwrap();
        assert_eq!(verdict.signature.as_deref(), Some("Eicar-Signature"));
    }

    #[test]
    fn error_and_garbage_replies() {
        assert!(matches!(
            ScanVerdict::parse_clamd_reply("INSTREAM size limit exceeded. ERROR"),
            Err(ScanError::Protocol(_))
        ));
        assert!(ScanVerdict::parse_clamd_reply("").is_err());
        assert!(ScanVerdict::parse_clamd_reply("stream:  FOUND").is_err());
    }
}
