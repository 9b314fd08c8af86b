//! A byte-pattern scanner for tests and local development.

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::ScanError;
use crate::scanner::Scanner;
use crate::verdict::ScanVerdict;

/// The EICAR anti-virus test string.
pub const EICAR: &[u8] =
    br"X5O!P%@AP[4\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*";

/// Matches fixed byte patterns, including patterns split across chunks.
#[derive(Debug, Clone)]
pub struct SignatureScanner {
    signatures: Vec<(String, Vec<u8>)>,
}

impl Default for SignatureScanner {
    fn default() -> Self {
        Self::new().with_signature("Eicar-Test-Signature", EICAR)
    }
}

impl SignatureScanner {
    /// A scanner with no signatures; everything is clean.
    pub fn new() -> Self {
        Self {
            signatures: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_signature(mut self, name: impl Into<String>, pattern: &[u8]) -> Self {
        if !pattern.is_empty() {
            self.signatures.push((name.into(), pattern.to_vec()));
        }
        self
    }

    fn longest(&self) -> usize {
        self.signatures.iter().map(|(_, p)| p.len()).max().unwrap_or(0)
    }

    fn find(&self, haystack: &[u8]) -> Option<&str> {
        self.signatures
            .iter()
            .find(|(_, pattern)| haystack.windows(pattern.len()).any(|w| w == pattern.as_slice()))
            .map(|(name, _)| name.as_str())
    }
}

impl Scanner for SignatureScanner {
    fn name(&self) -> &str {
        "signature"
    }

    async fn scan(&self, mut chunks: mpsc::Receiver<Bytes>) -> Result<ScanVerdict, ScanError> {
        let keep = self.longest().saturating_sub(1);
        let mut window: Vec<u8> = Vec::new();
        let mut found: Option<String> = None;
        // The sender is drained even after a hit so it never sees a closed sink.
        while let Some(chunk) = chunks.recv().await {
            if found.is_some() {
                continue;
            }
            window.extend_from_slice(&chunk);
            if let Some(name) = self.find(&window) {
                debug!(signature = name, "signature matched");
                found = Some(name.to_owned());
                continue;
            }
            let drop_to = window.len().saturating_sub(keep);
            window.drain(..drop_to);
        }
        Ok(found.map_or_else(ScanVerdict::clean, ScanVerdict::infected))
    }

    async fn ping(&self) -> Result<(), ScanError> {
        Ok(())
    }
}
