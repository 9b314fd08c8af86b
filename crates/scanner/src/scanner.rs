use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::ScanError;
use crate::verdict::ScanVerdict;

/// Strongly-typed scanner trait with native `async fn`.
///
/// This trait is **not** object-safe. For dynamic dispatch use
/// [`DynScanner`]; every `Scanner` implements it through a blanket impl.
pub trait Scanner: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Scan the bytes arriving on `chunks` until the sender side closes.
    ///
    /// The whole object is never buffered: chunks are forwarded (or
    /// inspected) as they arrive.
    fn scan(
        &self,
        chunks: mpsc::Receiver<Bytes>,
    ) -> impl std::future::Future<Output = Result<ScanVerdict, ScanError>> + Send;

    /// Verify the scanner is reachable and answering.
    fn ping(&self) -> impl std::future::Future<Output = Result<(), ScanError>> + Send;
}

/// Object-safe scanner trait for use behind `Arc<dyn DynScanner>`.
#[async_trait]
pub trait DynScanner: Send + Sync {
    fn name(&self) -> &str;

    async fn scan(&self, chunks: mpsc::Receiver<Bytes>) -> Result<ScanVerdict, ScanError>;

    async fn ping(&self) -> Result<(), ScanError>;
}

#[async_trait]
impl<T: Scanner + Sync> DynScanner for T {
    fn name(&self) -> &str {
        Scanner::name(self)
    }

    async fn scan(&self, chunks: mpsc::Receiver<Bytes>) -> Result<ScanVerdict, ScanError> {
        Scanner::scan(self, chunks).await
    }

    async fn ping(&self) -> Result<(), ScanError> {
        Scanner::ping(self).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    /// Flags any object containing a zero byte.
    struct ZeroScanner {
        healthy: bool,
    }

    impl Scanner for ZeroScanner {
        fn name(&self) -> &str {
            "zero"
        }

        async fn scan(&self, mut chunks: mpsc::Receiver<Bytes>) -> Result<ScanVerdict, ScanError> {
            let mut infected = false;
            while let Some(chunk) = chunks.recv().await {
                infected |= chunk.contains(&0);
            }
            Ok(if infected {
                ScanVerdict::infected("Zero")
            } else {
                ScanVerdict::clean()
            })
        }

        async fn ping(&self) -> Result<(), ScanError> {
            if self.healthy {
                Ok(())
            } else {
                Err(ScanError::Unavailable("down".into()))
            }
        }
    }

    #[tokio::test]
    async fn blanket_dyn_scanner_impl() {
        let scanner: Arc<dyn DynScanner> = Arc::new(ZeroScanner { healthy: true });
        assert_eq!(scanner.name(), "zero");
        scanner.ping().await.unwrap();

        let (tx, rx) = mpsc::channel(4);
        tx.send(Bytes::from_static(b"abc")).await.unwrap();
        tx.send(Bytes::from_static(b"d\0e")).await.unwrap();
        drop(tx);
        let verdict = scanner.scan(rx).await.unwrap();
        assert_eq!(verdict, ScanVerdict::infected("Zero"));
    }

    #[tokio::test]
    async fn dyn_scanner_ping_failure() {
        let scanner: Arc<dyn DynScanner> = Arc::new(ZeroScanner { healthy: false });
        assert!(matches!(scanner.ping().await, Err(ScanError::Unavailable(_))));
    }
}
