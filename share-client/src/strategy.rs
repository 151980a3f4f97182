//! Transfer strategy selector: tries durable storage, the peer channel, external hosts, then
//! inline relay chunks, stopping at the first success.

use std::sync::Arc;

use share_core::protocol::new_transfer_id;
use share_core::strategy::{self, is_degraded};
use share_core::{
    Attempt, OutgoingFile, PeerId, StrategyContext, TransferError, TransferMethod, TransferResult,
};
use tracing::{debug, info, warn};

use crate::storage::{DurableStorage, ExternalStorage, UploadError};
use crate::transfer::{InlineTransfer, PeerTransfer};

/// Progress callback: transfer id, method in use, fraction.
pub type StrategyProgress<'a> = &'a (dyn Fn(&str, TransferMethod, f32) + Send + Sync);

pub struct TransferStrategySelector {
    durable: Arc<dyn DurableStorage>,
    external: Vec<Box<dyn ExternalStorage>>,
}

fn rejected(provider: &str, e: UploadError) -> TransferError {
    TransferError::UploadRejected {
        provider: provider.to_string(),
        reason: e.to_string(),
    }
}

impl TransferStrategySelector {
    pub fn new(durable: Arc<dyn DurableStorage>, external: Vec<Box<dyn ExternalStorage>>) -> Self {
        Self { durable, external }
    }

    /// Deliver `file`. `target` picks the peer for the direct path; without one that step is
    /// skipped and inline chunks go to every peer. Failures only surface once every method failed.
    pub async fn send(
        &self,
        file: &OutgoingFile,
        target: Option<&PeerId>,
        peer: &dyn PeerTransfer,
        inline: &dyn InlineTransfer,
        progress: StrategyProgress<'_>,
    ) -> TransferResult {
        let peer_connected = match target {
            Some(t) => peer.is_connected(t).await,
            None => false,
        };
        let ctx = StrategyContext {
            file_size: file.size(),
            durable_configured: self.durable.is_configured(),
            durable_limit: self.durable.max_file_size(),
            peer_connected,
            external_providers: self.external.len(),
        };
        let transfer_id = new_transfer_id();
        let mut attempts = Vec::new();
        for method in strategy::plan(&ctx) {
            debug!(transfer = %transfer_id, file = %file.name, %method, "attempting transfer");
            let report = |f: f32| progress(&transfer_id, method, f);
            let outcome = match method {
                TransferMethod::DurableStorage => self
                    .durable
                    .upload(file)
                    .await
                    .map(Some)
                    .map_err(|e| rejected("durable storage", e)),
                TransferMethod::PeerChannel => match target {
                    Some(t) => peer.send_file(t, file, &transfer_id, &report).await.map(|()| None),
                    None => Err(TransferError::NegotiationFailed("no target peer".into())),
                },
                TransferMethod::ExternalStorage => self.upload_external(file).await.map(Some),
                TransferMethod::Inline => {
                    if is_degraded(method, file.size()) {
                        warn!(transfer = %transfer_id, size = file.size(), "large file sent inline through relay");
                    }
                    inline
                        .send_inline(file, target, &transfer_id, &report)
                        .await
                        .map(|()| None)
                }
            };
            match outcome {
                Ok(reference) => {
                    if reference.is_some() {
                        report(1.0);
                    }
                    info!(transfer = %transfer_id, %method, failed_attempts = attempts.len(), "file delivered");
                    return TransferResult::Delivered {
                        method,
                        reference,
                        attempts,
                    };
                }
                Err(error) => {
                    warn!(transfer = %transfer_id, %method, error = %error, "transfer method failed");
                    attempts.push(Attempt { method, error });
                }
            }
        }
        TransferResult::Failed {
            error: TransferError::AllMethodsExhausted,
            attempts,
        }
    }

    /// First provider, then the alternates. Any provider error counts the same.
    async fn upload_external(&self, file: &OutgoingFile) -> Result<String, TransferError> {
        let mut last = TransferError::UploadRejected {
            provider: "external storage".into(),
            reason: "no provider".into(),
        };
        for provider in &self.external {
            match provider.upload(file).await {
                Ok(url) => return Ok(url),
                Err(e) => {
                    debug!(provider = provider.name(), error = %e, "external upload failed");
                    last = rejected(provider.name(), e);
                }
            }
        }
        Err(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Calls {
        durable: AtomicUsize,
        peer: AtomicUsize,
        external: AtomicUsize,
        inline: AtomicUsize,
    }

    struct FakeDurable {
        configured: bool,
        ok: bool,
        calls: Arc<Calls>,
    }

    #[async_trait]
    impl DurableStorage for FakeDurable {
        fn is_configured(&self) -> bool {
            self.configured
        }
        fn max_file_size(&self) -> u64 {
            100
        }
        async fn upload(&self, _file: &OutgoingFile) -> Result<String, UploadError> {
            self.calls.durable.fetch_add(1, Ordering::SeqCst);
            if self.ok {
                Ok("https://store/f1".into())
            } else {
                Err(UploadError::Rejected("boom".into()))
            }
        }
        async fn delete(&self, _reference: &str) -> Result<bool, UploadError> {
            Ok(true)
        }
    }

    struct FakeExternal {
        ok: bool,
        calls: Arc<Calls>,
    }

    #[async_trait]
    impl ExternalStorage for FakeExternal {
        fn name(&self) -> &str {
            "fake"
        }
        async fn upload(&self, _file: &OutgoingFile) -> Result<String, UploadError> {
            self.calls.external.fetch_add(1, Ordering::SeqCst);
            if self.ok {
                Ok("https://ext/f1".into())
            } else {
                Err(UploadError::EmptyResponse)
            }
        }
    }

    struct FakePeer {
        connected: bool,
        ok: bool,
        calls: Arc<Calls>,
    }

    #[async_trait]
    impl PeerTransfer for FakePeer {
        async fn is_connected(&self, _peer: &PeerId) -> bool {
            self.connected
        }
        async fn send_file(
            &self,
            _peer: &PeerId,
            _file: &OutgoingFile,
            _transfer_id: &str,
            progress: &(dyn Fn(f32) + Send + Sync),
        ) -> Result<(), TransferError> {
            self.calls.peer.fetch_add(1, Ordering::SeqCst);
            if self.ok {
                progress(1.0);
                Ok(())
            } else {
                Err(TransferError::NegotiationFailed("channel closed".into()))
            }
        }
    }

    struct FakeInline {
        ok: bool,
        calls: Arc<Calls>,
    }

    #[async_trait]
    impl InlineTransfer for FakeInline {
        async fn send_inline(
            &self,
            _file: &OutgoingFile,
            _target: Option<&PeerId>,
            _transfer_id: &str,
            progress: &(dyn Fn(f32) + Send + Sync),
        ) -> Result<(), TransferError> {
            self.calls.inline.fetch_add(1, Ordering::SeqCst);
            if self.ok {
                progress(1.0);
                Ok(())
            } else {
                Err(TransferError::ConnectionLost)
            }
        }
    }

    struct Setup {
        durable: (bool, bool),
        peer: (bool, bool),
        external: bool,
        inline: bool,
    }

    async fn run(s: Setup, size: usize, target: Option<&PeerId>) -> (TransferResult, Arc<Calls>) {
        let calls = Arc::new(Calls::default());
        let selector = TransferStrategySelector::new(
            Arc::new(FakeDurable {
                configured: s.durable.0,
                ok: s.durable.1,
                calls: calls.clone(),
            }),
            vec![
                Box::new(FakeExternal {
                    ok: s.external,
                    calls: calls.clone(),
                }),
                Box::new(FakeExternal {
                    ok: s.external,
                    calls: calls.clone(),
                }),
            ],
        );
        let peer = FakePeer {
            connected: s.peer.0,
            ok: s.peer.1,
            calls: calls.clone(),
        };
        let inline = FakeInline {
            ok: s.inline,
            calls: calls.clone(),
        };
        let file = OutgoingFile::new("f.txt", "text/plain", vec![1; size]);
        let result = selector
            .send(&file, target, &peer, &inline, &|_, _, _| {})
            .await;
        (result, calls)
    }

    fn count(c: &AtomicUsize) -> usize {
        c.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn durable_success_short_circuits() {
        let target = PeerId::from("p2");
        let (result, calls) = run(
            Setup {
                durable: (true, true),
                peer: (true, true),
                external: true,
                inline: true,
            },
            10,
            Some(&target),
        )
        .await;
        assert_eq!(result.method(), Some(TransferMethod::DurableStorage));
        assert_eq!(result.reference(), Some("https://store/f1"));
        assert!(result.attempts().is_empty());
        assert_eq!(count(&calls.peer) + count(&calls.external) + count(&calls.inline), 0);
    }

    #[tokio::test]
    async fn falls_through_to_inline() {
        let (result, calls) = run(
            Setup {
                durable: (false, false),
                peer: (false, false),
                external: false,
                inline: true,
            },
            10,
            Some(&PeerId::from("p2")),
        )
        .await;
        assert_eq!(result.method(), Some(TransferMethod::Inline));
        assert_eq!(result.reference(), None);
        let tried: Vec<_> = result.attempts().iter().map(|a| a.method).collect();
        assert_eq!(tried, vec![TransferMethod::ExternalStorage]);
        assert_eq!(count(&calls.external), 2, "both providers tried");
        assert_eq!(count(&calls.durable) + count(&calls.peer), 0);
    }

    #[tokio::test]
    async fn oversized_file_skips_durable_and_uses_peer() {
        let target = PeerId::from("p2");
        let (result, calls) = run(
            Setup {
                durable: (true, true),
                peer: (true, true),
                external: true,
                inline: true,
            },
            100,
            Some(&target),
        )
        .await;
        assert_eq!(result.method(), Some(TransferMethod::PeerChannel));
        assert_eq!(count(&calls.durable), 0);
    }

    #[tokio::test]
    async fn peer_failure_falls_back_and_is_recorded() {
        let target = PeerId::from("p2");
        let (result, _) = run(
            Setup {
                durable: (true, false),
                peer: (true, false),
                external: true,
                inline: true,
            },
            10,
            Some(&target),
        )
        .await;
        assert_eq!(result.method(), Some(TransferMethod::ExternalStorage));
        let tried: Vec<_> = result.attempts().iter().map(|a| a.method).collect();
        assert_eq!(
            tried,
            vec![TransferMethod::DurableStorage, TransferMethod::PeerChannel]
        );
        assert!(matches!(
            result.attempts()[0].error,
            TransferError::UploadRejected { .. }
        ));
    }

    #[tokio::test]
    async fn without_target_peer_is_never_consulted() {
        let (result, calls) = run(
            Setup {
                durable: (false, false),
                peer: (true, true),
                external: false,
                inline: true,
            },
            10,
            None,
        )
        .await;
        assert_eq!(result.method(), Some(TransferMethod::Inline));
        assert_eq!(count(&calls.peer), 0);
    }

    #[tokio::test]
    async fn only_exhaustion_fails() {
        let (result, calls) = run(
            Setup {
                durable: (true, false),
                peer: (true, false),
                external: false,
                inline: false,
            },
            10,
            Some(&PeerId::from("p2")),
        )
        .await;
        assert_eq!(result.error(), Some(&TransferError::AllMethodsExhausted));
        assert_eq!(result.attempts().len(), 4);
        assert_eq!(count(&calls.inline), 1);
    }
}
