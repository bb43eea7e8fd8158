//! Primary source with a secondary fallback.

use super::{AdvertisementSource, FRAME_CHANNEL_BUFFER_SIZE, FrameResult, ScanError};
use async_trait::async_trait;
use log::warn;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Forwards the primary's frames; once the primary fails (at start or
/// mid-stream) the rest of the session is served by the fallback.
///
/// A primary that ends without error ends the stream. Errors from the
/// fallback itself are passed on.
pub struct FallbackSource {
    primary: Arc<dyn AdvertisementSource>,
    fallback: Arc<dyn AdvertisementSource>,
}

impl FallbackSource {
    pub fn new(
        primary: Arc<dyn AdvertisementSource>,
        fallback: Arc<dyn AdvertisementSource>,
    ) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl AdvertisementSource for FallbackSource {
    fn name(&self) -> &'static str {
        self.primary.name()
    }

    async fn watch(
        &self,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<FrameResult>, ScanError> {
        // The primary gets its own token so it can be stopped on switch-over.
        let primary_cancel = cancel.child_token();
        let primary_rx = match self.primary.watch(primary_cancel.clone()).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!(
                    "{} backend failed to start ({e}), switching to {} backend",
                    self.primary.name(),
                    self.fallback.name()
                );
                return self.fallback.watch(cancel).await;
            }
        };

        let (tx, rx) = mpsc::channel(FRAME_CHANNEL_BUFFER_SIZE);
        let primary_name = self.primary.name();
        let fallback = Arc::clone(&self.fallback);

        tokio::spawn(async move {
            let Some(error) = forward(primary_rx, &tx).await else {
                return;
            };
            primary_cancel.cancel();
            if cancel.is_cancelled() {
                return;
            }
            warn!(
                "{primary_name} backend failed ({error}), switching to {} backend",
                fallback.name()
            );

            match fallback.watch(cancel).await {
                Ok(fallback_rx) => {
                    // A failing fallback has nothing behind it.
                    if let Some(error) = forward(fallback_rx, &tx).await {
                        let _ = tx.send(Err(error)).await;
                    }
                }
                Err(error) => {
                    let _ = tx.send(Err(error)).await;
                }
            }
        });

        Ok(rx)
    }
}

/// Pass frames from `rx` to `tx` until `rx` ends or yields an error.
///
/// Returns the error, if that is what stopped forwarding. A closed `tx` ends
/// forwarding without error.
async fn forward(
    mut rx: mpsc::Receiver<FrameResult>,
    tx: &mpsc::Sender<FrameResult>,
) -> Option<ScanError> {
    while let Some(item) = rx.recv().await {
        match item {
            Ok(frame) => {
                if tx.send(Ok(frame)).await.is_err() {
                    return None;
                }
            }
            Err(error) => return Some(error),
        }
    }
    None
}
