//! Listener and sender in one process.

use crate::{
    benchmark::BenchmarkParameters, error::HarnessError, listener::run_listener,
    metrics::RateReport, sender::run_sender, transport::NamingContext,
};
use tokio::sync::oneshot;

/// Reports from both sides of a loopback run
#[derive(Debug, Clone)]
pub struct LoopbackReport {
    pub received: RateReport,
    pub sent: RateReport,
}

/// Run both drivers against one naming context.
///
/// The sender waits for the listener's READY signal so no message is produced
/// before a consumer is registered. A failed sender abandons the listener,
/// which would otherwise wait for messages that never come.
pub async fn run_loopback(
    params: &BenchmarkParameters,
    naming: &dyn NamingContext,
) -> Result<LoopbackReport, HarnessError> {
    let (ready_tx, ready_rx) = oneshot::channel();
    let listener = run_listener(params, naming, Some(ready_tx));
    let sender = async {
        // A dropped signal means the listener failed before READY.
        if ready_rx.await.is_err() {
            return None;
        }
        Some(run_sender(params, naming).await)
    };
    tokio::pin!(listener);
    tokio::pin!(sender);

    tokio::select! {
        received = &mut listener => {
            let received = received?;
            let sent = sender.await.ok_or_else(|| {
                HarnessError::Interrupted("sender never started".to_string())
            })??;
            Ok(LoopbackReport { received, sent })
        }
        sent = &mut sender => match sent {
            Some(Ok(sent)) => {
                let received = listener.await?;
                Ok(LoopbackReport { received, sent })
            }
            Some(Err(e)) => Err(e),
            None => match listener.await {
                Err(e) => Err(e),
                Ok(_) => Err(HarnessError::Interrupted(
                    "listener completed without reporting ready".to_string(),
                )),
            },
        },
    }
}
