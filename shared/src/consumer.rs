//! Shared consumer loop: stream inbound messages, dispatch by topic,
//! commit the offset only after the handler returns success or a handled
//! no-op. A handler error leaves the offset uncommitted so the bus
//! redelivers.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::Message;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[async_trait]
pub trait EventDispatch: Send + Sync {
    async fn dispatch(&self, topic: &str, payload: &[u8]) -> anyhow::Result<()>;
}

pub async fn run_consumer(
    consumer: StreamConsumer,
    dispatcher: Arc<dyn EventDispatch>,
    shutdown: CancellationToken,
) {
    let mut stream = consumer.stream();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("consumer stopped");
                return;
            }
            message = stream.next() => {
                let Some(message) = message else {
                    info!("consumer stream ended");
                    return;
                };

                match message {
                    Ok(m) => {
                        let payload = m.payload().unwrap_or_default();
                        match dispatcher.dispatch(m.topic(), payload).await {
                            Ok(()) => {
                                if let Err(e) = consumer.commit_message(&m, CommitMode::Async) {
                                    error!(error = %e, "failed to commit offset");
                                }
                            }
                            Err(e) => {
                                // Not committed: the bus will redeliver.
                                error!(
                                    topic = m.topic(),
                                    offset = m.offset(),
                                    error = %e,
                                    "failed to handle message"
                                );
                            }
                        }
                    }
                    Err(e) => error!(error = %e, "error receiving message"),
                }
            }
        }
    }
}
