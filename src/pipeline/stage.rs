//! Generic stage worker.
//!
//! A stage owns one input channel, one output channel, and a cleanup
//! sideband. Each input is handled inside its own task so that a panicking
//! handler produces a cleanup message instead of tearing the worker down.
//! Cancellation stops the loop at the next receive; the in-flight handler
//! is awaited to completion.

use anyhow::anyhow;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Capacity of a stage's output channel. Small on purpose: a slow stage
/// backpressures its producer instead of queueing unboundedly.
const OUTPUT_CAPACITY: usize = 1;

/// A request that left its stage with an error, on the way to cleanup.
pub struct CleanupMessage<T> {
    pub request: T,
    pub error: Arc<anyhow::Error>,
}

impl<T> CleanupMessage<T> {
    pub fn new(request: T, error: anyhow::Error) -> Self {
        Self {
            request,
            error: Arc::new(error),
        }
    }
}

impl<T: Clone> Clone for CleanupMessage<T> {
    fn clone(&self) -> Self {
        Self {
            request: self.request.clone(),
            error: self.error.clone(),
        }
    }
}

/// Cancellation-aware writer handed to handlers. A cancelled write drops
/// the value silently; the stage is shutting down anyway.
pub struct OutputWriter<V> {
    tx: mpsc::Sender<V>,
    token: CancellationToken,
}

impl<V: Send> OutputWriter<V> {
    pub fn new(tx: mpsc::Sender<V>, token: CancellationToken) -> Self {
        Self { tx, token }
    }

    pub async fn write(&self, value: V) {
        tokio::select! {
            _ = self.token.cancelled() => {}
            _ = self.tx.send(value) => {}
        }
    }
}

/// One unit of pipeline work: consumes an input, writes zero or more
/// outputs, and signals failure by returning an error.
#[async_trait]
pub trait Handler<T, V>: Send + Sync + 'static {
    /// Human-readable name for the logs.
    fn name(&self) -> String;

    async fn handle(&self, request: &mut T, out: &OutputWriter<V>) -> anyhow::Result<()>;
}

/// A stage wires a handler between channels and runs it on one worker.
pub struct Stage<T, V> {
    handler: Arc<dyn Handler<T, V>>,
    input: mpsc::Receiver<T>,
    output_tx: mpsc::Sender<V>,
    output_rx: Option<mpsc::Receiver<V>>,
    cleanup: mpsc::Sender<CleanupMessage<T>>,
    token: CancellationToken,
}

impl<T, V> Stage<T, V>
where
    T: Clone + Send + 'static,
    V: Send + 'static,
{
    pub fn new(
        handler: Arc<dyn Handler<T, V>>,
        input: mpsc::Receiver<T>,
        cleanup: mpsc::Sender<CleanupMessage<T>>,
        token: CancellationToken,
    ) -> Self {
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CAPACITY);
        Self {
            handler,
            input,
            output_tx,
            output_rx: Some(output_rx),
            cleanup,
            token,
        }
    }

    /// The receiving end of this stage's output, feeding the next stage.
    /// Can be taken once, before [`Stage::spawn`].
    pub fn take_output(&mut self) -> mpsc::Receiver<V> {
        self.output_rx.take().expect("stage output already taken")
    }

    /// A sender into this stage's output channel, for workers that inject
    /// values out of band (the external-result collector).
    pub fn output_sender(&self) -> mpsc::Sender<V> {
        self.output_tx.clone()
    }

    /// Start the dispatch worker.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        tracing::info!(handler = %self.handler.name(), "stage started");

        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                received = self.input.recv() => match received {
                    Some(request) => self.dispatch(request).await,
                    None => break,
                },
            }
        }

        tracing::info!(handler = %self.handler.name(), "stage stopped");
    }

    async fn dispatch(&self, request: T) {
        // Snapshot for the panic path: a panicking handler takes the owned
        // request down with it.
        let snapshot = request.clone();

        let handler = self.handler.clone();
        let writer = OutputWriter::new(self.output_tx.clone(), self.token.clone());
        let work = tokio::spawn(async move {
            let mut request = request;
            let outcome = handler.handle(&mut request, &writer).await;
            (request, outcome)
        });

        match work.await {
            Ok((_, Ok(()))) => {}
            Ok((request, Err(error))) => {
                let _ = self
                    .cleanup
                    .send(CleanupMessage::new(request, error))
                    .await;
            }
            Err(join_error) => {
                let error = if join_error.is_panic() {
                    let payload = join_error.into_panic();
                    let message = payload
                        .downcast_ref::<&str>()
                        .map(|s| (*s).to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "handler panicked".to_string());
                    anyhow!("panic during handler execution: {message}")
                } else {
                    anyhow!("handler task was cancelled")
                };

                tracing::error!(handler = %self.handler.name(), error = %error,
                    "caught handler failure");
                let _ = self.cleanup.send(CleanupMessage::new(snapshot, error)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Doubler;

    #[async_trait]
    impl Handler<i32, i32> for Doubler {
        fn name(&self) -> String {
            "doubler".into()
        }

        async fn handle(&self, request: &mut i32, out: &OutputWriter<i32>) -> anyhow::Result<()> {
            out.write(*request * 2).await;
            Ok(())
        }
    }

    struct Exploder;

    #[async_trait]
    impl Handler<i32, i32> for Exploder {
        fn name(&self) -> String {
            "exploder".into()
        }

        async fn handle(&self, request: &mut i32, _out: &OutputWriter<i32>) -> anyhow::Result<()> {
            match *request {
                0 => panic!("boom on zero"),
                n if n < 0 => anyhow::bail!("negative input"),
                _ => Ok(()),
            }
        }
    }

    fn wiring<T: Clone + Send + 'static>() -> (
        mpsc::Sender<T>,
        mpsc::Receiver<T>,
        mpsc::Sender<CleanupMessage<T>>,
        mpsc::Receiver<CleanupMessage<T>>,
        CancellationToken,
    ) {
        let (input_tx, input_rx) = mpsc::channel(4);
        let (cleanup_tx, cleanup_rx) = mpsc::channel(4);
        (input_tx, input_rx, cleanup_tx, cleanup_rx, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_successful_handling_reaches_output() {
        let (input_tx, input_rx, cleanup_tx, _cleanup_rx, token) = wiring();
        let mut stage = Stage::<i32, i32>::new(Arc::new(Doubler), input_rx, cleanup_tx, token.clone());
        let mut output = stage.take_output();
        stage.spawn();

        input_tx.send(21).await.unwrap();
        assert_eq!(output.recv().await, Some(42));
        token.cancel();
    }

    #[tokio::test]
    async fn test_handler_error_goes_to_cleanup() {
        let (input_tx, input_rx, cleanup_tx, mut cleanup_rx, token) = wiring();
        let stage = Stage::<i32, i32>::new(Arc::new(Exploder), input_rx, cleanup_tx, token.clone());
        stage.spawn();

        input_tx.send(-5).await.unwrap();
        let message = cleanup_rx.recv().await.unwrap();
        assert_eq!(message.request, -5);
        assert!(message.error.to_string().contains("negative input"));
        token.cancel();
    }

    #[tokio::test]
    async fn test_panic_is_caught_and_stage_survives() {
        let (input_tx, input_rx, cleanup_tx, mut cleanup_rx, token) = wiring();
        let stage = Stage::<i32, i32>::new(Arc::new(Exploder), input_rx, cleanup_tx, token.clone());
        stage.spawn();

        input_tx.send(0).await.unwrap();
        let message = cleanup_rx.recv().await.unwrap();
        assert_eq!(message.request, 0);
        assert!(message.error.to_string().contains("boom on zero"));

        // The worker is still alive and keeps processing.
        input_tx.send(7).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cleanup_rx.try_recv().is_err());
        token.cancel();
    }

    #[tokio::test]
    async fn test_cancellation_stops_the_loop() {
        let (_input_tx, input_rx, cleanup_tx, _cleanup_rx, token) = wiring::<i32>();
        let stage = Stage::<i32, i32>::new(Arc::new(Doubler), input_rx, cleanup_tx, token.clone());
        let worker = stage.spawn();

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .expect("worker did not stop on cancellation")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_write_drops_value_without_blocking() {
        let (tx, _rx) = mpsc::channel(1);
        let token = CancellationToken::new();
        let writer = OutputWriter::new(tx, token.clone());

        // Fill the channel so a second send would block forever.
        writer.write(1).await;
        token.cancel();
        tokio::time::timeout(Duration::from_millis(100), writer.write(2))
            .await
            .expect("cancelled write should return promptly");
    }
}
