use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use slog::{debug, error, info, o, warn, Logger};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::broker::{ConsumerGroup, ConsumerSettings};
use crate::config::BrokerConfig;
use crate::handler::{MessageHandler, ReadinessGate, SessionHandler};
use crate::kafka::KafkaConsumerGroup;
use crate::{Error, Result};

const ERROR_DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Consumer-group member running the application handler over every claimed record.
///
/// `read` joins the group in a background task and rejoins after every rebalance. It
/// returns once the context is cancelled, a shutdown signal arrives, or the join loop
/// fails, and closes the group client on the way out.
pub struct Subscriber {
    group: Arc<dyn ConsumerGroup>,
    topics: Vec<String>,
    group_name: String,
    max_processing_time: Duration,
    errors: Option<JoinHandle<()>>,
    logger: Logger,
}

impl Subscriber {
    /// Fails with [`Error::NoRuntime`] outside a tokio runtime.
    pub fn new(cfg: &BrokerConfig, logger: Logger) -> Result<Self> {
        cfg.validate()?;
        if cfg.topics.is_empty() {
            return Err(Error::InvalidConfig("topics is empty".into()));
        }
        if cfg.group.is_empty() {
            return Err(Error::InvalidConfig("group is empty".into()));
        }
        tokio::runtime::Handle::try_current()?;
        let logger = logger.new(o!("group" => cfg.group.clone()));
        let group = KafkaConsumerGroup::new(&ConsumerSettings::from_config(cfg), logger.clone()).map_err(|e| {
            error!(logger, "init consumer group failed"; "error" => %e);
            e
        })?;
        Ok(Self::with_group(group, cfg, logger))
    }

    /// Must be called inside a tokio runtime when consumer errors are returned, the
    /// error drain starts here.
    pub fn with_group(group: impl ConsumerGroup + 'static, cfg: &BrokerConfig, logger: Logger) -> Self {
        let group: Arc<dyn ConsumerGroup> = Arc::new(group);
        let errors = group.take_errors().map(|rx| tokio::spawn(drain_errors(rx, logger.clone())));
        Self {
            group,
            topics: cfg.topics.clone(),
            group_name: cfg.group.clone(),
            max_processing_time: cfg.consumer.max_processing_time(),
            errors,
            logger,
        }
    }

    /// Consume until SIGINT / SIGTERM
    pub async fn read<H: MessageHandler>(self, handler: H) -> Result<()> {
        self.read_with_context(handler, CancellationToken::new()).await
    }

    /// Consume until `token` is cancelled or SIGINT / SIGTERM
    pub async fn read_with_context<H: MessageHandler>(self, handler: H, token: CancellationToken) -> Result<()> {
        self.read_until(handler, token, shutdown_signal()).await
    }

    /// Consume until `token` is cancelled or `shutdown` resolves. `shutdown` is first
    /// polled once the group session is ready, it pauses every partition before the
    /// session is cancelled. `token` itself is never cancelled here.
    pub async fn read_until<H, S>(self, handler: H, token: CancellationToken, shutdown: S) -> Result<()>
    where
        H: MessageHandler,
        S: Future<Output = ()>,
    {
        let token = token.child_token();
        let gate = ReadinessGate::new();
        let mut background = tokio::spawn(consume_loop(
            self.group.clone(),
            self.topics.clone(),
            Arc::new(handler),
            gate.clone(),
            token.clone(),
            self.group_name.clone(),
            self.max_processing_time,
            self.logger.clone(),
        ));

        let mut exited = None;
        tokio::select! {
            _ = gate.wait() => {}
            res = &mut background => exited = Some(flatten(res)),
        }

        if exited.is_none() {
            debug!(self.logger, "kafka consumer up and running");
            tokio::pin!(shutdown);
            tokio::select! {
                _ = token.cancelled() => {
                    info!(self.logger, "terminating: context cancelled");
                }
                _ = &mut shutdown => {
                    info!(self.logger, "terminating: via signal");
                    self.group.pause_all();
                }
                res = &mut background => exited = Some(flatten(res)),
            }
        }

        token.cancel();
        let result = match exited {
            Some(res) => res,
            None => flatten(background.await),
        };
        self.close().await;
        result
    }

    /// Close the group client. Errors are logged.
    pub async fn close(self) {
        if let Err(e) = self.group.close().await {
            error!(self.logger, "error closing client"; "error" => %e);
        }
        if let Some(mut errors) = self.errors {
            if tokio::time::timeout(ERROR_DRAIN_TIMEOUT, &mut errors).await.is_err() {
                errors.abort();
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn consume_loop(
    group: Arc<dyn ConsumerGroup>,
    topics: Vec<String>,
    callback: Arc<dyn MessageHandler>,
    gate: ReadinessGate,
    token: CancellationToken,
    group_name: String,
    max_processing_time: Duration,
    logger: Logger,
) -> Result<()> {
    let mut gate = gate;
    loop {
        let handler =
            SessionHandler::new(callback.clone(), group_name.clone(), gate, max_processing_time, logger.clone());
        if let Err(e) = group.consume(&token, &topics, &handler).await {
            error!(logger, "kafka consume topics failed"; "error" => %e);
            return Err(e);
        }
        if token.is_cancelled() {
            info!(logger, "consume loop stopped, context cancelled");
            return Ok(());
        }
        gate = ReadinessGate::new();
    }
}

#[inline]
fn flatten(res: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    res.map_err(Error::from).and_then(|r| r)
}

async fn drain_errors(mut errors: mpsc::UnboundedReceiver<Error>, logger: Logger) {
    while let Some(e) = errors.recv().await {
        if e.is_temporary() {
            warn!(logger, "consume error"; "error" => %e);
        } else {
            error!(logger, "consume error"; "error" => %e);
        }
    }
}

/// Resolves on SIGINT or SIGTERM
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        if let (Ok(mut interrupt), Ok(mut terminate)) =
            (signal(SignalKind::interrupt()), signal(SignalKind::terminate()))
        {
            tokio::select! {
                _ = interrupt.recv() => {}
                _ = terminate.recv() => {}
            }
            return;
        }
    }
    if tokio::signal::ctrl_c().await.is_err() {
        futures::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use anyhow::anyhow;
    use bytes::Bytes;

    use super::*;
    use crate::handler::MessageContext;
    use crate::sasl::ScramAuth;
    use crate::scram::{HashAlgorithm, ScramError};
    use crate::testing::{discard_logger, record, wait_until, CaptureDrain, MockConsumerGroup};

    fn broker_config() -> BrokerConfig {
        let mut cfg = BrokerConfig::new(["localhost:9094"]);
        cfg.topics = vec!["test_topic".into()];
        cfg.group = "test".into();
        cfg
    }

    fn counting_handler(calls: Arc<AtomicUsize>) -> impl MessageHandler {
        move |_: MessageContext, _: String, _: Bytes| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, anyhow::Error>(()) }
        }
    }

    fn three_records() -> Vec<crate::broker::Record> {
        (0..3).map(|o| record("test_topic", 0, o, r#"{"name":"Peter","age":20}"#)).collect()
    }

    #[test]
    fn new_validates_config() {
        let mut cfg = broker_config();
        cfg.topics.clear();
        assert!(matches!(Subscriber::new(&cfg, discard_logger()), Err(Error::InvalidConfig(_))));

        let mut cfg = broker_config();
        cfg.group.clear();
        assert!(matches!(Subscriber::new(&cfg, discard_logger()), Err(Error::InvalidConfig(_))));

        let cfg = BrokerConfig { addrs: Vec::new(), ..broker_config() };
        assert!(matches!(Subscriber::new(&cfg, discard_logger()), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn new_outside_runtime_fails() {
        assert!(matches!(Subscriber::new(&broker_config(), discard_logger()), Err(Error::NoRuntime(_))));
    }

    #[tokio::test]
    async fn cancellation_closes_once() {
        let group = MockConsumerGroup::default().with_generation(three_records());
        let sub = Subscriber::with_group(group.clone(), &broker_config(), discard_logger());
        let calls = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();

        let read = tokio::spawn(sub.read_until(counting_handler(calls.clone()), token.clone(), futures::future::pending()));
        wait_until(|| group.marked_offsets().len() == 3).await;
        token.cancel();

        tokio::time::timeout(Duration::from_secs(5), read).await.unwrap().unwrap().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(group.closes(), 1);
        assert_eq!(group.events(), vec!["setup", "cleanup", "close"]);
    }

    #[tokio::test]
    async fn read_waits_for_setup() {
        let group = MockConsumerGroup::default();
        let hold = group.hold_setup();
        let sub = Subscriber::with_group(group.clone(), &broker_config(), discard_logger());

        let polled = Arc::new(AtomicBool::new(false));
        let shutdown = {
            let polled = polled.clone();
            async move { polled.store(true, Ordering::SeqCst) }
        };
        let calls = Arc::new(AtomicUsize::new(0));
        let read = tokio::spawn(sub.read_until(counting_handler(calls), CancellationToken::new(), shutdown));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!polled.load(Ordering::SeqCst));
        assert!(!read.is_finished());
        assert!(group.events().is_empty());

        hold.notify_one();
        tokio::time::timeout(Duration::from_secs(5), read).await.unwrap().unwrap().unwrap();
        assert!(polled.load(Ordering::SeqCst));
        assert_eq!(group.closes(), 1);
    }

    #[tokio::test]
    async fn shutdown_signal_pauses_before_close() {
        let group = MockConsumerGroup::default().with_generation(three_records());
        let sub = Subscriber::with_group(group.clone(), &broker_config(), discard_logger());
        let calls = Arc::new(AtomicUsize::new(0));

        tokio::time::timeout(
            Duration::from_secs(5),
            sub.read_until(counting_handler(calls), CancellationToken::new(), async {}),
        )
        .await
        .unwrap()
        .unwrap();

        let events = group.events();
        let pos = |ev: &str| events.iter().position(|e| *e == ev).unwrap();
        assert!(pos("setup") < pos("pause"));
        assert!(pos("pause") < pos("close"));
        assert_eq!(group.closes(), 1);
    }

    #[tokio::test]
    async fn rejoins_after_rebalance() {
        let group = MockConsumerGroup::default()
            .with_generation(three_records())
            .with_generation(vec![record("test_topic", 1, 0, "{}")]);
        let sub = Subscriber::with_group(group.clone(), &broker_config(), discard_logger());
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let read = tokio::spawn(sub.read_until(counting_handler(calls), token.clone(), futures::future::pending()));
        wait_until(|| group.marked_offsets().len() == 4).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), read).await.unwrap().unwrap().unwrap();

        assert_eq!(group.consume_calls(), 2);
        assert_eq!(group.events(), vec!["setup", "cleanup", "setup", "cleanup", "close"]);
    }

    #[tokio::test]
    async fn failed_records_are_not_marked() {
        let group = MockConsumerGroup::default().with_generation(three_records());
        let sub = Subscriber::with_group(group.clone(), &broker_config(), discard_logger());
        let token = CancellationToken::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let handler = {
            let seen = seen.clone();
            move |ctx: MessageContext, _: String, _: Bytes| {
                seen.fetch_add(1, Ordering::SeqCst);
                async move {
                    if ctx.offset == 1 {
                        Err(anyhow!("offset 1 failed"))
                    } else {
                        Ok(())
                    }
                }
            }
        };

        let read = tokio::spawn(sub.read_until(handler, token.clone(), futures::future::pending()));
        wait_until(|| seen.load(Ordering::SeqCst) == 3).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), read).await.unwrap().unwrap().unwrap();
        assert_eq!(group.marked_offsets(), vec![0, 2]);
    }

    #[tokio::test]
    async fn consume_error_ends_read() {
        let group = MockConsumerGroup::default().with_consume_error(Error::InvalidConfig("boom".into()));
        let sub = Subscriber::with_group(group.clone(), &broker_config(), discard_logger());
        let calls = Arc::new(AtomicUsize::new(0));

        let res = tokio::time::timeout(
            Duration::from_secs(5),
            sub.read_until(counting_handler(calls), CancellationToken::new(), futures::future::pending()),
        )
        .await
        .unwrap();
        assert!(matches!(res, Err(Error::InvalidConfig(msg)) if msg == "boom"));
        assert_eq!(group.closes(), 1);
    }

    #[tokio::test]
    async fn caller_token_is_left_alone() {
        let app = CancellationToken::new();

        let group = MockConsumerGroup::default().with_consume_error(Error::InvalidConfig("boom".into()));
        let sub = Subscriber::with_group(group, &broker_config(), discard_logger());
        let calls = Arc::new(AtomicUsize::new(0));
        let res = tokio::time::timeout(
            Duration::from_secs(5),
            sub.read_until(counting_handler(calls.clone()), app.clone(), futures::future::pending()),
        )
        .await
        .unwrap();
        assert!(res.is_err());
        assert!(!app.is_cancelled());

        let group = MockConsumerGroup::default().with_generation(three_records());
        let sub = Subscriber::with_group(group.clone(), &broker_config(), discard_logger());
        tokio::time::timeout(Duration::from_secs(5), sub.read_until(counting_handler(calls), app.clone(), async {}))
            .await
            .unwrap()
            .unwrap();
        assert!(group.events().contains(&"pause"));
        assert!(!app.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_before_join() {
        let group = MockConsumerGroup::default().with_generation(three_records());
        let sub = Subscriber::with_group(group.clone(), &broker_config(), discard_logger());
        let token = CancellationToken::new();
        token.cancel();
        let calls = Arc::new(AtomicUsize::new(0));

        tokio::time::timeout(
            Duration::from_secs(5),
            sub.read_until(counting_handler(calls.clone()), token, futures::future::pending()),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(group.events(), vec!["close"]);
    }

    #[tokio::test]
    async fn scram_handshake_on_join() {
        let auth = ScramAuth { user: "user".into(), password: "pencil".into(), algorithm: HashAlgorithm::Sha256 };
        let group = MockConsumerGroup::default().with_auth(auth, "user", "pencil");
        let sub = Subscriber::with_group(group.clone(), &broker_config(), discard_logger());
        let calls = Arc::new(AtomicUsize::new(0));

        tokio::time::timeout(Duration::from_secs(5), sub.read_until(counting_handler(calls), CancellationToken::new(), async {}))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(group.events()[0], "authenticated");

        let auth = ScramAuth { user: "user".into(), password: "wrong".into(), algorithm: HashAlgorithm::Sha256 };
        let group = MockConsumerGroup::default().with_auth(auth, "user", "pencil");
        let sub = Subscriber::with_group(group.clone(), &broker_config(), discard_logger());
        let calls = Arc::new(AtomicUsize::new(0));

        let res = tokio::time::timeout(
            Duration::from_secs(5),
            sub.read_until(counting_handler(calls), CancellationToken::new(), futures::future::pending()),
        )
        .await
        .unwrap();
        assert!(matches!(res, Err(Error::Scram(ScramError::Server(e))) if e == "invalid-proof"));
        assert_eq!(group.closes(), 1);
    }

    #[tokio::test]
    async fn consumer_errors_are_classified() {
        let drain = CaptureDrain::default();
        let logger = Logger::root(drain.clone(), o!());
        let group = MockConsumerGroup::default();
        let sub = Subscriber::with_group(group.clone(), &broker_config(), logger);

        group.push_error(Error::Io(io::Error::from(io::ErrorKind::ConnectionReset)));
        group.push_error(Error::InvalidConfig("unknown topic".into()));
        sub.close().await;

        let consume_errors = drain
            .records()
            .into_iter()
            .filter(|(_, msg)| msg == "consume error")
            .map(|(level, _)| level)
            .collect::<Vec<_>>();
        assert_eq!(consume_errors, vec![slog::Level::Warning, slog::Level::Error]);
    }
}
