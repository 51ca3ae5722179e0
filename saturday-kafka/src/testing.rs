//! In-memory broker doubles.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use parking_lot::Mutex;
use rdkafka::error::KafkaError;
use slog::{o, Logger};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::broker::{
    AsyncProducer, ConsumerGroup, Delivery, GroupClaim, GroupHandler, GroupSession, ProducerError,
    ProducerRecord, Record, SyncProducer,
};
use crate::sasl::ScramAuth;
use crate::scram::{constant_time_eq, drive_handshake, HashAlgorithm, CLIENT_KEY, SERVER_KEY};
use crate::{Error, Result};

pub(crate) fn discard_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// Poll `cond` until it holds, panics after 5 seconds
pub(crate) async fn wait_until(cond: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not met in time");
}

/// Keeps the level and message of every record
#[derive(Clone, Default)]
pub(crate) struct CaptureDrain {
    records: Arc<std::sync::Mutex<Vec<(slog::Level, String)>>>,
}

impl CaptureDrain {
    pub(crate) fn records(&self) -> Vec<(slog::Level, String)> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl slog::Drain for CaptureDrain {
    type Ok = ();
    type Err = slog::Never;

    fn log(&self, record: &slog::Record<'_>, _values: &slog::OwnedKVList) -> std::result::Result<(), slog::Never> {
        if let Ok(mut records) = self.records.lock() {
            records.push((record.level(), record.msg().to_string()));
        }
        Ok(())
    }
}

pub(crate) fn record(topic: &str, partition: i32, offset: i64, payload: &str) -> Record {
    Record {
        topic: topic.into(),
        partition,
        offset,
        key: None,
        payload: Bytes::copy_from_slice(payload.as_bytes()),
        timestamp: None,
    }
}

#[derive(Clone)]
pub(crate) struct MockSyncProducer {
    sent: Arc<Mutex<Vec<ProducerRecord>>>,
    fail: Arc<Mutex<Option<KafkaError>>>,
    closed: Arc<AtomicBool>,
}

impl Default for MockSyncProducer {
    fn default() -> Self {
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            fail: Arc::new(Mutex::new(None)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl MockSyncProducer {
    pub(crate) fn sent(&self) -> Arc<Mutex<Vec<ProducerRecord>>> {
        self.sent.clone()
    }

    /// Every following send is rejected with `e`
    pub(crate) fn fail_with(&self, e: KafkaError) {
        *self.fail.lock() = Some(e);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SyncProducer for MockSyncProducer {
    async fn send(&self, record: ProducerRecord) -> Result<Delivery> {
        if let Some(e) = self.fail.lock().clone() {
            return Err(Error::Kafka(e));
        }
        let mut sent = self.sent.lock();
        sent.push(record);
        Ok((0, sent.len() as i64 - 1))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Clone)]
pub(crate) struct MockAsyncProducer {
    queued: Arc<Mutex<Vec<ProducerRecord>>>,
    fail: Arc<Mutex<Option<KafkaError>>>,
    failed: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
    errors_tx: Arc<Mutex<Option<mpsc::UnboundedSender<ProducerError>>>>,
    errors_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<ProducerError>>>>,
}

impl Default for MockAsyncProducer {
    fn default() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            queued: Arc::new(Mutex::new(Vec::new())),
            fail: Arc::new(Mutex::new(None)),
            failed: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
            errors_tx: Arc::new(Mutex::new(Some(tx))),
            errors_rx: Arc::new(Mutex::new(Some(rx))),
        }
    }
}

impl MockAsyncProducer {
    pub(crate) fn queued(&self) -> Arc<Mutex<Vec<ProducerRecord>>> {
        self.queued.clone()
    }

    /// Every following record fails delivery with `e`
    pub(crate) fn fail_with(&self, e: KafkaError) {
        *self.fail.lock() = Some(e);
    }

    pub(crate) fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AsyncProducer for MockAsyncProducer {
    async fn enqueue(&self, record: ProducerRecord) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        self.queued.lock().push(record.clone());
        if let Some(e) = self.fail.lock().clone() {
            self.failed.fetch_add(1, Ordering::SeqCst);
            if let Some(tx) = self.errors_tx.lock().as_ref() {
                let _ = tx.send(ProducerError { record, error: Error::Kafka(e) });
            }
        }
        Ok(())
    }

    fn take_errors(&self) -> Option<mpsc::UnboundedReceiver<ProducerError>> {
        self.errors_rx.lock().take()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.errors_tx.lock().take();
        Ok(())
    }
}

/// Server side of a SCRAM exchange for a single user
pub(crate) struct ScramServer {
    algorithm: HashAlgorithm,
    user: String,
    password: String,
    salt: Vec<u8>,
    iterations: u32,
    nonce: String,
    state: Option<(String, String)>,
}

impl ScramServer {
    pub(crate) fn new(algorithm: HashAlgorithm, user: &str, password: &str) -> Self {
        Self {
            algorithm,
            user: user.into(),
            password: password.into(),
            salt: b"saturday-salt".to_vec(),
            iterations: 4096,
            nonce: "3rfcNHYJY1ZVvWVs7j".into(),
            state: None,
        }
    }

    /// Answer one client message
    pub(crate) fn respond(&mut self, msg: &str) -> Result<String> {
        match self.state.take() {
            None => {
                let bare = msg.splitn(3, ',').nth(2).unwrap_or_default().to_owned();
                let mut user = None;
                let mut client_nonce = None;
                for attr in bare.split(',') {
                    match attr.split_once('=') {
                        Some(("n", v)) => user = Some(v),
                        Some(("r", v)) => client_nonce = Some(v),
                        _ => {}
                    }
                }
                if user != Some(self.user.as_str()) {
                    return Ok("e=unknown-user".into());
                }
                let server_first = format!(
                    "r={}{},s={},i={}",
                    client_nonce.unwrap_or_default(),
                    self.nonce,
                    BASE64.encode(&self.salt),
                    self.iterations
                );
                self.state = Some((bare, server_first.clone()));
                Ok(server_first)
            }
            Some((client_first_bare, server_first)) => {
                let (without_proof, proof) = msg.rsplit_once(",p=").unwrap_or((msg, ""));
                let proof = BASE64.decode(proof).unwrap_or_default();
                let auth_message = format!("{client_first_bare},{server_first},{without_proof}");

                let alg = self.algorithm;
                let salted = alg.salted_password(self.password.as_bytes(), &self.salt, self.iterations);
                let stored_key = alg.hash(&alg.hmac(&salted, CLIENT_KEY)?);
                let client_signature = alg.hmac(&stored_key, auth_message.as_bytes())?;
                let client_key: Vec<u8> = proof.iter().zip(client_signature.iter()).map(|(a, b)| a ^ b).collect();
                if proof.len() != client_signature.len() || !constant_time_eq(&alg.hash(&client_key), &stored_key) {
                    return Ok("e=invalid-proof".into());
                }
                let server_key = alg.hmac(&salted, SERVER_KEY)?;
                let server_signature = alg.hmac(&server_key, auth_message.as_bytes())?;
                Ok(format!("v={}", BASE64.encode(server_signature)))
            }
        }
    }
}

#[derive(Default)]
struct GroupState {
    generations: VecDeque<Vec<Record>>,
    consume_error: Option<Error>,
    auth: Option<(ScramAuth, HashAlgorithm, String, String)>,
    hold_setup: Option<Arc<Notify>>,
    marked: Vec<Record>,
    events: Vec<&'static str>,
}

/// Consumer group that plays back queued generations. Once the last generation is
/// drained the claim stays open until the session is cancelled.
#[derive(Clone)]
pub(crate) struct MockConsumerGroup {
    state: Arc<Mutex<GroupState>>,
    consume_calls: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
    errors_tx: Arc<Mutex<Option<mpsc::UnboundedSender<Error>>>>,
    errors_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<Error>>>>,
}

impl Default for MockConsumerGroup {
    fn default() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(Mutex::new(GroupState::default())),
            consume_calls: Arc::new(AtomicUsize::new(0)),
            closes: Arc::new(AtomicUsize::new(0)),
            errors_tx: Arc::new(Mutex::new(Some(tx))),
            errors_rx: Arc::new(Mutex::new(Some(rx))),
        }
    }
}

impl MockConsumerGroup {
    pub(crate) fn with_generation(self, records: Vec<Record>) -> Self {
        self.state.lock().generations.push_back(records);
        self
    }

    /// The next `consume` fails with `e`
    pub(crate) fn with_consume_error(self, e: Error) -> Self {
        self.state.lock().consume_error = Some(e);
        self
    }

    /// Authenticate `auth` against a server that knows `user` / `password`
    pub(crate) fn with_auth(self, auth: ScramAuth, user: &str, password: &str) -> Self {
        let algorithm = auth.algorithm;
        self.state.lock().auth = Some((auth, algorithm, user.into(), password.into()));
        self
    }

    /// `setup` waits until the returned notify fires
    pub(crate) fn hold_setup(&self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.state.lock().hold_setup = Some(notify.clone());
        notify
    }

    pub(crate) fn push_error(&self, e: Error) {
        if let Some(tx) = self.errors_tx.lock().as_ref() {
            let _ = tx.send(e);
        }
    }

    pub(crate) fn marked_offsets(&self) -> Vec<i64> {
        self.state.lock().marked.iter().map(|r| r.offset).collect()
    }

    pub(crate) fn events(&self) -> Vec<&'static str> {
        self.state.lock().events.clone()
    }

    pub(crate) fn consume_calls(&self) -> usize {
        self.consume_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn event(&self, ev: &'static str) {
        self.state.lock().events.push(ev);
    }

    async fn authenticate(&self) -> Result<()> {
        let auth = self.state.lock().auth.clone();
        let Some((auth, algorithm, user, password)) = auth else {
            return Ok(());
        };
        let server = Mutex::new(ScramServer::new(algorithm, &user, &password));
        let mut client = auth.new_client();
        drive_handshake(&mut client, &auth.user, &auth.password, |msg| {
            let reply = server.lock().respond(&msg);
            async move { reply }
        })
        .await?;
        self.event("authenticated");
        Ok(())
    }
}

#[async_trait]
impl ConsumerGroup for MockConsumerGroup {
    async fn consume(&self, ctx: &CancellationToken, _topics: &[String], handler: &dyn GroupHandler) -> Result<()> {
        self.consume_calls.fetch_add(1, Ordering::SeqCst);
        let consume_error = self.state.lock().consume_error.take();
        if let Some(e) = consume_error {
            return Err(e);
        }
        if ctx.is_cancelled() {
            return Ok(());
        }
        self.authenticate().await?;

        let hold = self.state.lock().hold_setup.take();
        if let Some(hold) = hold {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = hold.notified() => {}
            }
        }

        let records = self.state.lock().generations.pop_front();
        let session = MockSession { token: ctx.child_token(), group: self.clone() };
        let mut claim = MockClaim {
            records: records.unwrap_or_default().into(),
            token: session.token.clone(),
            group: self.clone(),
        };

        handler.setup(&session).await?;
        self.event("setup");
        let consumed = handler.consume_claim(&session, &mut claim).await;
        let cleaned = handler.cleanup(&session).await;
        self.event("cleanup");
        session.token.cancel();
        consumed.and(cleaned)
    }

    fn pause_all(&self) {
        self.event("pause");
    }

    fn take_errors(&self) -> Option<mpsc::UnboundedReceiver<Error>> {
        self.errors_rx.lock().take()
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.event("close");
        self.errors_tx.lock().take();
        Ok(())
    }
}

struct MockSession {
    token: CancellationToken,
    group: MockConsumerGroup,
}

impl GroupSession for MockSession {
    fn mark_message(&self, record: &Record) {
        if !self.token.is_cancelled() {
            self.group.state.lock().marked.push(record.clone());
        }
    }

    fn context(&self) -> &CancellationToken {
        &self.token
    }
}

struct MockClaim {
    records: VecDeque<Record>,
    token: CancellationToken,
    group: MockConsumerGroup,
}

#[async_trait]
impl GroupClaim for MockClaim {
    async fn next(&mut self) -> Option<Record> {
        if let Some(record) = self.records.pop_front() {
            return Some(record);
        }
        // a queued generation means a rebalance ends this one
        if !self.group.state.lock().generations.is_empty() {
            return None;
        }
        self.token.cancelled().await;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scram::{Authenticator, ScramClient};

    #[tokio::test]
    async fn scram_server_accepts_the_client() {
        let mut server = ScramServer::new(HashAlgorithm::Sha512, "user", "pencil");
        let mut client = ScramClient::new(HashAlgorithm::Sha512);
        drive_handshake(&mut client, "user", "pencil", |msg| {
            let reply = server.respond(&msg);
            async move { reply }
        })
        .await
        .unwrap();
        assert!(client.done());
    }

    #[tokio::test]
    async fn scram_server_rejects_a_wrong_password() {
        let mut server = ScramServer::new(HashAlgorithm::Sha256, "user", "pencil");
        let mut client = ScramClient::new(HashAlgorithm::Sha256);
        let res = drive_handshake(&mut client, "user", "pen", |msg| {
            let reply = server.respond(&msg);
            async move { reply }
        })
        .await;
        assert!(matches!(res, Err(Error::Scram(crate::scram::ScramError::Server(e))) if e == "invalid-proof"));
        assert!(!client.done());
    }
}
