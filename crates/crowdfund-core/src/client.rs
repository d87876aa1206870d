//! Typed boundary to the ledger program.
//!
//! [`Transport`] is the raw wire (a fullnode API, the in-memory ledger, a
//! test double). [`LedgerClient`] adds function-id shaping, signing,
//! per-call timeouts and retry of transient failures. It holds no business
//! logic.

use std::{
    sync::{mpsc, Arc, Condvar, Mutex},
    thread,
    time::{Duration, Instant},
};

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::{
    config::ClientConfig,
    error::ClientError,
    record::{as_u64, Address},
    signer::Signer,
};

const SIGNING_PREFIX: &[u8] = b"CROWDFUND::RawTransaction";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ViewRequest {
    pub function: String,
    pub arguments: Vec<Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EntryFunctionPayload {
    pub function: String,
    pub arguments: Vec<Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SignedTransaction {
    pub sender: Address,
    pub sequence_number: u64,
    pub payload: EntryFunctionPayload,
    /// ed25519 public key, hex.
    pub public_key: String,
    /// ed25519 signature over [`SignedTransaction::signing_message`], base64.
    pub signature: String,
}

impl SignedTransaction {
    pub fn signing_message(
        sender: &str,
        sequence_number: u64,
        payload: &EntryFunctionPayload,
    ) -> Vec<u8> {
        let body = serde_json::json!({
            "sender": sender,
            "sequence_number": sequence_number.to_string(),
            "payload": payload,
        });
        let mut message = SIGNING_PREFIX.to_vec();
        message.extend_from_slice(body.to_string().as_bytes());
        message
    }

    pub fn sign(
        signer: &dyn Signer,
        sequence_number: u64,
        payload: EntryFunctionPayload,
    ) -> Self {
        let sender = signer.address().to_string();
        let message = Self::signing_message(&sender, sequence_number, &payload);
        let signature = signer.sign(&message);
        Self {
            sender,
            sequence_number,
            payload,
            public_key: hex::encode(signer.public_key()),
            signature: general_purpose::STANDARD.encode(signature),
        }
    }

    pub fn signature_bytes(&self) -> Result<Vec<u8>, ClientError> {
        general_purpose::STANDARD
            .decode(&self.signature)
            .map_err(|e| ClientError::InvalidInput(format!("signature base64: {e}")))
    }

    pub fn public_key_bytes(&self) -> Result<[u8; 32], ClientError> {
        let bytes = hex::decode(&self.public_key)
            .map_err(|e| ClientError::InvalidInput(format!("public key hex: {e}")))?;
        bytes
            .as_slice()
            .try_into()
            .map_err(|_| ClientError::InvalidInput("public key must be 32 bytes".into()))
    }

    /// Transaction hash, `0x` + hex SHA-256 of message and signature.
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(Self::signing_message(
            &self.sender,
            self.sequence_number,
            &self.payload,
        ));
        hasher.update(self.signature.as_bytes());
        format!("0x{}", hex::encode(hasher.finalize()))
    }
}

/// Accepted-for-processing handle returned by a submit.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingTransaction {
    pub hash: String,
}

/// Committed transaction as reported by the ledger.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TransactionInfo {
    pub hash: String,
    pub version: u64,
    pub success: bool,
    pub vm_status: String,
    #[serde(default)]
    pub events: Vec<Value>,
}

impl TransactionInfo {
    /// Address announced by a `campaign_created` event, if any.
    pub fn created_campaign(&self) -> Option<Address> {
        self.events.iter().find_map(|event| {
            if event.get("type").and_then(Value::as_str) != Some("campaign_created") {
                return None;
            }
            event
                .get("campaign")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
    }
}

/// Raw wire to the ledger program. Implementations report program
/// rejections as [`ClientError::Remote`] and transport problems as
/// [`ClientError::Network`].
pub trait Transport: Send + Sync {
    fn view(&self, request: &ViewRequest) -> Result<Vec<Value>, ClientError>;
    fn sequence_number(&self, account: &str) -> Result<u64, ClientError>;
    fn submit(&self, transaction: &SignedTransaction) -> Result<PendingTransaction, ClientError>;
    fn wait_for_transaction(&self, hash: &str) -> Result<TransactionInfo, ClientError>;
}

/// Counts transport calls that have not returned yet, abandoned ones
/// included.
struct Permits {
    used: Mutex<usize>,
    freed: Condvar,
    limit: usize,
}

/// Held by the worker thread for the lifetime of one transport call.
struct Permit(Arc<Permits>);

impl Permits {
    fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            used: Mutex::new(0),
            freed: Condvar::new(),
            limit: limit.max(1),
        })
    }

    fn acquire(self: &Arc<Self>, timeout: Duration) -> Result<Permit, ClientError> {
        let deadline = Instant::now() + timeout;
        let mut used = self
            .used
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        while *used >= self.limit {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(ClientError::Network(format!(
                    "all {} request slots busy for {} ms",
                    self.limit,
                    timeout.as_millis()
                )));
            }
            used = self
                .freed
                .wait_timeout(used, left)
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .0;
        }
        *used += 1;
        Ok(Permit(Arc::clone(self)))
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        let mut used = self
            .0
            .used
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *used = used.saturating_sub(1);
        self.0.freed.notify_one();
    }
}

#[derive(Clone)]
pub struct LedgerClient {
    transport: Arc<dyn Transport>,
    config: Arc<ClientConfig>,
    permits: Arc<Permits>,
}

impl LedgerClient {
    /// At most `config.max_in_flight` transport calls run at once across
    /// this client and its clones.
    pub fn new(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        Self {
            transport,
            permits: Permits::new(config.max_in_flight),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Read-only view call. Transient failures are retried per the
    /// configured policy; rejections are returned at once.
    pub fn query(&self, name: &str, arguments: Vec<Value>) -> Result<Vec<Value>, ClientError> {
        let request = ViewRequest {
            function: self.config.function_id(name),
            arguments,
        };
        self.with_retry(|| {
            let request = request.clone();
            self.timed(move |transport| transport.view(&request))
        })
    }

    /// Signs and submits an entry-function call. Not retried: a lost
    /// response must not turn into a second invocation.
    pub fn submit(
        &self,
        entry_point: &str,
        arguments: Vec<Value>,
        signer: Option<&dyn Signer>,
    ) -> Result<PendingTransaction, ClientError> {
        let signer = signer.ok_or(ClientError::NotConnected)?;
        let sender = signer.address().to_string();
        let sequence_number =
            self.with_retry(|| {
                let sender = sender.clone();
                self.timed(move |transport| transport.sequence_number(&sender))
            })?;
        let payload = EntryFunctionPayload {
            function: self.config.function_id(entry_point),
            arguments,
        };
        let transaction = SignedTransaction::sign(signer, sequence_number, payload);
        self.timed(move |transport| transport.submit(&transaction))
    }

    /// Waits for the transaction to commit. A committed-but-aborted
    /// transaction becomes [`ClientError::Remote`] carrying the VM status.
    pub fn await_confirmation(
        &self,
        pending: &PendingTransaction,
    ) -> Result<TransactionInfo, ClientError> {
        let info = self.with_retry(|| {
            let hash = pending.hash.clone();
            self.timed(move |transport| transport.wait_for_transaction(&hash))
        })?;
        if !info.success {
            return Err(ClientError::Remote(info.vm_status));
        }
        Ok(info)
    }

    /// `get_total_campaigns`-style single-u64 view.
    pub fn query_u64(&self, name: &str, arguments: Vec<Value>) -> Result<u64, ClientError> {
        let values = self.query(name, arguments)?;
        values
            .first()
            .and_then(as_u64)
            .ok_or_else(|| ClientError::malformed(name, "expected a u64"))
    }

    pub fn query_bool(&self, name: &str, arguments: Vec<Value>) -> Result<bool, ClientError> {
        let values = self.query(name, arguments)?;
        values
            .first()
            .and_then(Value::as_bool)
            .ok_or_else(|| ClientError::malformed(name, "expected a bool"))
    }

    fn with_retry<T>(
        &self,
        mut call: impl FnMut() -> Result<T, ClientError>,
    ) -> Result<T, ClientError> {
        let policy = &self.config.retry;
        let mut attempt = 0;
        loop {
            match call() {
                Err(err) if err.is_transient() && attempt + 1 < policy.attempts => {
                    thread::sleep(policy.delay_for(attempt));
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Runs one transport call on a helper thread and gives up after the
    /// configured timeout. The abandoned call finishes in the background,
    /// keeps its request slot until then, and its result is dropped.
    fn timed<T: Send + 'static>(
        &self,
        call: impl FnOnce(&dyn Transport) -> Result<T, ClientError> + Send + 'static,
    ) -> Result<T, ClientError> {
        let timeout: Duration = self.config.timeout();
        let permit = self.permits.acquire(timeout)?;
        let transport = Arc::clone(&self.transport);
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("crowdfund-rpc".into())
            .spawn(move || {
                let result = call(transport.as_ref());
                drop(permit);
                let _ = tx.send(result);
            })
            .map_err(|e| ClientError::Network(format!("cannot spawn rpc worker: {e}")))?;
        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(ClientError::Network(format!(
                "request timed out after {} ms",
                timeout.as_millis()
            ))),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(ClientError::Network("rpc worker exited without a reply".into()))
            }
        }
    }
}
