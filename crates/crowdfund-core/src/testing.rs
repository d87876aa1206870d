//! Shared test doubles: scripted and failure-injecting transports plus a
//! funded in-memory ledger fixture.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use serde_json::{json, Value};

use crate::{
    client::{
        LedgerClient, PendingTransaction, SignedTransaction, TransactionInfo, Transport,
        ViewRequest,
    },
    clock::{Clock, ManualClock},
    config::{ClientConfig, RetryPolicy},
    error::ClientError,
    memory::MemoryLedger,
    metadata::CampaignMetadata,
    record::Address,
    repository::CampaignRepository,
    signer::{Signer, WalletSigner},
    units::{Octas, OCTAS_PER_APT},
};

pub const TEST_MODULE: &str = "0xc0de";
pub const START: u64 = 1_700_000_000;

pub fn test_config() -> ClientConfig {
    ClientConfig {
        module_address: TEST_MODULE.into(),
        max_in_flight: 4,
        timeout_ms: 2_000,
        retry: RetryPolicy {
            attempts: 2,
            base_delay_ms: 1,
        },
        quiet: true,
        ..ClientConfig::default()
    }
}

#[derive(Default)]
struct Script {
    views: HashMap<String, Vec<Value>>,
    view_failures: VecDeque<ClientError>,
    latency: Duration,
    submitted: Vec<SignedTransaction>,
    abort: Option<String>,
}

/// Canned responses keyed by the short function name.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<Script>,
    view_calls: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_views(&self, count: usize, err: ClientError) {
        let mut script = self.script.lock().unwrap();
        script
            .view_failures
            .extend(std::iter::repeat(err).take(count));
    }

    pub fn set_view(&self, name: &str, values: Vec<Value>) {
        self.script
            .lock()
            .unwrap()
            .views
            .insert(name.to_string(), values);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.script.lock().unwrap().latency = latency;
    }

    pub fn abort_transactions(&self, reason: &str) {
        self.script.lock().unwrap().abort = Some(reason.to_string());
    }

    pub fn view_calls(&self) -> usize {
        self.view_calls.load(Ordering::SeqCst)
    }

    pub fn submitted(&self) -> Vec<SignedTransaction> {
        self.script.lock().unwrap().submitted.clone()
    }
}

impl Transport for ScriptedTransport {
    fn view(&self, request: &ViewRequest) -> Result<Vec<Value>, ClientError> {
        self.view_calls.fetch_add(1, Ordering::SeqCst);
        let latency = self.script.lock().unwrap().latency;
        thread::sleep(latency);
        let mut script = self.script.lock().unwrap();
        if let Some(err) = script.view_failures.pop_front() {
            return Err(err);
        }
        let name = request
            .function
            .rsplit("::")
            .next()
            .unwrap_or(&request.function);
        script
            .views
            .get(name)
            .cloned()
            .ok_or_else(|| ClientError::Remote(format!("FUNCTION_NOT_FOUND: {name}")))
    }

    fn sequence_number(&self, _account: &str) -> Result<u64, ClientError> {
        Ok(self.script.lock().unwrap().submitted.len() as u64)
    }

    fn submit(&self, transaction: &SignedTransaction) -> Result<PendingTransaction, ClientError> {
        self.script
            .lock()
            .unwrap()
            .submitted
            .push(transaction.clone());
        Ok(PendingTransaction {
            hash: transaction.hash(),
        })
    }

    fn wait_for_transaction(&self, hash: &str) -> Result<TransactionInfo, ClientError> {
        let abort = self.script.lock().unwrap().abort.clone();
        Ok(TransactionInfo {
            hash: hash.to_string(),
            version: 1,
            success: abort.is_none(),
            vm_status: abort.unwrap_or_else(|| "Executed successfully".into()),
            events: Vec::new(),
        })
    }
}

/// Delegates to an inner transport while failing selected addresses,
/// delaying views and submits, and recording peak view concurrency.
pub struct FlakyTransport {
    inner: Arc<dyn Transport>,
    failing: Mutex<HashSet<String>>,
    latency: Mutex<Duration>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl FlakyTransport {
    pub fn wrap(inner: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failing: Mutex::new(HashSet::new()),
            latency: Mutex::new(Duration::ZERO),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    /// Views whose first argument is `address` fail with a network error.
    pub fn fail_address(&self, address: &str) {
        self.failing.lock().unwrap().insert(address.to_string());
    }

    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl Transport for FlakyTransport {
    fn view(&self, request: &ViewRequest) -> Result<Vec<Value>, ClientError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let latency = *self.latency.lock().unwrap();
        thread::sleep(latency);
        let target = request.arguments.first().and_then(Value::as_str);
        let fails = target.is_some_and(|t| self.failing.lock().unwrap().contains(t));
        let result = if fails {
            Err(ClientError::Network("connection reset by peer".into()))
        } else {
            self.inner.view(request)
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn sequence_number(&self, account: &str) -> Result<u64, ClientError> {
        self.inner.sequence_number(account)
    }

    fn submit(&self, transaction: &SignedTransaction) -> Result<PendingTransaction, ClientError> {
        let latency = *self.latency.lock().unwrap();
        thread::sleep(latency);
        self.inner.submit(transaction)
    }

    fn wait_for_transaction(&self, hash: &str) -> Result<TransactionInfo, ClientError> {
        self.inner.wait_for_transaction(hash)
    }
}

/// Fresh in-memory ledger on a manual clock with two funded wallets.
pub struct Fixture {
    pub clock: Arc<ManualClock>,
    pub ledger: Arc<MemoryLedger>,
    pub creator: WalletSigner,
    pub backer: WalletSigner,
}

impl Fixture {
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::new(START));
        let ledger = Arc::new(MemoryLedger::with_clock(&test_config(), clock.clone()));
        let creator = WalletSigner::generate();
        let backer = WalletSigner::generate();
        ledger.fund(creator.address(), 1_000 * OCTAS_PER_APT);
        ledger.fund(backer.address(), 1_000 * OCTAS_PER_APT);
        Self {
            clock,
            ledger,
            creator,
            backer,
        }
    }

    pub fn client(&self) -> LedgerClient {
        LedgerClient::new(self.ledger.clone(), test_config())
    }

    pub fn client_over(&self, transport: Arc<dyn Transport>) -> LedgerClient {
        LedgerClient::new(transport, test_config())
    }

    pub fn repository(&self) -> CampaignRepository {
        CampaignRepository::new(self.client())
    }

    pub fn repository_over(&self, transport: Arc<dyn Transport>) -> CampaignRepository {
        CampaignRepository::new(self.client_over(transport))
    }

    pub fn try_submit(
        &self,
        signer: &WalletSigner,
        entry_point: &str,
        arguments: Vec<Value>,
    ) -> Result<TransactionInfo, ClientError> {
        let client = self.client();
        let pending = client.submit(entry_point, arguments, Some(signer))?;
        client.await_confirmation(&pending)
    }

    /// Creates a campaign owned by `creator` that ends `duration_secs` from now.
    pub fn create_campaign(&self, goal: Octas, duration_secs: u64, title: &str) -> Address {
        let metadata = CampaignMetadata::new(title, format!("{title} description"));
        let info = self
            .try_submit(
                &self.creator,
                "create_campaign",
                vec![
                    json!(goal.to_string()),
                    json!((self.ledger.now() + duration_secs).to_string()),
                    json!(metadata.to_blob()),
                    json!(self.ledger.registry_address()),
                ],
            )
            .unwrap();
        info.created_campaign().unwrap()
    }

    pub fn pledge(&self, campaign: &str, amount: Octas) {
        self.try_submit(
            &self.backer,
            "pledge",
            vec![json!(campaign), json!(amount.to_string())],
        )
        .unwrap();
    }
}
