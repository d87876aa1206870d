//! In-memory crowdfund ledger program.
//!
//! A deterministic stand-in for the on-chain module: registry, campaigns,
//! pledges, account balances, per-account sequence numbers and an event
//! log. It serves the same views and entry points as the deployed program
//! and implements [`Transport`], so it backs both the development CLI and
//! the test suite. Snapshots carry a SHA-256 state root that is checked on
//! load.

use std::{
    collections::BTreeMap,
    fs,
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::{
    client::{PendingTransaction, SignedTransaction, TransactionInfo, Transport, ViewRequest},
    clock::{Clock, SystemClock},
    config::ClientConfig,
    error::ClientError,
    record::{as_u64, Address},
    signer::{address_from_public_key, verify_signature},
    units::Octas,
};

/// Abort reasons raised by the program. The rendered text is what callers
/// see as the rejection reason.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProgramError {
    #[error("E_INVALID_GOAL: goal must be greater than zero")]
    InvalidGoal,
    #[error("E_INVALID_DEADLINE: deadline must be in the future")]
    InvalidDeadline,
    #[error("E_REGISTRY_NOT_FOUND: no registry at {0}")]
    RegistryNotFound(Address),
    #[error("E_CAMPAIGN_NOT_FOUND: no campaign at {0}")]
    CampaignNotFound(Address),
    #[error("E_CAMPAIGN_ENDED: campaign deadline has passed")]
    CampaignEnded,
    #[error("E_CAMPAIGN_ACTIVE: campaign deadline has not passed")]
    CampaignActive,
    #[error("E_ZERO_AMOUNT: pledge amount must be greater than zero")]
    ZeroAmount,
    #[error("E_INSUFFICIENT_BALANCE: account {0} cannot cover the pledge")]
    InsufficientBalance(Address),
    #[error("E_NOT_CREATOR: signer has no campaigns")]
    NotCreator,
    #[error("E_GOAL_NOT_REACHED: campaign goal has not been reached")]
    GoalNotReached,
    #[error("E_GOAL_REACHED: campaign reached its goal, refunds are closed")]
    GoalReached,
    #[error("E_ALREADY_CLAIMED: funds were already claimed")]
    AlreadyClaimed,
    #[error("E_NO_PLEDGE: signer has no pledge in this campaign")]
    NoPledge,
    #[error("E_ALREADY_REFUNDED: pledge already refunded")]
    AlreadyRefunded,
    #[error("E_BAD_ARGUMENT: {0}")]
    BadArgument(String),
    #[error("FUNCTION_NOT_FOUND: {0}")]
    FunctionNotFound(String),
}

impl From<ProgramError> for ClientError {
    fn from(err: ProgramError) -> Self {
        ClientError::Remote(err.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("cannot access ledger state {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("ledger state parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("ledger state root mismatch: stored {stored}, computed {computed}")]
    RootMismatch { stored: String, computed: String },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PledgeState {
    pub amount: Octas,
    pub refunded: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CampaignState {
    pub address: Address,
    pub creator: Address,
    pub goal: Octas,
    pub total_raised: Octas,
    pub deadline: u64,
    pub metadata: String,
    pub funds_claimed: bool,
    pub total_refunded: Octas,
    pub escrow_balance: Octas,
    pub pledges: BTreeMap<Address, PledgeState>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgramEvent {
    Deposit {
        account: Address,
        amount: Octas,
    },
    CampaignCreated {
        campaign: Address,
        creator: Address,
        goal: Octas,
        deadline: u64,
    },
    Pledged {
        campaign: Address,
        backer: Address,
        amount: Octas,
    },
    FundsClaimed {
        campaign: Address,
        creator: Address,
        amount: Octas,
    },
    Refunded {
        campaign: Address,
        backer: Address,
        amount: Octas,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LedgerMeta {
    /// Committed transactions so far.
    pub version: u64,
    /// Seconds added on top of the wall clock (`warp`).
    pub clock_offset: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LedgerSnapshot {
    pub meta: LedgerMeta,
    pub registry_address: Address,
    pub registry: Vec<Address>,
    pub campaigns: BTreeMap<Address, CampaignState>,
    pub balances: BTreeMap<Address, Octas>,
    pub sequence_numbers: BTreeMap<Address, u64>,
    pub events: Vec<ProgramEvent>,
    pub transactions: BTreeMap<String, TransactionInfo>,
    pub state_root: String,
}

#[derive(Default)]
struct LedgerState {
    meta: LedgerMeta,
    registry: Vec<Address>,
    campaigns: BTreeMap<Address, CampaignState>,
    balances: BTreeMap<Address, Octas>,
    sequence_numbers: BTreeMap<Address, u64>,
    events: Vec<ProgramEvent>,
    transactions: BTreeMap<String, TransactionInfo>,
}

impl LedgerState {
    fn credit(&mut self, account: &str, amount: Octas) {
        let balance = self.balances.entry(account.to_string()).or_insert(0);
        *balance = balance.saturating_add(amount);
    }

    fn debit(&mut self, account: &str, amount: Octas) -> Result<(), ProgramError> {
        let balance = self
            .balances
            .get_mut(account)
            .filter(|balance| **balance >= amount)
            .ok_or_else(|| ProgramError::InsufficientBalance(account.to_string()))?;
        *balance -= amount;
        Ok(())
    }

    fn campaign(&self, address: &str) -> Result<&CampaignState, ProgramError> {
        self.campaigns
            .get(address)
            .ok_or_else(|| ProgramError::CampaignNotFound(address.to_string()))
    }

    fn campaign_mut(&mut self, address: &str) -> Result<&mut CampaignState, ProgramError> {
        self.campaigns
            .get_mut(address)
            .ok_or_else(|| ProgramError::CampaignNotFound(address.to_string()))
    }
}

pub struct MemoryLedger {
    function_prefix: String,
    registry_address: Address,
    clock: Arc<dyn Clock>,
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    pub fn new(config: &ClientConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &ClientConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            function_prefix: format!("{}::{}::", config.module_address, config.module_name),
            registry_address: config.registry_address().to_string(),
            clock,
            state: Mutex::new(LedgerState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn registry_address(&self) -> &str {
        &self.registry_address
    }

    /// Faucet: mint `amount` octas into `account`.
    pub fn fund(&self, account: &str, amount: Octas) {
        let mut state = self.state();
        state.credit(account, amount);
        state.events.push(ProgramEvent::Deposit {
            account: account.to_string(),
            amount,
        });
    }

    pub fn balance(&self, account: &str) -> Octas {
        self.state().balances.get(account).copied().unwrap_or(0)
    }

    /// Moves the ledger clock forward.
    pub fn warp(&self, secs: u64) {
        let mut state = self.state();
        state.meta.clock_offset = state.meta.clock_offset.saturating_add(secs);
    }

    pub fn events(&self) -> Vec<ProgramEvent> {
        self.state().events.clone()
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let state = self.state();
        LedgerSnapshot {
            meta: state.meta.clone(),
            registry_address: self.registry_address.clone(),
            registry: state.registry.clone(),
            campaigns: state.campaigns.clone(),
            balances: state.balances.clone(),
            sequence_numbers: state.sequence_numbers.clone(),
            events: state.events.clone(),
            transactions: state.transactions.clone(),
            state_root: compute_state_root(&state.registry, &state.campaigns, &state.balances),
        }
    }

    pub fn restore(
        config: &ClientConfig,
        clock: Arc<dyn Clock>,
        snapshot: LedgerSnapshot,
    ) -> Result<Self, StoreError> {
        let computed =
            compute_state_root(&snapshot.registry, &snapshot.campaigns, &snapshot.balances);
        if computed != snapshot.state_root {
            return Err(StoreError::RootMismatch {
                stored: snapshot.state_root,
                computed,
            });
        }
        let ledger = Self::with_clock(config, clock);
        *ledger.state() = LedgerState {
            meta: snapshot.meta,
            registry: snapshot.registry,
            campaigns: snapshot.campaigns,
            balances: snapshot.balances,
            sequence_numbers: snapshot.sequence_numbers,
            events: snapshot.events,
            transactions: snapshot.transactions,
        };
        Ok(ledger)
    }

    pub fn load(path: &Path, config: &ClientConfig, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let bytes = fs::read(path).map_err(|source| StoreError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let snapshot: LedgerSnapshot = serde_json::from_slice(&bytes)?;
        Self::restore(config, clock, snapshot)
    }

    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(&self.snapshot())?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                    path: parent.display().to_string(),
                    source,
                })?;
            }
        }
        fs::write(path, bytes).map_err(|source| StoreError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    fn entry_name<'a>(&self, function: &'a str) -> Result<&'a str, ProgramError> {
        function
            .strip_prefix(&self.function_prefix)
            .ok_or_else(|| ProgramError::FunctionNotFound(function.to_string()))
    }

    fn now_locked(&self, state: &LedgerState) -> u64 {
        self.clock.now().saturating_add(state.meta.clock_offset)
    }

    fn check_registry(&self, registry: &str) -> Result<(), ProgramError> {
        if registry != self.registry_address {
            return Err(ProgramError::RegistryNotFound(registry.to_string()));
        }
        Ok(())
    }

    fn run_view(&self, name: &str, args: &[Value]) -> Result<Vec<Value>, ProgramError> {
        let state = self.state();
        let now = self.now_locked(&state);
        match name {
            "get_campaign_info" => {
                let c = state.campaign(str_arg(args, 0)?)?;
                Ok(vec![
                    json!(c.creator),
                    json!(c.goal.to_string()),
                    json!(c.total_raised.to_string()),
                    json!(c.deadline.to_string()),
                    json!(c.metadata),
                    json!(c.funds_claimed),
                    json!(c.total_refunded.to_string()),
                    json!(c.escrow_balance.to_string()),
                ])
            }
            "get_backer_pledge" => {
                let c = state.campaign(str_arg(args, 0)?)?;
                let pledge = c.pledges.get(str_arg(args, 1)?).cloned().unwrap_or_default();
                Ok(vec![json!(pledge.amount.to_string()), json!(pledge.refunded)])
            }
            "get_all_campaigns" => {
                self.check_registry(str_arg(args, 0)?)?;
                Ok(vec![json!(state.registry)])
            }
            "get_total_campaigns" => {
                self.check_registry(str_arg(args, 0)?)?;
                Ok(vec![json!(state.registry.len().to_string())])
            }
            "get_campaigns_paginated" => {
                self.check_registry(str_arg(args, 0)?)?;
                let len = state.registry.len();
                let start = clamp_index(u64_arg(args, 1)?, len);
                let end = start.saturating_add(clamp_index(u64_arg(args, 2)?, len)).min(len);
                Ok(vec![json!(state.registry[start..end])])
            }
            "campaign_exists" => Ok(vec![json!(state
                .campaigns
                .contains_key(str_arg(args, 0)?))]),
            "is_campaign_active" => {
                let c = state.campaign(str_arg(args, 0)?)?;
                Ok(vec![json!(now < c.deadline && !c.funds_claimed)])
            }
            "is_campaign_successful" => {
                let c = state.campaign(str_arg(args, 0)?)?;
                Ok(vec![json!(c.total_raised >= c.goal)])
            }
            "get_progress_percentage" => {
                let c = state.campaign(str_arg(args, 0)?)?;
                let bps = if c.goal == 0 {
                    0
                } else {
                    (c.total_raised as u128 * 10_000 / c.goal as u128) as u64
                };
                Ok(vec![json!(bps.to_string())])
            }
            other => Err(ProgramError::FunctionNotFound(other.to_string())),
        }
    }

    /// Executes an entry function for `sender`. Preconditions are checked
    /// before any state is touched, so a failed call leaves no trace.
    fn execute(
        &self,
        state: &mut LedgerState,
        sender: &str,
        name: &str,
        args: &[Value],
    ) -> Result<Vec<ProgramEvent>, ProgramError> {
        let now = self.now_locked(state);
        match name {
            "create_campaign" => {
                let goal = u64_arg(args, 0)?;
                let deadline = u64_arg(args, 1)?;
                let metadata = str_arg(args, 2)?.to_string();
                self.check_registry(str_arg(args, 3)?)?;
                if goal == 0 {
                    return Err(ProgramError::InvalidGoal);
                }
                if deadline <= now {
                    return Err(ProgramError::InvalidDeadline);
                }
                let address = campaign_address(sender, &self.registry_address, state.registry.len());
                state.campaigns.insert(
                    address.clone(),
                    CampaignState {
                        address: address.clone(),
                        creator: sender.to_string(),
                        goal,
                        total_raised: 0,
                        deadline,
                        metadata,
                        funds_claimed: false,
                        total_refunded: 0,
                        escrow_balance: 0,
                        pledges: BTreeMap::new(),
                    },
                );
                state.registry.push(address.clone());
                Ok(vec![ProgramEvent::CampaignCreated {
                    campaign: address,
                    creator: sender.to_string(),
                    goal,
                    deadline,
                }])
            }
            "pledge" => {
                let campaign = str_arg(args, 0)?.to_string();
                let amount = u64_arg(args, 1)?;
                let c = state.campaign(&campaign)?;
                if now >= c.deadline {
                    return Err(ProgramError::CampaignEnded);
                }
                if c.funds_claimed {
                    return Err(ProgramError::AlreadyClaimed);
                }
                if amount == 0 {
                    return Err(ProgramError::ZeroAmount);
                }
                state.debit(sender, amount)?;
                let c = state.campaign_mut(&campaign)?;
                c.total_raised = c.total_raised.saturating_add(amount);
                c.escrow_balance = c.escrow_balance.saturating_add(amount);
                let pledge = c.pledges.entry(sender.to_string()).or_default();
                pledge.amount = pledge.amount.saturating_add(amount);
                Ok(vec![ProgramEvent::Pledged {
                    campaign,
                    backer: sender.to_string(),
                    amount,
                }])
            }
            "claim_funds" => {
                // The program resolves the campaign from the signer: every
                // funded, unclaimed campaign the signer created is paid out.
                let owned: Vec<&CampaignState> = state
                    .registry
                    .iter()
                    .filter_map(|address| state.campaigns.get(address))
                    .filter(|c| c.creator == sender)
                    .collect();
                if owned.is_empty() {
                    return Err(ProgramError::NotCreator);
                }
                let claimable: Vec<Address> = owned
                    .iter()
                    .filter(|c| !c.funds_claimed && c.total_raised >= c.goal)
                    .map(|c| c.address.clone())
                    .collect();
                if claimable.is_empty() {
                    return Err(if owned.iter().all(|c| c.funds_claimed) {
                        ProgramError::AlreadyClaimed
                    } else {
                        ProgramError::GoalNotReached
                    });
                }
                let mut events = Vec::with_capacity(claimable.len());
                for address in claimable {
                    let c = state.campaign_mut(&address)?;
                    let amount = c.escrow_balance;
                    c.funds_claimed = true;
                    c.escrow_balance = 0;
                    state.credit(sender, amount);
                    events.push(ProgramEvent::FundsClaimed {
                        campaign: address,
                        creator: sender.to_string(),
                        amount,
                    });
                }
                Ok(events)
            }
            "get_refund" => {
                let campaign = str_arg(args, 0)?.to_string();
                let c = state.campaign(&campaign)?;
                if now < c.deadline && !c.funds_claimed {
                    return Err(ProgramError::CampaignActive);
                }
                if c.total_raised >= c.goal {
                    return Err(ProgramError::GoalReached);
                }
                let pledge = c
                    .pledges
                    .get(sender)
                    .filter(|p| p.amount > 0)
                    .ok_or(ProgramError::NoPledge)?;
                if pledge.refunded {
                    return Err(ProgramError::AlreadyRefunded);
                }
                let amount = pledge.amount;
                let c = state.campaign_mut(&campaign)?;
                if let Some(pledge) = c.pledges.get_mut(sender) {
                    pledge.refunded = true;
                }
                c.total_refunded = c.total_refunded.saturating_add(amount);
                c.escrow_balance = c.escrow_balance.saturating_sub(amount);
                state.credit(sender, amount);
                Ok(vec![ProgramEvent::Refunded {
                    campaign,
                    backer: sender.to_string(),
                    amount,
                }])
            }
            other => Err(ProgramError::FunctionNotFound(other.to_string())),
        }
    }
}

impl Clock for MemoryLedger {
    fn now(&self) -> u64 {
        let state = self.state();
        self.now_locked(&state)
    }
}

impl Transport for MemoryLedger {
    fn view(&self, request: &ViewRequest) -> Result<Vec<Value>, ClientError> {
        let name = self.entry_name(&request.function)?;
        Ok(self.run_view(name, &request.arguments)?)
    }

    fn sequence_number(&self, account: &str) -> Result<u64, ClientError> {
        Ok(self.state().sequence_numbers.get(account).copied().unwrap_or(0))
    }

    /// Mempool checks (authentication, sequence number, replay) reject the
    /// transaction outright; program aborts still commit it as failed.
    fn submit(&self, transaction: &SignedTransaction) -> Result<PendingTransaction, ClientError> {
        let public_key = transaction
            .public_key_bytes()
            .map_err(|e| ClientError::Remote(format!("INVALID_AUTH_KEY: {e}")))?;
        if address_from_public_key(&public_key) != transaction.sender {
            return Err(ClientError::Remote(
                "INVALID_AUTH_KEY: public key does not own the sender account".into(),
            ));
        }
        let signature = transaction
            .signature_bytes()
            .map_err(|e| ClientError::Remote(format!("INVALID_SIGNATURE: {e}")))?;
        let message = SignedTransaction::signing_message(
            &transaction.sender,
            transaction.sequence_number,
            &transaction.payload,
        );
        if !verify_signature(&public_key, &message, &signature) {
            return Err(ClientError::Remote("INVALID_SIGNATURE".into()));
        }

        let hash = transaction.hash();
        let mut state = self.state();
        if state.transactions.contains_key(&hash) {
            return Err(ClientError::Remote("DUPLICATE_TRANSACTION".into()));
        }
        let expected = state
            .sequence_numbers
            .get(&transaction.sender)
            .copied()
            .unwrap_or(0);
        if transaction.sequence_number < expected {
            return Err(ClientError::Remote("SEQUENCE_NUMBER_TOO_OLD".into()));
        }
        if transaction.sequence_number > expected {
            return Err(ClientError::Remote("SEQUENCE_NUMBER_TOO_NEW".into()));
        }

        let outcome = self.entry_name(&transaction.payload.function).and_then(|name| {
            self.execute(
                &mut state,
                &transaction.sender,
                name,
                &transaction.payload.arguments,
            )
        });
        state
            .sequence_numbers
            .insert(transaction.sender.clone(), expected + 1);
        state.meta.version += 1;
        let version = state.meta.version;
        let info = match outcome {
            Ok(events) => {
                let wire_events = events
                    .iter()
                    .filter_map(|event| serde_json::to_value(event).ok())
                    .collect();
                state.events.extend(events);
                TransactionInfo {
                    hash: hash.clone(),
                    version,
                    success: true,
                    vm_status: "Executed successfully".into(),
                    events: wire_events,
                }
            }
            Err(err) => TransactionInfo {
                hash: hash.clone(),
                version,
                success: false,
                vm_status: err.to_string(),
                events: Vec::new(),
            },
        };
        state.transactions.insert(hash.clone(), info);
        Ok(PendingTransaction { hash })
    }

    fn wait_for_transaction(&self, hash: &str) -> Result<TransactionInfo, ClientError> {
        self.state()
            .transactions
            .get(hash)
            .cloned()
            .ok_or_else(|| ClientError::Remote(format!("TRANSACTION_NOT_FOUND: {hash}")))
    }
}

fn str_arg(args: &[Value], idx: usize) -> Result<&str, ProgramError> {
    args.get(idx)
        .and_then(Value::as_str)
        .ok_or_else(|| ProgramError::BadArgument(format!("argument {idx} must be a string")))
}

fn u64_arg(args: &[Value], idx: usize) -> Result<u64, ProgramError> {
    args.get(idx)
        .and_then(as_u64)
        .ok_or_else(|| ProgramError::BadArgument(format!("argument {idx} must be a u64")))
}

fn clamp_index(value: u64, len: usize) -> usize {
    usize::try_from(value).unwrap_or(usize::MAX).min(len)
}

fn campaign_address(creator: &str, registry: &str, index: usize) -> Address {
    let mut hasher = Sha256::new();
    hasher.update(b"campaign");
    hasher.update(registry.as_bytes());
    hasher.update(creator.as_bytes());
    hasher.update((index as u64).to_le_bytes());
    format!("0x{}", hex::encode(hasher.finalize()))
}

fn compute_state_root(
    registry: &[Address],
    campaigns: &BTreeMap<Address, CampaignState>,
    balances: &BTreeMap<Address, Octas>,
) -> String {
    let mut leaves: Vec<[u8; 32]> = Vec::new();
    for (idx, address) in registry.iter().enumerate() {
        let mut hasher = Sha256::new();
        hasher.update(b"registry");
        hasher.update((idx as u64).to_le_bytes());
        hasher.update(address.as_bytes());
        leaves.push(hasher.finalize().into());
    }
    for (address, c) in campaigns {
        let mut hasher = Sha256::new();
        hasher.update(b"campaign");
        hasher.update(address.as_bytes());
        hasher.update(c.creator.as_bytes());
        hasher.update(c.goal.to_le_bytes());
        hasher.update(c.total_raised.to_le_bytes());
        hasher.update(c.deadline.to_le_bytes());
        hasher.update(c.metadata.as_bytes());
        hasher.update([u8::from(c.funds_claimed)]);
        hasher.update(c.total_refunded.to_le_bytes());
        hasher.update(c.escrow_balance.to_le_bytes());
        for (backer, pledge) in &c.pledges {
            hasher.update(backer.as_bytes());
            hasher.update(pledge.amount.to_le_bytes());
            hasher.update([u8::from(pledge.refunded)]);
        }
        leaves.push(hasher.finalize().into());
    }
    for (account, balance) in balances {
        let mut hasher = Sha256::new();
        hasher.update(b"acct");
        hasher.update(account.as_bytes());
        hasher.update(balance.to_le_bytes());
        leaves.push(hasher.finalize().into());
    }
    hex::encode(build_merkle(leaves))
}

fn build_merkle(mut leaves: Vec<[u8; 32]>) -> [u8; 32] {
    if leaves.is_empty() {
        return Sha256::digest(b"crowdfund-ledger-empty").into();
    }
    while leaves.len() > 1 {
        let mut next: Vec<[u8; 32]> = Vec::with_capacity(leaves.len().div_ceil(2));
        for chunk in leaves.chunks(2) {
            let mut hasher = Sha256::new();
            hasher.update(b"node");
            hasher.update(chunk[0]);
            // odd leaf pairs with itself
            hasher.update(chunk.get(1).unwrap_or(&chunk[0]));
            next.push(hasher.finalize().into());
        }
        leaves = next;
    }
    leaves[0]
}
