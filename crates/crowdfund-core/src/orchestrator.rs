//! Write path: submit, await confirmation, refresh.
//!
//! Every operation walks `Idle -> Submitting -> Confirmed -> Refreshing ->
//! Idle`, or `Submitting -> Failed` when the wallet, the network or the
//! program says no. `Failed` stays reported until the slot is used again. A
//! failed write never touches the repository cache; the caller gets the
//! remote reason verbatim.
//!
//! Slots are keyed per (target, kind). The target is the campaign for
//! pledges and refunds, the signer for claims (`claim_funds()` acts on all
//! of the signer's campaigns) and the registry for creation.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::{
    client::TransactionInfo,
    clock::Clock,
    error::ClientError,
    metadata::CampaignMetadata,
    record::{normalize_address, Address, BackerPledge, CampaignRecord},
    repository::CampaignRepository,
    signer::Session,
    units::{format_display, to_raw, Octas, MIN_GOAL},
};

const SECS_PER_DAY: u64 = 24 * 60 * 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TxKind {
    Create,
    Pledge,
    Claim,
    Refund,
}

impl TxKind {
    /// Program entry point submitted for this kind.
    pub fn entry_point(&self) -> &'static str {
        match self {
            TxKind::Create => "create_campaign",
            TxKind::Pledge => "pledge",
            TxKind::Claim => "claim_funds",
            TxKind::Refund => "get_refund",
        }
    }
}

impl fmt::Display for TxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TxKind::Create => "create",
            TxKind::Pledge => "pledge",
            TxKind::Claim => "claim",
            TxKind::Refund => "refund",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TxPhase {
    Idle,
    Submitting,
    Confirmed,
    Refreshing,
    Failed,
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum TxError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("a {kind} for {target} is already in flight")]
    InFlight { target: Address, kind: TxKind },
}

/// What a confirmed write left behind: the committed transaction and the
/// freshly re-read state it affected.
#[derive(Clone, Debug, Serialize)]
pub struct TxReceipt {
    pub kind: TxKind,
    pub campaign: Address,
    pub hash: String,
    pub version: u64,
    /// `None` when the post-confirmation read failed.
    pub record: Option<CampaignRecord>,
    /// The viewer's pledge, when the session carries an identity.
    pub pledge: Option<BackerPledge>,
}

/// Input for `create_campaign`.
#[derive(Clone, Debug, PartialEq)]
pub struct CampaignDraft {
    pub title: String,
    pub description: String,
    pub goal: Octas,
    pub duration_days: u64,
}

impl CampaignDraft {
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.title.trim().is_empty() {
            return Err(ClientError::InvalidInput("title must not be empty".into()));
        }
        if self.goal < MIN_GOAL {
            return Err(ClientError::InvalidInput(format!(
                "goal must be at least {} APT",
                format_display(MIN_GOAL)
            )));
        }
        if self.duration_days == 0 {
            return Err(ClientError::InvalidInput(
                "duration must be at least one day".into(),
            ));
        }
        Ok(())
    }

    pub fn deadline(&self, now: u64) -> u64 {
        now.saturating_add(self.duration_days.saturating_mul(SECS_PER_DAY))
    }

    pub fn metadata(&self) -> CampaignMetadata {
        CampaignMetadata::new(self.title.trim(), self.description.trim())
    }
}

type PhaseKey = (Address, TxKind);

/// Called after every phase change with the slot's target and kind.
pub type PhaseObserver = Box<dyn Fn(&str, TxKind, TxPhase) + Send + Sync>;

/// Marks one slot busy. On drop the slot returns to `Idle` unless the
/// operation failed.
struct InFlight<'a> {
    owner: &'a TransactionOrchestrator,
    key: PhaseKey,
}

impl InFlight<'_> {
    fn set(&self, phase: TxPhase) {
        lock(&self.owner.phases).insert(self.key.clone(), phase);
        self.owner.notify(&self.key, phase);
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let released = {
            let mut phases = lock(&self.owner.phases);
            if phases.get(&self.key) == Some(&TxPhase::Failed) {
                false
            } else {
                phases.remove(&self.key).is_some()
            }
        };
        if released {
            self.owner.notify(&self.key, TxPhase::Idle);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct TransactionOrchestrator {
    repository: Arc<CampaignRepository>,
    clock: Arc<dyn Clock>,
    phases: Mutex<HashMap<PhaseKey, TxPhase>>,
    observer: Option<PhaseObserver>,
}

impl TransactionOrchestrator {
    pub fn new(repository: Arc<CampaignRepository>, clock: Arc<dyn Clock>) -> Self {
        Self {
            repository,
            clock,
            phases: Mutex::new(HashMap::new()),
            observer: None,
        }
    }

    pub fn observe(
        mut self,
        observer: impl Fn(&str, TxKind, TxPhase) + Send + Sync + 'static,
    ) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn repository(&self) -> &CampaignRepository {
        &self.repository
    }

    /// Current phase of a slot; see the module docs for what `target` is.
    pub fn phase(&self, target: &str, kind: TxKind) -> TxPhase {
        let Ok(target) = normalize_address(target) else {
            return TxPhase::Idle;
        };
        lock(&self.phases)
            .get(&(target, kind))
            .copied()
            .unwrap_or(TxPhase::Idle)
    }

    fn notify(&self, key: &PhaseKey, phase: TxPhase) {
        if let Some(observer) = &self.observer {
            observer(&key.0, key.1, phase);
        }
    }

    /// Pledges a display amount. The amount is truncated to whole octas.
    pub fn pledge(
        &self,
        session: &Session,
        campaign: &str,
        display_amount: f64,
    ) -> Result<TxReceipt, TxError> {
        if !display_amount.is_finite() || display_amount <= 0.0 {
            return Err(ClientError::InvalidInput(format!(
                "pledge amount must be a positive number, got {display_amount}"
            ))
            .into());
        }
        self.pledge_raw(session, campaign, to_raw(display_amount))
    }

    pub fn pledge_raw(
        &self,
        session: &Session,
        campaign: &str,
        amount: Octas,
    ) -> Result<TxReceipt, TxError> {
        if amount == 0 {
            return Err(
                ClientError::InvalidInput("pledge amount is below one octa".into()).into(),
            );
        }
        let campaign = normalize_address(campaign)?;
        let arguments = vec![json!(campaign), json!(amount.to_string())];
        self.run(session, campaign, TxKind::Pledge, arguments)
    }

    /// `claim_funds()` carries no campaign argument; the program pays out
    /// every funded campaign the signer created. `campaign` selects what is
    /// refreshed afterwards, and the slot is held per signer.
    pub fn claim(&self, session: &Session, campaign: &str) -> Result<TxReceipt, TxError> {
        let campaign = normalize_address(campaign)?;
        self.run(session, campaign, TxKind::Claim, Vec::new())
    }

    pub fn refund(&self, session: &Session, campaign: &str) -> Result<TxReceipt, TxError> {
        let campaign = normalize_address(campaign)?;
        let arguments = vec![json!(campaign)];
        self.run(session, campaign, TxKind::Refund, arguments)
    }

    /// Creates a campaign ending `duration_days` from now and reports the
    /// new address, taken from the creation event or, failing that, the
    /// re-read registry tail.
    pub fn create(&self, session: &Session, draft: &CampaignDraft) -> Result<TxReceipt, TxError> {
        draft.validate()?;
        let signer = session.signer().ok_or(ClientError::NotConnected)?;
        let registry = self.repository.client().config().registry_address().to_string();
        let slot = self.begin(&registry, TxKind::Create)?;
        let arguments = vec![
            json!(draft.goal.to_string()),
            json!(draft.deadline(self.clock.now()).to_string()),
            json!(draft.metadata().to_blob()),
            json!(registry),
        ];
        let info = match self.submit_and_confirm(TxKind::Create, arguments, session) {
            Ok(info) => info,
            Err(err) => {
                slot.set(TxPhase::Failed);
                return Err(err.into());
            }
        };
        slot.set(TxPhase::Confirmed);
        slot.set(TxPhase::Refreshing);
        let listed = self.repository.list_all();
        let campaign = info
            .created_campaign()
            .or_else(|| listed.last().cloned())
            .ok_or_else(|| {
                ClientError::Remote(format!(
                    "transaction {} committed but no campaign was registered",
                    info.hash
                ))
            })?;
        let (record, pledge) = self.repository.refresh(&campaign, Some(signer.address()));
        Ok(TxReceipt {
            kind: TxKind::Create,
            campaign,
            hash: info.hash,
            version: info.version,
            record,
            pledge,
        })
    }

    fn begin(&self, target: &str, kind: TxKind) -> Result<InFlight<'_>, TxError> {
        let key = (normalize_address(target)?, kind);
        {
            let mut phases = lock(&self.phases);
            match phases.get(&key) {
                None | Some(TxPhase::Idle) | Some(TxPhase::Failed) => {}
                Some(_) => {
                    return Err(TxError::InFlight {
                        target: key.0,
                        kind,
                    })
                }
            }
            phases.insert(key.clone(), TxPhase::Submitting);
        }
        self.notify(&key, TxPhase::Submitting);
        Ok(InFlight { owner: self, key })
    }

    fn submit_and_confirm(
        &self,
        kind: TxKind,
        arguments: Vec<Value>,
        session: &Session,
    ) -> Result<TransactionInfo, ClientError> {
        let client = self.repository.client();
        let pending = client.submit(kind.entry_point(), arguments, session.signer())?;
        client.await_confirmation(&pending)
    }

    fn run(
        &self,
        session: &Session,
        campaign: Address,
        kind: TxKind,
        arguments: Vec<Value>,
    ) -> Result<TxReceipt, TxError> {
        let signer = session.signer().ok_or(ClientError::NotConnected)?;
        let target = match kind {
            TxKind::Claim => signer.address().to_string(),
            _ => campaign.clone(),
        };
        let slot = self.begin(&target, kind)?;
        let info = match self.submit_and_confirm(kind, arguments, session) {
            Ok(info) => info,
            Err(err) => {
                slot.set(TxPhase::Failed);
                return Err(err.into());
            }
        };
        slot.set(TxPhase::Confirmed);
        slot.set(TxPhase::Refreshing);
        let (record, pledge) = self.repository.refresh(&campaign, session.identity());
        Ok(TxReceipt {
            kind,
            campaign,
            hash: info.hash,
            version: info.version,
            record,
            pledge,
        })
    }
}
