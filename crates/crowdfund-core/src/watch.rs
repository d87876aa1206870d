//! Stale-response guard for the campaign being viewed.
//!
//! Changing focus bumps a generation counter. A fetch carries the ticket it
//! was started with and its result is applied only if that ticket is still
//! current; anything older is dropped.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

use crate::{
    clock::Clock,
    derive::{derive_view, CampaignView},
    record::{Address, BackerPledge, CampaignRecord},
    repository::CampaignRepository,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ticket {
    pub campaign: Address,
    pub generation: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Resolution<T> {
    Applied(T),
    Stale,
}

impl<T> Resolution<T> {
    pub fn applied(self) -> Option<T> {
        match self {
            Resolution::Applied(value) => Some(value),
            Resolution::Stale => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CampaignSnapshot {
    pub campaign: Address,
    pub generation: u64,
    pub fetched_at: u64,
    pub record: Option<CampaignRecord>,
    pub pledge: BackerPledge,
    pub view: Option<CampaignView>,
}

#[derive(Default)]
struct WatchState {
    focus: Option<Address>,
    generation: u64,
    current: Option<CampaignSnapshot>,
}

pub struct CampaignWatcher {
    repository: Arc<CampaignRepository>,
    clock: Arc<dyn Clock>,
    state: Mutex<WatchState>,
}

impl CampaignWatcher {
    pub fn new(repository: Arc<CampaignRepository>, clock: Arc<dyn Clock>) -> Self {
        Self {
            repository,
            clock,
            state: Mutex::new(WatchState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, WatchState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Switches the viewed campaign and invalidates every outstanding ticket.
    pub fn focus(&self, campaign: &str) -> Ticket {
        let mut state = self.state();
        state.generation += 1;
        state.focus = Some(campaign.to_string());
        state.current = None;
        Ticket {
            campaign: campaign.to_string(),
            generation: state.generation,
        }
    }

    pub fn focused(&self) -> Option<Address> {
        self.state().focus.clone()
    }

    pub fn is_current(&self, ticket: &Ticket) -> bool {
        self.state().generation == ticket.generation
    }

    pub fn current(&self) -> Option<CampaignSnapshot> {
        self.state().current.clone()
    }

    /// Reads the ticket's campaign (and the viewer's pledge) and applies the
    /// result unless focus moved on meanwhile.
    pub fn fetch(&self, ticket: &Ticket, viewer: Option<&str>) -> Resolution<CampaignSnapshot> {
        let (record, pledge) = self.repository.refresh(&ticket.campaign, viewer);
        let pledge = pledge.unwrap_or_default();
        let now = self.clock.now();
        let view = record
            .as_ref()
            .map(|record| derive_view(record, now, viewer, &pledge));
        self.apply(
            ticket,
            CampaignSnapshot {
                campaign: ticket.campaign.clone(),
                generation: ticket.generation,
                fetched_at: now,
                record,
                pledge,
                view,
            },
        )
    }

    pub fn apply(&self, ticket: &Ticket, snapshot: CampaignSnapshot) -> Resolution<CampaignSnapshot> {
        let mut state = self.state();
        if state.generation != ticket.generation {
            return Resolution::Stale;
        }
        state.current = Some(snapshot.clone());
        Resolution::Applied(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        derive::CampaignStatus,
        signer::Signer,
        testing::{Fixture, FlakyTransport},
    };
    use std::{thread, time::Duration};

    #[test]
    fn fetch_applies_for_the_current_focus() {
        let fx = Fixture::new();
        let campaign = fx.create_campaign(100, 1_000, "A");
        fx.pledge(&campaign, 60);
        let watcher = CampaignWatcher::new(Arc::new(fx.repository()), fx.ledger.clone());

        let ticket = watcher.focus(&campaign);
        let snapshot = watcher
            .fetch(&ticket, Some(fx.backer.address()))
            .applied()
            .unwrap();
        assert_eq!(snapshot.pledge.amount, 60);
        let view = snapshot.view.unwrap();
        assert_eq!(view.status, CampaignStatus::Active);
        assert_eq!(view.progress_percent, 60.0);
        assert_eq!(watcher.current().unwrap().campaign, campaign);
    }

    #[test]
    fn refocus_discards_the_older_response() {
        let fx = Fixture::new();
        let first = fx.create_campaign(100, 1_000, "first");
        let second = fx.create_campaign(100, 1_000, "second");
        let watcher = CampaignWatcher::new(Arc::new(fx.repository()), fx.ledger.clone());

        let old = watcher.focus(&first);
        let new = watcher.focus(&second);
        assert!(!watcher.is_current(&old));
        assert_eq!(watcher.fetch(&old, None), Resolution::Stale);
        assert!(watcher.current().is_none());

        let applied = watcher.fetch(&new, None).applied().unwrap();
        assert_eq!(applied.record.unwrap().metadata.title, "second");
        assert_eq!(watcher.focused(), Some(second));
    }

    #[test]
    fn slow_fetch_loses_to_a_focus_change() {
        let fx = Fixture::new();
        let first = fx.create_campaign(100, 1_000, "first");
        let second = fx.create_campaign(100, 1_000, "second");
        let flaky = FlakyTransport::wrap(fx.ledger.clone());
        flaky.set_latency(Duration::from_millis(100));
        let watcher = CampaignWatcher::new(Arc::new(fx.repository_over(flaky)), fx.ledger.clone());

        let ticket = watcher.focus(&first);
        let outcome = thread::scope(|s| {
            let pending = s.spawn(|| watcher.fetch(&ticket, None));
            thread::sleep(Duration::from_millis(30));
            watcher.focus(&second);
            pending.join().unwrap()
        });
        assert_eq!(outcome, Resolution::Stale);
        assert!(watcher.current().is_none());
    }

    #[test]
    fn missing_campaign_yields_an_empty_snapshot() {
        let fx = Fixture::new();
        let watcher = CampaignWatcher::new(Arc::new(fx.repository()), fx.ledger.clone());
        let ticket = watcher.focus("0xdead");
        let snapshot = watcher.fetch(&ticket, None).applied().unwrap();
        assert!(snapshot.record.is_none());
        assert!(snapshot.view.is_none());
        assert_eq!(snapshot.pledge, BackerPledge::default());
    }
}
