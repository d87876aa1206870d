//! Client core for the crowdfund ledger program.
//!
//! Reads flow `LedgerClient -> CampaignRepository -> derive` and come back
//! as typed records plus a derived [`CampaignView`]; writes flow through the
//! [`TransactionOrchestrator`], which submits, waits for the commit and
//! re-reads what changed. [`MemoryLedger`] implements the program itself for
//! development and tests.

pub mod client;
pub mod clock;
pub mod config;
pub mod derive;
pub mod discovery;
pub mod error;
pub mod fanout;
pub mod http;
pub mod memory;
pub mod metadata;
pub mod orchestrator;
pub mod record;
pub mod repository;
pub mod signer;
pub mod suggest;
pub mod units;
pub mod watch;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{LedgerClient, Transport};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ClientConfig, ConfigError, RetryPolicy};
pub use derive::{derive_view, CampaignStatus, CampaignView};
pub use discovery::{DiscoveryIndex, StatusFilter};
pub use error::{ClientError, ErrorKind};
pub use memory::{MemoryLedger, ProgramError, StoreError};
pub use metadata::CampaignMetadata;
pub use orchestrator::{CampaignDraft, TransactionOrchestrator, TxError, TxKind, TxPhase, TxReceipt};
pub use record::{Address, BackerPledge, CampaignRecord};
pub use repository::CampaignRepository;
pub use signer::{Session, Signer, WalletSigner};
pub use suggest::{HttpSuggestProxy, SuggestionClient, SuggestionRequest};
pub use units::Octas;
pub use watch::CampaignWatcher;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        testing::{test_config, Fixture, FlakyTransport, START},
        units::{format_display, parse_display, to_display, OCTAS_PER_APT},
    };
    use std::sync::Arc;

    #[test]
    fn pledge_one_and_a_half_updates_total_raised() {
        let fx = Fixture::new();
        let repository = Arc::new(fx.repository());
        let orchestrator = TransactionOrchestrator::new(repository.clone(), fx.ledger.clone());
        let creator = Session::connected(Arc::new(fx.creator.clone()));
        let backer = Session::connected(Arc::new(fx.backer.clone()));

        let created = orchestrator
            .create(
                &creator,
                &CampaignDraft {
                    title: "Library roof".into(),
                    description: "Fix the leak before winter".into(),
                    goal: parse_display("10").unwrap(),
                    duration_days: 7,
                },
            )
            .unwrap();
        let campaign = created.campaign;

        let receipt = orchestrator.pledge(&backer, &campaign, 1.5).unwrap();
        let record = receipt.record.unwrap();
        assert_eq!(record.total_raised, 150_000_000);
        assert_eq!(to_display(record.total_raised), 1.5);
        assert_eq!(format_display(record.total_raised), "1.50");

        let view = derive_view(&record, fx.ledger.now(), backer.identity(), &receipt.pledge.unwrap());
        assert_eq!(view.status, CampaignStatus::Active);
        assert_eq!(view.progress_percent, 15.0);
        assert_eq!(repository.reported_progress_percent(&campaign), 15.0);
        assert!(view.can_pledge);
        assert!(!view.can_claim && !view.can_refund);
    }

    #[test]
    fn discovery_over_three_addresses_with_one_failing_fetch() {
        let fx = Fixture::new();
        let active = fx.create_campaign(OCTAS_PER_APT, 10 * 86_400, "open");
        let failed = fx.create_campaign(OCTAS_PER_APT, 60, "expired");
        let unreachable = fx.create_campaign(OCTAS_PER_APT, 10 * 86_400, "offline");
        fx.clock.advance(60);

        let flaky = FlakyTransport::wrap(fx.ledger.clone());
        flaky.fail_address(&unreachable);
        let repository = CampaignRepository::new(LedgerClient::new(flaky, test_config()));
        let index = DiscoveryIndex::new(&repository);
        let addresses = vec![active.clone(), failed.clone(), unreachable];
        let now = START + 60;

        assert_eq!(
            index.filter_by_status(&addresses, StatusFilter::All, now),
            vec![active.clone(), failed]
        );
        assert_eq!(
            index.filter_by_status(&addresses, StatusFilter::Active, now),
            vec![active]
        );
    }

    #[test]
    fn full_lifecycle_from_pledges_to_claim() {
        let fx = Fixture::new();
        let repository = Arc::new(fx.repository());
        let orchestrator = TransactionOrchestrator::new(repository.clone(), fx.ledger.clone());
        let creator = Session::connected(Arc::new(fx.creator.clone()));
        let backer = Session::connected(Arc::new(fx.backer.clone()));
        let campaign = fx.create_campaign(2 * OCTAS_PER_APT, 86_400, "Robotics club");

        orchestrator.pledge(&backer, &campaign, 1.25).unwrap();
        orchestrator.pledge(&backer, &campaign, 0.75).unwrap();
        fx.clock.advance(86_400);

        let record = repository.get_campaign(&campaign).unwrap();
        let now = fx.ledger.now();
        let creator_view = derive_view(&record, now, creator.identity(), &BackerPledge::default());
        assert_eq!(creator_view.status, CampaignStatus::Successful);
        assert!(creator_view.can_claim);

        let claimed = orchestrator.claim(&creator, &campaign).unwrap();
        let record = claimed.record.unwrap();
        assert!(record.funds_claimed);
        let after = derive_view(&record, now, creator.identity(), &BackerPledge::default());
        assert_eq!(after.status, CampaignStatus::Successful);
        assert!(!after.can_claim);
        assert!(repository.is_campaign_successful(&campaign));
        assert!(!repository.is_campaign_active(&campaign));
    }
}
