//! Registry-wide enumeration and status filtering.

use std::{fmt, str::FromStr};

use serde::Serialize;

use crate::{
    derive::{derive_view, status_of, CampaignStatus, CampaignView},
    error::ClientError,
    fanout::bounded_map,
    record::{Address, BackerPledge, CampaignRecord},
    repository::CampaignRepository,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusFilter {
    #[default]
    All,
    Active,
    Successful,
    Failed,
}

impl StatusFilter {
    pub fn matches(&self, status: CampaignStatus) -> bool {
        match self {
            StatusFilter::All => true,
            StatusFilter::Active => status == CampaignStatus::Active,
            StatusFilter::Successful => status == CampaignStatus::Successful,
            StatusFilter::Failed => status == CampaignStatus::Failed,
        }
    }
}

impl From<CampaignStatus> for StatusFilter {
    fn from(status: CampaignStatus) -> Self {
        match status {
            CampaignStatus::Active => StatusFilter::Active,
            CampaignStatus::Successful => StatusFilter::Successful,
            CampaignStatus::Failed => StatusFilter::Failed,
        }
    }
}

impl fmt::Display for StatusFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusFilter::All => f.write_str("all"),
            StatusFilter::Active => f.write_str("active"),
            StatusFilter::Successful => f.write_str("successful"),
            StatusFilter::Failed => f.write_str("failed"),
        }
    }
}

impl FromStr for StatusFilter {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("all") {
            return Ok(StatusFilter::All);
        }
        s.parse::<CampaignStatus>().map(StatusFilter::from)
    }
}

/// Successfully fetched records split by derived status, registry order
/// kept inside each bucket.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StatusBuckets {
    pub active: Vec<CampaignRecord>,
    pub successful: Vec<CampaignRecord>,
    pub failed: Vec<CampaignRecord>,
}

impl StatusBuckets {
    pub fn len(&self) -> usize {
        self.active.len() + self.successful.len() + self.failed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bucket(&self, status: CampaignStatus) -> &[CampaignRecord] {
        match status {
            CampaignStatus::Active => &self.active,
            CampaignStatus::Successful => &self.successful,
            CampaignStatus::Failed => &self.failed,
        }
    }
}

/// One row of a listing: the record and everything derived from it.
#[derive(Clone, Debug, Serialize)]
pub struct CampaignSummary {
    pub record: CampaignRecord,
    pub view: CampaignView,
}

pub struct DiscoveryIndex<'a> {
    repository: &'a CampaignRepository,
    window: usize,
}

impl<'a> DiscoveryIndex<'a> {
    /// Fan-out is bounded by the configured `max_in_flight`.
    pub fn new(repository: &'a CampaignRepository) -> Self {
        let window = repository.client().config().max_in_flight;
        Self { repository, window }
    }

    pub fn with_window(repository: &'a CampaignRepository, window: usize) -> Self {
        Self {
            repository,
            window: window.max(1),
        }
    }

    /// Fetches every address concurrently, keeping input order and dropping
    /// the ones whose read failed.
    pub fn load_records(&self, addresses: &[Address]) -> Vec<CampaignRecord> {
        bounded_map(addresses, self.window, |address| {
            self.repository.get_campaign(address)
        })
        .into_iter()
        .flatten()
        .collect()
    }

    pub fn filter_by_status(
        &self,
        addresses: &[Address],
        filter: StatusFilter,
        now: u64,
    ) -> Vec<Address> {
        self.load_records(addresses)
            .into_iter()
            .filter(|record| filter.matches(status_of(record, now)))
            .map(|record| record.address)
            .collect()
    }

    pub fn partition(&self, addresses: &[Address], now: u64) -> StatusBuckets {
        let mut buckets = StatusBuckets::default();
        for record in self.load_records(addresses) {
            match status_of(&record, now) {
                CampaignStatus::Active => buckets.active.push(record),
                CampaignStatus::Successful => buckets.successful.push(record),
                CampaignStatus::Failed => buckets.failed.push(record),
            }
        }
        buckets
    }

    /// Registry page `[start, start + limit)` filtered by status. The filter
    /// applies after paging, so a page may come back shorter than `limit`.
    pub fn page(&self, start: u64, limit: u64, filter: StatusFilter, now: u64) -> Vec<Address> {
        let addresses = self.repository.list_paged(start, limit);
        self.filter_by_status(&addresses, filter, now)
    }

    /// Listing rows with views derived for `viewer`. Pledges are fetched
    /// only when a viewer is known.
    pub fn summaries(
        &self,
        addresses: &[Address],
        filter: StatusFilter,
        now: u64,
        viewer: Option<&str>,
    ) -> Vec<CampaignSummary> {
        let records: Vec<CampaignRecord> = self
            .load_records(addresses)
            .into_iter()
            .filter(|record| filter.matches(status_of(record, now)))
            .collect();
        bounded_map(&records, self.window, |record| {
            let pledge = viewer
                .map(|viewer| self.repository.get_pledge(&record.address, viewer))
                .unwrap_or_else(BackerPledge::default);
            CampaignSummary {
                view: derive_view(record, now, viewer, &pledge),
                record: record.clone(),
            }
        })
    }
}
