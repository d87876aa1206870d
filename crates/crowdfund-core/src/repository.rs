use std::{
    collections::{HashMap, VecDeque},
    hash::Hash,
    sync::{Mutex, MutexGuard},
};

use serde_json::{json, Value};

use crate::{
    client::LedgerClient,
    error::ClientError,
    record::{address_list, Address, BackerPledge, CampaignRecord},
};

/// Entries kept per kind in the snapshot cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// Map that forgets its oldest entry once `capacity` is reached.
struct BoundedMap<K, V> {
    entries: HashMap<K, V>,
    order: VecDeque<K>,
    capacity: usize,
}

impl<K: Clone + Eq + Hash, V> BoundedMap<K, V> {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn insert(&mut self, key: K, value: V) {
        if self.entries.insert(key.clone(), value).is_some() {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }
}

/// Last successfully fetched snapshots. Failed reads never touch it.
struct SnapshotCache {
    campaigns: BoundedMap<Address, CampaignRecord>,
    pledges: BoundedMap<(Address, Address), BackerPledge>,
}

impl SnapshotCache {
    fn new(capacity: usize) -> Self {
        Self {
            campaigns: BoundedMap::new(capacity),
            pledges: BoundedMap::new(capacity),
        }
    }
}

/// Typed reads over the ledger program.
///
/// Every read comes in two flavours: `try_*` returns the structured
/// `Result`, the plain method logs the failure and degrades to the typed
/// default (absent record, empty list, zero pledge).
pub struct CampaignRepository {
    client: LedgerClient,
    cache: Mutex<SnapshotCache>,
}

impl CampaignRepository {
    pub fn new(client: LedgerClient) -> Self {
        Self::with_cache_capacity(client, DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_cache_capacity(client: LedgerClient, capacity: usize) -> Self {
        Self {
            client,
            cache: Mutex::new(SnapshotCache::new(capacity)),
        }
    }

    pub fn client(&self) -> &LedgerClient {
        &self.client
    }

    fn registry_arg(&self) -> Value {
        json!(self.client.config().registry_address())
    }

    fn cache(&self) -> MutexGuard<'_, SnapshotCache> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn degrade<T>(&self, query: &str, subject: &str, result: Result<T, ClientError>, default: T) -> T {
        match result {
            Ok(value) => value,
            Err(err) => {
                if !self.client.config().quiet {
                    eprintln!("warn: {query}({subject}) failed: {err}");
                }
                default
            }
        }
    }

    pub fn try_get_campaign(&self, address: &str) -> Result<CampaignRecord, ClientError> {
        let values = self.client.query("get_campaign_info", vec![json!(address)])?;
        let record = CampaignRecord::from_view(address, &values)?;
        self.cache()
            .campaigns
            .insert(address.to_string(), record.clone());
        Ok(record)
    }

    pub fn get_campaign(&self, address: &str) -> Option<CampaignRecord> {
        let result = self.try_get_campaign(address).map(Some);
        self.degrade("get_campaign_info", address, result, None)
    }

    pub fn try_list_all(&self) -> Result<Vec<Address>, ClientError> {
        let values = self
            .client
            .query("get_all_campaigns", vec![self.registry_arg()])?;
        address_list("get_all_campaigns", &values)
    }

    pub fn list_all(&self) -> Vec<Address> {
        let result = self.try_list_all();
        self.degrade(
            "get_all_campaigns",
            self.client.config().registry_address(),
            result,
            Vec::new(),
        )
    }

    pub fn try_total_campaigns(&self) -> Result<u64, ClientError> {
        self.client
            .query_u64("get_total_campaigns", vec![self.registry_arg()])
    }

    pub fn total_campaigns(&self) -> u64 {
        let result = self.try_total_campaigns();
        self.degrade(
            "get_total_campaigns",
            self.client.config().registry_address(),
            result,
            0,
        )
    }

    /// Contiguous registry slice `[start, start + limit)`, clipped to the
    /// registry length. Out-of-range starts give an empty slice.
    pub fn try_list_paged(&self, start: u64, limit: u64) -> Result<Vec<Address>, ClientError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let values = self.client.query(
            "get_campaigns_paginated",
            vec![self.registry_arg(), json!(start.to_string()), json!(limit.to_string())],
        )?;
        let mut page = address_list("get_campaigns_paginated", &values)?;
        page.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(page)
    }

    pub fn list_paged(&self, start: u64, limit: u64) -> Vec<Address> {
        let result = self.try_list_paged(start, limit);
        self.degrade(
            "get_campaigns_paginated",
            &format!("{start}, {limit}"),
            result,
            Vec::new(),
        )
    }

    pub fn try_get_pledge(&self, campaign: &str, backer: &str) -> Result<BackerPledge, ClientError> {
        let values = self
            .client
            .query("get_backer_pledge", vec![json!(campaign), json!(backer)])?;
        let pledge = BackerPledge::from_view(&values)?;
        self.cache()
            .pledges
            .insert((campaign.to_string(), backer.to_string()), pledge);
        Ok(pledge)
    }

    /// Zero pledge when absent or when the read failed; the two are not
    /// distinguished here (use [`Self::try_get_pledge`] for that).
    pub fn get_pledge(&self, campaign: &str, backer: &str) -> BackerPledge {
        let result = self.try_get_pledge(campaign, backer);
        self.degrade(
            "get_backer_pledge",
            &format!("{campaign}, {backer}"),
            result,
            BackerPledge::default(),
        )
    }

    pub fn campaign_exists(&self, address: &str) -> bool {
        let result = self.client.query_bool("campaign_exists", vec![json!(address)]);
        self.degrade("campaign_exists", address, result, false)
    }

    /// Ledger-side activity flag. Display logic uses the client-side
    /// derivation instead; this is kept for cross-checking.
    pub fn is_campaign_active(&self, address: &str) -> bool {
        let result = self
            .client
            .query_bool("is_campaign_active", vec![json!(address)]);
        self.degrade("is_campaign_active", address, result, false)
    }

    pub fn is_campaign_successful(&self, address: &str) -> bool {
        let result = self
            .client
            .query_bool("is_campaign_successful", vec![json!(address)]);
        self.degrade("is_campaign_successful", address, result, false)
    }

    /// Ledger-reported progress in percent (basis points / 100).
    pub fn reported_progress_percent(&self, address: &str) -> f64 {
        let result = self
            .client
            .query_u64("get_progress_percentage", vec![json!(address)])
            .map(|bps| bps as f64 / 100.0);
        self.degrade("get_progress_percentage", address, result, 0.0)
    }

    /// Re-reads the record and, when a backer is given, their pledge.
    pub fn refresh(
        &self,
        campaign: &str,
        backer: Option<&str>,
    ) -> (Option<CampaignRecord>, Option<BackerPledge>) {
        let record = self.get_campaign(campaign);
        let pledge = backer.map(|backer| self.get_pledge(campaign, backer));
        (record, pledge)
    }

    /// Last record read successfully, for callers that keep showing it
    /// while a newer read fails. Oldest entries are evicted first.
    pub fn cached_campaign(&self, address: &str) -> Option<CampaignRecord> {
        self.cache().campaigns.get(&address.to_string()).cloned()
    }

    pub fn cached_pledge(&self, campaign: &str, backer: &str) -> Option<BackerPledge> {
        self.cache()
            .pledges
            .get(&(campaign.to_string(), backer.to_string()))
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        signer::Signer,
        testing::{test_config, Fixture, FlakyTransport},
    };

    #[test]
    fn reads_campaign_and_pledge() {
        let fx = Fixture::new();
        let campaign = fx.create_campaign(100, 1_000, "Save the Ocean");
        fx.pledge(&campaign, 40);
        let repo = fx.repository();

        let record = repo.get_campaign(&campaign).unwrap();
        assert_eq!(record.goal, 100);
        assert_eq!(record.total_raised, 40);
        assert_eq!(record.creator, fx.creator.address());
        assert_eq!(record.metadata.title, "Save the Ocean");

        let pledge = repo.get_pledge(&campaign, fx.backer.address());
        assert_eq!(pledge, BackerPledge { amount: 40, refunded: false });
        assert_eq!(repo.reported_progress_percent(&campaign), 40.0);
        assert!(repo.campaign_exists(&campaign));
        assert!(repo.is_campaign_active(&campaign));
    }

    #[test]
    fn missing_records_degrade_to_defaults() {
        let fx = Fixture::new();
        let repo = fx.repository();
        assert!(repo.get_campaign("0xdead").is_none());
        assert!(repo.try_get_campaign("0xdead").is_err());
        assert_eq!(repo.get_pledge("0xdead", "0xbeef"), BackerPledge::default());
        assert!(!repo.campaign_exists("0xdead"));
        assert_eq!(repo.reported_progress_percent("0xdead"), 0.0);
    }

    #[test]
    fn no_pledge_is_a_zero_pledge() {
        let fx = Fixture::new();
        let campaign = fx.create_campaign(100, 1_000, "A");
        let repo = fx.repository();
        let pledge = repo.try_get_pledge(&campaign, "0x123").unwrap();
        assert_eq!(pledge, BackerPledge::default());
    }

    #[test]
    fn paging_returns_contiguous_slices_in_registry_order() {
        let fx = Fixture::new();
        let all: Vec<_> = (0..5)
            .map(|i| fx.create_campaign(100, 1_000, &format!("c{i}")))
            .collect();
        let repo = fx.repository();
        assert_eq!(repo.list_all(), all);
        assert_eq!(repo.total_campaigns(), 5);
        assert_eq!(repo.list_paged(0, 2), all[0..2].to_vec());
        assert_eq!(repo.list_paged(2, 2), all[2..4].to_vec());
        assert_eq!(repo.list_paged(4, 2), all[4..5].to_vec());
        assert!(repo.list_paged(5, 2).is_empty());
        assert!(repo.list_paged(99, 2).is_empty());
        assert!(repo.list_paged(0, 0).is_empty());
    }

    #[test]
    fn failed_refresh_keeps_the_cached_snapshot() {
        let fx = Fixture::new();
        let campaign = fx.create_campaign(100, 1_000, "A");
        let flaky = FlakyTransport::wrap(fx.ledger.clone());
        let repo = fx.repository_over(flaky.clone());

        let first = repo.get_campaign(&campaign).unwrap();
        fx.pledge(&campaign, 10);
        flaky.fail_address(&campaign);
        let (record, _) = repo.refresh(&campaign, None);
        assert!(record.is_none());
        assert_eq!(repo.cached_campaign(&campaign), Some(first));

        flaky.heal();
        let (record, pledge) = repo.refresh(&campaign, Some(fx.backer.address()));
        assert_eq!(record.unwrap().total_raised, 10);
        assert_eq!(pledge.unwrap().amount, 10);
        assert_eq!(
            repo.cached_pledge(&campaign, fx.backer.address()).unwrap().amount,
            10
        );
    }

    #[test]
    fn snapshot_cache_forgets_the_oldest_entries() {
        let fx = Fixture::new();
        let campaigns: Vec<_> = (0..3)
            .map(|i| fx.create_campaign(100, 1_000, &format!("c{i}")))
            .collect();
        let repo = CampaignRepository::with_cache_capacity(
            LedgerClient::new(fx.ledger.clone(), test_config()),
            2,
        );
        for campaign in &campaigns {
            assert!(repo.get_campaign(campaign).is_some());
        }
        assert!(repo.cached_campaign(&campaigns[0]).is_none());
        assert!(repo.cached_campaign(&campaigns[1]).is_some());
        assert!(repo.cached_campaign(&campaigns[2]).is_some());

        // re-reading a cached campaign does not grow the cache
        assert!(repo.get_campaign(&campaigns[2]).is_some());
        assert!(repo.cached_campaign(&campaigns[1]).is_some());
    }
}
