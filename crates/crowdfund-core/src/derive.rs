//! Campaign lifecycle derivation.
//!
//! The single source of truth for status and permissions. Every function
//! here is pure and total: the inputs are a record snapshot, the current
//! time and the viewer, and no combination of them can fail.
//!
//! Progress is recomputed from `total_raised / goal` rather than taken from
//! the ledger's basis-point query, so status and progress always agree on
//! the same snapshot.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    error::ClientError,
    record::{same_address, BackerPledge, CampaignRecord},
    units::Octas,
};

const SECS_PER_DAY: u64 = 24 * 60 * 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Active,
    Successful,
    Failed,
}

impl CampaignStatus {
    pub const ALL: [CampaignStatus; 3] = [
        CampaignStatus::Active,
        CampaignStatus::Successful,
        CampaignStatus::Failed,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            CampaignStatus::Active => "active",
            CampaignStatus::Successful => "successful",
            CampaignStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.label())
    }
}

impl FromStr for CampaignStatus {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(CampaignStatus::Active),
            "successful" => Ok(CampaignStatus::Successful),
            "failed" => Ok(CampaignStatus::Failed),
            other => Err(ClientError::InvalidInput(format!("unknown status {other:?}"))),
        }
    }
}

/// Claimed funds end a campaign even before its deadline.
pub fn campaign_status(
    deadline_timestamp: u64,
    goal: Octas,
    total_raised: Octas,
    funds_claimed: bool,
    now: u64,
) -> CampaignStatus {
    let is_expired = now >= deadline_timestamp;
    let is_funded = total_raised >= goal;
    if !is_expired && !funds_claimed {
        CampaignStatus::Active
    } else if is_funded {
        CampaignStatus::Successful
    } else {
        CampaignStatus::Failed
    }
}

pub fn status_of(record: &CampaignRecord, now: u64) -> CampaignStatus {
    campaign_status(
        record.deadline_timestamp,
        record.goal,
        record.total_raised,
        record.funds_claimed,
        now,
    )
}

/// `total_raised / goal * 100`, unclamped; 0 for a zero goal.
pub fn progress_percent(total_raised: Octas, goal: Octas) -> f64 {
    if goal == 0 {
        return 0.0;
    }
    total_raised as f64 / goal as f64 * 100.0
}

/// Progress clamped to `[0, 100]` for bar widths.
pub fn progress_bar_percent(progress_percent: f64) -> f64 {
    if progress_percent.is_nan() {
        return 0.0;
    }
    progress_percent.clamp(0.0, 100.0)
}

/// Whole days until the deadline, rounded up; 0 once the campaign is not
/// active.
pub fn days_left(record: &CampaignRecord, now: u64) -> u64 {
    if status_of(record, now) != CampaignStatus::Active {
        return 0;
    }
    record.deadline_timestamp.saturating_sub(now).div_ceil(SECS_PER_DAY)
}

/// Everything a caller needs to render or gate one campaign. Recompute it
/// on every read; it depends on the wall clock.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CampaignView {
    pub status: CampaignStatus,
    pub progress_percent: f64,
    pub can_pledge: bool,
    pub can_claim: bool,
    pub can_refund: bool,
    pub days_left: u64,
}

impl CampaignView {
    pub fn progress_bar_percent(&self) -> f64 {
        progress_bar_percent(self.progress_percent)
    }
}

pub fn derive_view(
    record: &CampaignRecord,
    now: u64,
    viewer: Option<&str>,
    pledge: &BackerPledge,
) -> CampaignView {
    let status = status_of(record, now);
    let is_creator = viewer.is_some_and(|viewer| same_address(viewer, &record.creator));
    CampaignView {
        status,
        progress_percent: progress_percent(record.total_raised, record.goal),
        can_pledge: status == CampaignStatus::Active,
        can_claim: is_creator && status == CampaignStatus::Successful && !record.funds_claimed,
        can_refund: status == CampaignStatus::Failed && pledge.amount > 0 && !pledge.refunded,
        days_left: days_left(record, now),
    }
}
