use serde::{Deserialize, Serialize};

use crate::ledger::models::RefType;

/// Surcharge key for sentiment-analysis enrichment on transcripts
pub const SENTIMENT_ANALYSIS: &str = "sentiment_analysis";

/// Flat-priced actions charged up front with no job attached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillableOperation {
    ScriptGeneration,
    ContentAnalysis,
    CreatorSearch,
}

impl BillableOperation {
    pub fn ref_type(&self) -> RefType {
        match self {
            BillableOperation::ScriptGeneration => RefType::ScriptGeneration,
            BillableOperation::ContentAnalysis => RefType::ContentAnalysis,
            BillableOperation::CreatorSearch => RefType::CreatorSearch,
        }
    }
}

/// Single credit price table for every billable action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditPricing {
    pub short_clip_max_secs: u32,
    pub short_clip_credits: i64,
    pub long_clip_credits: i64,
    pub sentiment_surcharge_credits: i64,
    pub script_generation_credits: i64,
    pub content_analysis_credits: i64,
    pub creator_search_credits: i64,
    pub scrape_run_credits: i64,
}

impl Default for CreditPricing {
    fn default() -> Self {
        Self {
            short_clip_max_secs: 90,
            short_clip_credits: 1,
            long_clip_credits: 2,
            sentiment_surcharge_credits: 1,
            script_generation_credits: 1,
            content_analysis_credits: 1,
            creator_search_credits: 1,
            scrape_run_credits: 1,
        }
    }
}

impl CreditPricing {
    pub fn operation_cost(&self, operation: BillableOperation) -> i64 {
        match operation {
            BillableOperation::ScriptGeneration => self.script_generation_credits,
            BillableOperation::ContentAnalysis => self.content_analysis_credits,
            BillableOperation::CreatorSearch => self.creator_search_credits,
        }
    }

    /// Unknown surcharges are free
    pub fn surcharge_cost(&self, surcharge: &str) -> i64 {
        match surcharge {
            SENTIMENT_ANALYSIS => self.sentiment_surcharge_credits,
            _ => 0,
        }
    }

    /// Worst-case transcription price, charged before the duration is known
    pub fn transcription_ceiling(&self, surcharges: &[String]) -> i64 {
        let base = self.short_clip_credits.max(self.long_clip_credits);
        base + surcharges.iter().map(|s| self.surcharge_cost(s)).sum::<i64>()
    }

    /// Actual price once the clip length and delivered enrichments are known.
    /// Surcharges are billed only if both requested and delivered.
    pub fn transcription_cost(
        &self,
        duration_secs: f64,
        requested: &[String],
        delivered: &[String],
    ) -> i64 {
        let base = if duration_secs <= f64::from(self.short_clip_max_secs) {
            self.short_clip_credits
        } else {
            self.long_clip_credits
        };

        base + requested
            .iter()
            .filter(|s| delivered.contains(s))
            .map(|s| self.surcharge_cost(s))
            .sum::<i64>()
    }
}
