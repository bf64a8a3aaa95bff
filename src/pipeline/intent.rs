//! Question intents and keyword routing.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// What kind of answer a question calls for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Intent {
    /// Direct CRM lookup.
    SimpleQuery,
    /// Analysis across several data sources.
    AnalyticsDeep,
    /// Executive summary with forecasting.
    ExecutiveBriefing,
    /// Questions about what the assistant can do.
    HelpRequest,
    /// Small talk.
    Conversational,
}

const EXECUTIVE_TERMS: &[&str] = &[
    "vp",
    "executive",
    "briefing",
    "leadership",
    "board",
    "quarterly review",
];

const ANALYSIS_TERMS: &[&str] = &[
    "analyze",
    "analyse",
    "analysis",
    "insight",
    "trend",
    "why",
    "slippage",
    "slipping",
    "velocity",
    "forecast",
    "risk",
    "compare",
    "correlat",
];

const HELP_TERMS: &[&str] = &["help", "what can you do", "capabilities", "how do i use"];

const GREETING_WORDS: &[&str] = &["hi", "hello", "hey", "thanks", "thank", "morning", "cheers"];

impl Intent {
    pub const ALL: [Intent; 5] = [
        Intent::SimpleQuery,
        Intent::AnalyticsDeep,
        Intent::ExecutiveBriefing,
        Intent::HelpRequest,
        Intent::Conversational,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::SimpleQuery => "SIMPLE_QUERY",
            Intent::AnalyticsDeep => "ANALYTICS_DEEP",
            Intent::ExecutiveBriefing => "EXECUTIVE_BRIEFING",
            Intent::HelpRequest => "HELP_REQUEST",
            Intent::Conversational => "CONVERSATIONAL",
        }
    }

    /// Whether CRM queries should be generated and fetched.
    pub fn needs_crm_data(&self) -> bool {
        !matches!(self, Intent::HelpRequest | Intent::Conversational)
    }

    /// Whether analytics models and the warehouse are involved.
    pub fn needs_analytics(&self) -> bool {
        matches!(self, Intent::AnalyticsDeep | Intent::ExecutiveBriefing)
    }

    /// Route a question by keywords alone.
    pub fn classify(query: &str) -> Intent {
        let lowered = query.to_lowercase();
        let words: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();

        let has_word = |terms: &[&str]| terms.iter().any(|t| words.contains(t));
        let has_phrase = |terms: &[&str]| terms.iter().any(|t| lowered.contains(t));

        if has_word(&EXECUTIVE_TERMS[..5]) || has_phrase(&EXECUTIVE_TERMS[5..]) {
            Intent::ExecutiveBriefing
        } else if has_phrase(ANALYSIS_TERMS) {
            Intent::AnalyticsDeep
        } else if has_phrase(HELP_TERMS) {
            Intent::HelpRequest
        } else if words.is_empty() || (words.len() <= 4 && has_word(GREETING_WORDS)) {
            Intent::Conversational
        } else {
            Intent::SimpleQuery
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for an intent name that matches no variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown intent: {0}")]
pub struct UnknownIntent(pub String);

impl FromStr for Intent {
    type Err = UnknownIntent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_uppercase().replace(['-', ' '], "_");
        Intent::ALL
            .into_iter()
            .find(|intent| intent.as_str() == normalized)
            .ok_or_else(|| UnknownIntent(s.to_string()))
    }
}
