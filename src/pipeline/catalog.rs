//! Catalog of analytics models and keyword-based selection.

use super::intent::Intent;

/// Every model the analytics backend can run.
pub const AVAILABLE_MODELS: &[&str] = &[
    "m_forecast",
    "m_slippage_impact_quarter",
    "m_stage_velocity_quarter",
    "m_pipeline_health",
    "m_deal_velocity_analysis",
    "m_revenue_forecasting",
    "a_win_rate_trend_analysis",
    "a_slippage_pattern_analysis",
    "a_comprehensive_slippage_analysis",
    "a_win_rate_by_owner",
    "a_win_rate_by_industry",
    "a_executive_dashboard",
];

/// Topic keywords and the models that cover them.
const GUIDELINES: &[(&[&str], &[&str])] = &[
    (
        &["executive", "briefing", "leadership"],
        &["m_pipeline_health", "a_executive_dashboard", "m_revenue_forecasting"],
    ),
    (
        &["slip", "delay"],
        &["m_slippage_impact_quarter", "a_slippage_pattern_analysis"],
    ),
    (
        &["win rate", "performance", "owner", "industry"],
        &["a_win_rate_by_owner", "a_win_rate_by_industry"],
    ),
    (
        &["pipeline", "health"],
        &["m_pipeline_health", "m_deal_velocity_analysis"],
    ),
    (
        &["forecast", "revenue"],
        &["m_revenue_forecasting", "m_forecast"],
    ),
    (
        &["velocity", "cycle", "speed"],
        &["m_deal_velocity_analysis", "m_stage_velocity_quarter"],
    ),
];

pub fn is_known_model(name: &str) -> bool {
    AVAILABLE_MODELS.contains(&name)
}

/// Human-readable selection guidelines, for prompts.
pub fn guidelines() -> String {
    GUIDELINES
        .iter()
        .map(|(topics, models)| format!("- {}: {}", topics.join("/"), models.join(" + ")))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Pick models by matching topic keywords in the question.
///
/// Returns nothing for intents that do not involve analytics. Executive
/// briefings always get the executive set; other analytics questions with
/// no matching topic get the pipeline health set.
pub fn select_by_keywords(query: &str, intent: Intent) -> Vec<String> {
    if !intent.needs_analytics() {
        return Vec::new();
    }

    let lowered = query.to_lowercase();
    let mut selected: Vec<String> = Vec::new();

    if intent == Intent::ExecutiveBriefing {
        extend_unique(&mut selected, GUIDELINES[0].1);
    }
    for (topics, models) in GUIDELINES {
        if topics.iter().any(|t| lowered.contains(t)) {
            extend_unique(&mut selected, models);
        }
    }
    if selected.is_empty() {
        extend_unique(&mut selected, GUIDELINES[3].1);
    }
    selected
}

fn extend_unique(selected: &mut Vec<String>, models: &[&str]) {
    for model in models {
        if !selected.iter().any(|m| m == model) {
            selected.push((*model).to_string());
        }
    }
}
