//! Read-side aggregation over the span log. No side effects.

use std::collections::BTreeMap;

use mctl_types::{Span, TokenSource};
use serde::Serialize;

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct TokenTotals {
    pub exact: u64,
    pub estimated: u64,
    pub total: u64,
}

impl TokenTotals {
    fn add(&mut self, tokens: u64, source: TokenSource) {
        match source {
            TokenSource::Exact => self.exact += tokens,
            TokenSource::Estimated => self.estimated += tokens,
        }
        self.total += tokens;
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FailureBucket {
    pub bucket: String,
    pub total: u64,
    pub failed: u64,
    pub failure_rate: f64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct TokenCoverage {
    pub exact_tokens: u64,
    pub estimated_tokens: u64,
    pub exact_ratio: f64,
    pub estimated_ratio: f64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct TraceSummary {
    pub total_spans: u64,
    pub failed_spans: u64,
    pub tokens_by_role: BTreeMap<String, TokenTotals>,
    pub tokens_by_model: BTreeMap<String, TokenTotals>,
    pub tokens_by_tool: BTreeMap<String, TokenTotals>,
    pub hourly_failures: Vec<FailureBucket>,
    pub daily_failures: Vec<FailureBucket>,
    pub coverage: TokenCoverage,
}

pub fn summarize(spans: &[Span]) -> TraceSummary {
    let mut summary = TraceSummary::default();
    let mut hourly: BTreeMap<String, (u64, u64)> = BTreeMap::new();
    let mut daily: BTreeMap<String, (u64, u64)> = BTreeMap::new();

    for span in spans {
        summary.total_spans += 1;
        if !span.success {
            summary.failed_spans += 1;
        }

        let hour = span.started_at.format("%Y-%m-%dT%H:00Z").to_string();
        let day = span.started_at.format("%Y-%m-%d").to_string();
        for (series, key) in [(&mut hourly, hour), (&mut daily, day)] {
            let entry = series.entry(key).or_default();
            entry.0 += 1;
            if !span.success {
                entry.1 += 1;
            }
        }

        let (Some(tokens), Some(source)) = (span.tokens, span.token_source) else {
            continue;
        };
        match source {
            TokenSource::Exact => summary.coverage.exact_tokens += tokens,
            TokenSource::Estimated => summary.coverage.estimated_tokens += tokens,
        }
        if let Some(role) = span.role_id.as_deref() {
            summary
                .tokens_by_role
                .entry(role.to_string())
                .or_default()
                .add(tokens, source);
        }
        if let Some(model) = span.model.as_deref() {
            summary
                .tokens_by_model
                .entry(model.to_string())
                .or_default()
                .add(tokens, source);
        }
        if let Some(tool) = span.tool_name.as_deref() {
            summary
                .tokens_by_tool
                .entry(tool.to_string())
                .or_default()
                .add(tokens, source);
        }
    }

    let counted = summary.coverage.exact_tokens + summary.coverage.estimated_tokens;
    if counted > 0 {
        summary.coverage.exact_ratio = summary.coverage.exact_tokens as f64 / counted as f64;
        summary.coverage.estimated_ratio =
            summary.coverage.estimated_tokens as f64 / counted as f64;
    }
    summary.hourly_failures = into_buckets(hourly);
    summary.daily_failures = into_buckets(daily);
    summary
}

fn into_buckets(series: BTreeMap<String, (u64, u64)>) -> Vec<FailureBucket> {
    series
        .into_iter()
        .map(|(bucket, (total, failed))| FailureBucket {
            bucket,
            total,
            failed,
            failure_rate: if total == 0 {
                0.0
            } else {
                failed as f64 / total as f64
            },
        })
        .collect()
}
