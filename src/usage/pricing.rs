use super::TokenUsage;
use crate::error::PricingError;
use serde::{Deserialize, Serialize};

pub const WILDCARD: &str = "*";

/// One `agent:model:input:output` row. Prices are per million tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRow {
    pub agent_pattern: String,
    pub model_pattern: String,
    pub input_cost_per_million: f64,
    pub output_cost_per_million: f64,
}

impl PriceRow {
    fn is_valid(&self) -> bool {
        self.input_cost_per_million >= 0.0
            && self.output_cost_per_million >= 0.0
            && self.input_cost_per_million.is_finite()
            && self.output_cost_per_million.is_finite()
    }

    /// Match rank: exact agent+model 3, exact agent + any model 2,
    /// any agent + exact model 1, any+any 0.
    fn specificity(&self, agent: &str, model: &str) -> Option<u8> {
        let agent_exact = self.agent_pattern == agent;
        let model_exact = self.model_pattern == model;
        let agent_any = self.agent_pattern == WILDCARD;
        let model_any = self.model_pattern == WILDCARD;

        match (agent_exact, agent_any, model_exact, model_any) {
            (true, _, true, _) => Some(3),
            (true, _, false, true) => Some(2),
            (false, true, true, _) => Some(1),
            (false, true, false, true) => Some(0),
            _ => None,
        }
    }

    /// Cost in currency units, `None` when no usable token counts exist.
    #[allow(clippy::cast_precision_loss)]
    pub fn estimate(&self, usage: &TokenUsage) -> Option<f64> {
        match (usage.prompt_tokens, usage.completion_tokens, usage.total_tokens) {
            (Some(prompt), Some(completion), _) => Some(
                prompt as f64 * self.input_cost_per_million / 1_000_000.0
                    + completion as f64 * self.output_cost_per_million / 1_000_000.0,
            ),
            (_, _, Some(total)) => {
                let blended = (self.input_cost_per_million + self.output_cost_per_million) / 2.0;
                Some(total as f64 * blended / 1_000_000.0)
            }
            _ => None,
        }
    }
}

/// Ordered price table. Row order is the tie-break between rows of equal
/// specificity: the first listed wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceTable {
    rows: Vec<PriceRow>,
}

impl PriceTable {
    pub fn new(rows: Vec<PriceRow>) -> Self {
        Self { rows }
    }

    /// Parse `agent:model:input:output[,agent:model:input:output...]`.
    ///
    /// Agents are matched case-insensitively, models verbatim. Blank entries
    /// are ignored; rows with the wrong arity or non-numeric prices are
    /// rejected. Negative prices parse but are never selected.
    pub fn parse(raw: &str) -> Result<Self, PricingError> {
        let mut rows = Vec::new();
        for entry in raw.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }

            let parts: Vec<&str> = entry.split(':').map(str::trim).collect();
            let [agent, model, input, output] = parts.as_slice() else {
                return Err(PricingError::MalformedRow {
                    row: entry.to_string(),
                    reason: format!("expected 4 fields, found {}", parts.len()),
                });
            };
            if agent.is_empty() || model.is_empty() {
                return Err(PricingError::MalformedRow {
                    row: entry.to_string(),
                    reason: "agent and model patterns must be non-empty".into(),
                });
            }

            let parse_price = |value: &str| {
                value
                    .parse::<f64>()
                    .map_err(|e| PricingError::MalformedRow {
                        row: entry.to_string(),
                        reason: format!("price {value:?}: {e}"),
                    })
            };

            let row = PriceRow {
                agent_pattern: agent.to_lowercase(),
                model_pattern: (*model).to_string(),
                input_cost_per_million: parse_price(input)?,
                output_cost_per_million: parse_price(output)?,
            };
            if !row.is_valid() {
                tracing::warn!(row = entry, "ignoring price row with negative price");
            }
            rows.push(row);
        }
        Ok(Self { rows })
    }

    pub fn rows(&self) -> &[PriceRow] {
        &self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Most specific valid row for `(agent, model)`.
    pub fn lookup(&self, agent: &str, model: &str) -> Option<&PriceRow> {
        let agent = agent.trim().to_lowercase();
        let model = model.trim();

        let mut best: Option<(u8, &PriceRow)> = None;
        for row in self.rows.iter().filter(|row| row.is_valid()) {
            let Some(rank) = row.specificity(&agent, model) else {
                continue;
            };
            // Strictly greater keeps the earliest row on ties.
            if best.is_none_or(|(best_rank, _)| rank > best_rank) {
                best = Some((rank, row));
            }
        }
        best.map(|(_, row)| row)
    }

    /// Estimated cost, or `None` when either the price or the usage is unknown.
    pub fn estimate_cost(&self, agent: &str, model: &str, usage: &TokenUsage) -> Option<f64> {
        self.lookup(agent, model)?.estimate(usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(prompt: Option<u64>, completion: Option<u64>, total: Option<u64>) -> TokenUsage {
        TokenUsage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: total,
            ..TokenUsage::unknown()
        }
    }

    fn assert_close(actual: Option<f64>, expected: f64) {
        let actual = actual.expect("expected a cost estimate");
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn prompt_and_completion_use_split_prices() {
        let table = PriceTable::parse("codex:gpt-test:1.0:3.0").unwrap();
        let cost = table.estimate_cost("codex", "gpt-test", &usage(Some(1_000_000), Some(500_000), None));
        assert_close(cost, 2.5);
    }

    #[test]
    fn total_only_uses_average_price() {
        let table = PriceTable::parse("codex:gpt-test:1.0:3.0").unwrap();
        let cost = table.estimate_cost("codex", "gpt-test", &usage(None, None, Some(1_000_000)));
        assert_close(cost, 2.0);
    }

    #[test]
    fn partial_split_falls_back_to_total() {
        let table = PriceTable::parse("*:*:1.0:3.0").unwrap();
        let cost = table.estimate_cost("codex", "m", &usage(Some(10), None, Some(1_000_000)));
        assert_close(cost, 2.0);
    }

    #[test]
    fn agent_wildcard_beats_global_wildcard() {
        let table = PriceTable::parse("codex:*:2:2,*:*:9:9").unwrap();
        let total = usage(None, None, Some(1_000_000));
        assert_close(table.estimate_cost("codex", "gpt-5", &total), 2.0);
        assert_close(table.estimate_cost("claude", "sonnet", &total), 9.0);
    }

    #[test]
    fn exact_row_beats_earlier_wildcards() {
        let table = PriceTable::parse("*:*:9:9,codex:*:5:5,codex:gpt-5:1:1").unwrap();
        let row = table.lookup("CODEX", "gpt-5").unwrap();
        assert_eq!(row.input_cost_per_million, 1.0);
    }

    #[test]
    fn negative_rows_are_skipped() {
        let table = PriceTable::parse("codex:gpt-test:-1.0:2.0,*:*:4:4").unwrap();
        let cost = table.estimate_cost("codex", "gpt-test", &usage(None, None, Some(1_000_000)));
        assert_close(cost, 4.0);
    }

    #[test]
    fn equal_specificity_takes_first_listed() {
        let table = PriceTable::parse("*:*:1:1,*:*:7:7").unwrap();
        let row = table.lookup("gemini", "flash").unwrap();
        assert_eq!(row.input_cost_per_million, 1.0);
    }

    #[test]
    fn no_match_or_no_usage_is_unknown_not_free() {
        let table = PriceTable::parse("codex:gpt-5:1:1").unwrap();
        assert!(table.estimate_cost("claude", "opus", &usage(None, None, Some(5))).is_none());
        assert!(table.estimate_cost("codex", "gpt-5", &usage(None, None, None)).is_none());
        assert!(PriceTable::default().estimate_cost("codex", "gpt-5", &usage(Some(1), Some(1), None)).is_none());
    }

    #[test]
    fn malformed_rows_are_rejected() {
        assert!(PriceTable::parse("codex:gpt-5:1").is_err());
        assert!(PriceTable::parse("codex:gpt-5:one:2").is_err());
        assert!(PriceTable::parse(" , ,").unwrap().is_empty());
    }
}
