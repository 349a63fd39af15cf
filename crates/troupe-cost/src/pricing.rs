use serde::Serialize;

/// Per-million-token prices for a model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ModelPricing {
    /// USD per million input tokens.
    pub input_per_mtok: f64,
    /// USD per million output tokens.
    pub output_per_mtok: f64,
}

/// Looks up pricing for a model identifier.
///
/// Unknown models get a conservative (expensive) default so budget
/// enforcement errs toward caution rather than overspend.
pub fn pricing_for(model: &str) -> ModelPricing {
    match model {
        "gpt-4o-mini" => ModelPricing {
            input_per_mtok: 0.15,
            output_per_mtok: 0.60,
        },
        "gpt-4.1-mini" => ModelPricing {
            input_per_mtok: 0.40,
            output_per_mtok: 1.60,
        },
        "gpt-4o" => ModelPricing {
            input_per_mtok: 2.50,
            output_per_mtok: 10.00,
        },
        "gpt-4.1" => ModelPricing {
            input_per_mtok: 2.00,
            output_per_mtok: 8.00,
        },
        "o1" => ModelPricing {
            input_per_mtok: 15.00,
            output_per_mtok: 60.00,
        },
        _ => ModelPricing {
            input_per_mtok: 15.00,
            output_per_mtok: 60.00,
        },
    }
}

/// Computes the USD cost of a call, rounded to 6 decimal places.
pub fn compute_cost(tokens_in: u64, tokens_out: u64, pricing: &ModelPricing) -> f64 {
    let raw = tokens_in as f64 / 1e6 * pricing.input_per_mtok
        + tokens_out as f64 / 1e6 * pricing.output_per_mtok;
    (raw * 1e6).round() / 1e6
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_known_model_cost() {
        let pricing = pricing_for("gpt-4o");
        // 1000 in at $2.50/M + 500 out at $10.00/M
        let cost = compute_cost(1_000, 500, &pricing);
        assert_eq!(cost, 0.0075);
    }

    #[test]
    fn test_unknown_model_uses_conservative_default() {
        let pricing = pricing_for("some-future-model");
        assert_eq!(pricing, pricing_for("o1"));
    }

    #[test]
    fn test_rounding_to_six_places() {
        let pricing = ModelPricing {
            input_per_mtok: 0.15,
            output_per_mtok: 0.60,
        };
        let cost = compute_cost(7, 3, &pricing);
        // 7*0.15/1e6 + 3*0.60/1e6 = 0.00000285 → rounds to 0.000003
        assert_eq!(cost, 0.000003);
    }

    #[test]
    fn test_zero_tokens_zero_cost() {
        assert_eq!(compute_cost(0, 0, &pricing_for("gpt-4o")), 0.0);
    }
}
