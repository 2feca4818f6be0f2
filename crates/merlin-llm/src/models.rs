use merlin_core::stream::Pricing;

/// A known model and its per-million-token prices in USD.
#[derive(Clone, Debug)]
pub struct ModelInfo {
    pub name: &'static str,
    pub provider: &'static str,
    pub input_cost_per_mtok: f64,
    pub output_cost_per_mtok: f64,
}

impl ModelInfo {
    pub fn pricing(&self) -> Pricing {
        Pricing {
            input_per_mtok: self.input_cost_per_mtok,
            output_per_mtok: self.output_cost_per_mtok,
        }
    }
}

pub static GPT_4O_MINI: ModelInfo = ModelInfo {
    name: "gpt-4o-mini",
    provider: "openai",
    input_cost_per_mtok: 0.15,
    output_cost_per_mtok: 0.60,
};

pub static GPT_4O: ModelInfo = ModelInfo {
    name: "gpt-4o",
    provider: "openai",
    input_cost_per_mtok: 2.50,
    output_cost_per_mtok: 10.0,
};

pub static CLAUDE_SONNET_4_5: ModelInfo = ModelInfo {
    name: "claude-sonnet-4-5-20250929",
    provider: "anthropic",
    input_cost_per_mtok: 3.0,
    output_cost_per_mtok: 15.0,
};

pub static CLAUDE_HAIKU_4_5: ModelInfo = ModelInfo {
    name: "claude-haiku-4-5-20251001",
    provider: "anthropic",
    input_cost_per_mtok: 0.80,
    output_cost_per_mtok: 4.0,
};

static ALL_MODELS: &[&ModelInfo] = &[&GPT_4O_MINI, &GPT_4O, &CLAUDE_SONNET_4_5, &CLAUDE_HAIKU_4_5];

pub fn find_model(name: &str) -> Option<&'static ModelInfo> {
    ALL_MODELS.iter().find(|m| m.name == name).copied()
}

/// Prices for `model`, free when unknown.
pub fn pricing(model: &str) -> Pricing {
    find_model(model).map_or(Pricing::FREE, ModelInfo::pricing)
}

pub fn default_openai_model() -> &'static ModelInfo {
    &GPT_4O_MINI
}

pub fn default_anthropic_model() -> &'static ModelInfo {
    &CLAUDE_SONNET_4_5
}

pub fn all_models() -> &'static [&'static ModelInfo] {
    ALL_MODELS
}
