use crate::config::{PriceTier, PricingConfig, PricingMode};
use crate::error::{AppError, AppResult};

/// Token cost of a format order.
#[derive(Debug, Clone)]
pub struct TokenPricing {
    mode: PricingMode,
    fixed_cost: i64,
    unknown_pages_cost: i64,
    tiers: Vec<PriceTier>,
}

impl TokenPricing {
    pub fn from_config(config: &PricingConfig) -> AppResult<Self> {
        if config.fixed_cost <= 0 || config.unknown_pages_cost <= 0 {
            return Err(AppError::Config("token costs must be positive".to_string()));
        }
        if config.tiers.iter().any(|t| t.cost <= 0) {
            return Err(AppError::Config("price tier costs must be positive".to_string()));
        }

        let mut tiers = config.tiers.clone();
        // Bounded tiers ascending, the open-ended tier last.
        tiers.sort_by_key(|t| t.max_pages.unwrap_or(u32::MAX));

        Ok(Self {
            mode: config.mode,
            fixed_cost: config.fixed_cost,
            unknown_pages_cost: config.unknown_pages_cost,
            tiers,
        })
    }

    pub fn fixed(cost: i64) -> Self {
        Self {
            mode: PricingMode::Fixed,
            fixed_cost: cost,
            unknown_pages_cost: cost,
            tiers: Vec::new(),
        }
    }

    pub fn cost_for(&self, page_count: Option<u32>) -> i64 {
        match self.mode {
            PricingMode::Fixed => self.fixed_cost,
            PricingMode::Tiered => match page_count {
                None => self.unknown_pages_cost,
                Some(pages) => self
                    .tiers
                    .iter()
                    .find(|t| t.max_pages.map_or(true, |max| pages <= max))
                    .map(|t| t.cost)
                    .unwrap_or(self.unknown_pages_cost),
            },
        }
    }
}
