//! Per-cycle diagnostics assembled from the fan-out results.

use std::collections::HashSet;

use tracing::{error, info, warn};

/// Result of importing one inventory source. `products_changed` is only
/// populated once the SQL writes went through.
#[derive(Debug, Default)]
pub struct SourceOutcome {
    pub is_id: u64,
    pub full_update: bool,
    pub has_stocks: usize,
    pub empty_stocks: usize,
    pub products_changed: Vec<u64>,
    pub error: Option<String>,
}

impl SourceOutcome {
    pub fn new(is_id: u64, full_update: bool) -> Self {
        Self {
            is_id,
            full_update,
            ..Default::default()
        }
    }

    pub fn fail(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Result of one region's import fan-out.
#[derive(Debug, Default)]
pub struct RegionOutcome {
    pub region_id: u64,
    pub sources: Vec<SourceOutcome>,
    pub error: Option<String>,
}

impl RegionOutcome {
    pub fn new(region_id: u64) -> Self {
        Self {
            region_id,
            ..Default::default()
        }
    }

    pub fn fail(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self
    }

    pub fn products_changed(&self) -> Vec<u64> {
        let mut products: HashSet<u64> = HashSet::new();
        for source in &self.sources {
            products.extend(source.products_changed.iter().copied());
        }
        products.into_iter().collect()
    }
}

#[derive(Debug, Default)]
pub struct CycleReport {
    pub regions: Vec<RegionOutcome>,
    pub error: Option<String>,
    pub refresh_errors: Vec<String>,
}

impl CycleReport {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }

    /// Union of products touched across every source of every region.
    pub fn products_changed(&self) -> Vec<u64> {
        let mut products: HashSet<u64> = HashSet::new();
        for region in &self.regions {
            products.extend(region.products_changed());
        }
        products.into_iter().collect()
    }

    pub fn log(&self) {
        if let Some(message) = &self.error {
            error!(error = %message, "import cycle failed");
            return;
        }

        for region in &self.regions {
            let full_updates = region.sources.iter().filter(|s| s.full_update).count();
            let failed: Vec<u64> = region
                .sources
                .iter()
                .filter(|s| !s.succeeded())
                .map(|s| s.is_id)
                .collect();

            if let Some(message) = &region.error {
                warn!(region_id = region.region_id, error = %message, "region import failed");
            } else {
                info!(
                    region_id = region.region_id,
                    sources = region.sources.len(),
                    full_updates,
                    failed_sources = ?failed,
                    products_changed = region.products_changed().len(),
                    "region imported"
                );
            }
        }

        for message in &self.refresh_errors {
            warn!(error = %message, "refresh failed");
        }

        info!(
            regions = self.regions.len(),
            products_changed = self.products_changed().len(),
            "import cycle finished"
        );
    }
}
