//! Import & reconciliation pipeline.
//!
//! One cycle pulls per-source stock deltas from the catalog, reconciles them
//! into SQL, rebuilds the derived cache views and fires the storefront flush
//! webhook. Sources and regions fan out in parallel; a failing branch never
//! stops its siblings, and a source's high-water mark only advances after
//! its own import succeeded.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDateTime;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use granary_shared::cache::InventoryCache;
use granary_shared::repository::InventoryRepository;
use granary_shared::types::{ChangeDates, InventorySource, UpstreamStock};
use granary_shared::upstream::CatalogClient;

use crate::refresh::RegionAggregator;
use crate::report::{CycleReport, RegionOutcome, SourceOutcome};

pub struct ImportService {
    repository: Arc<dyn InventoryRepository>,
    catalog: Arc<dyn CatalogClient>,
    aggregator: Arc<RegionAggregator>,
    shop_flush_url: String,
    http: reqwest::Client,
}

/// How a source should be imported this cycle, and the high-water mark to
/// record once it succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct UpdatePlan {
    pub full: bool,
    pub new_changed_at: Option<NaiveDateTime>,
}

/// Per-source delta decision against the upstream change dates. `None`
/// means nothing new to import.
pub(crate) fn decide_update(
    changed_at: Option<NaiveDateTime>,
    remote: Option<&ChangeDates>,
) -> Option<UpdatePlan> {
    let Some(remote) = remote else {
        // Upstream no longer knows the source: force a full import and reset
        // the high-water mark.
        return Some(UpdatePlan {
            full: true,
            new_changed_at: None,
        });
    };

    let Some(changed_at) = changed_at else {
        return Some(UpdatePlan {
            full: true,
            new_changed_at: Some(remote.full_stocks),
        });
    };

    if remote.full_stocks <= changed_at && remote.part_stocks <= changed_at {
        return None;
    }

    if remote.full_stocks > changed_at {
        Some(UpdatePlan {
            full: true,
            new_changed_at: Some(remote.full_stocks),
        })
    } else {
        Some(UpdatePlan {
            full: false,
            new_changed_at: Some(remote.part_stocks),
        })
    }
}

impl ImportService {
    pub fn new(
        repository: Arc<dyn InventoryRepository>,
        catalog: Arc<dyn CatalogClient>,
        cache: Arc<dyn InventoryCache>,
        shop_flush_url: String,
    ) -> Self {
        Self {
            aggregator: Arc::new(RegionAggregator::new(Arc::clone(&repository), cache)),
            repository,
            catalog,
            shop_flush_url,
            http: reqwest::Client::new(),
        }
    }

    pub async fn run_cycle(self: Arc<Self>) -> CycleReport {
        let region_ids = match self.repository.get_regions().await {
            Ok(region_ids) => region_ids,
            Err(err) => return CycleReport::failed(format!("get regions: {}", err)),
        };

        let mut fan_out = JoinSet::new();
        for region_id in region_ids {
            let service = Arc::clone(&self);
            fan_out.spawn(async move { service.import_region(region_id).await });
        }

        let mut report = CycleReport::default();
        while let Some(joined) = fan_out.join_next().await {
            match joined {
                Ok(region) => report.regions.push(region),
                Err(err) => report
                    .refresh_errors
                    .push(format!("region task aborted: {}", err)),
            }
        }

        if let Err(err) = self
            .repository
            .update_product_stocks_changed(&report.products_changed())
            .await
        {
            report.error = Some(format!("update stocks changed: {}", err));
            return report;
        }

        let mut refresh = JoinSet::new();
        for region in &report.regions {
            for source in &region.sources {
                let aggregator = Arc::clone(&self.aggregator);
                let is_id = source.is_id;
                refresh.spawn(async move {
                    aggregator
                        .refresh_inventory_source(is_id)
                        .await
                        .map_err(|err| format!("refresh source {}: {}", is_id, err))
                });
            }

            let aggregator = Arc::clone(&self.aggregator);
            let region_id = region.region_id;
            let products_changed = region.products_changed();
            refresh.spawn(async move {
                aggregator
                    .refresh_region(&products_changed, region_id)
                    .await
                    .map_err(|err| format!("refresh region {}: {}", region_id, err))
            });
        }

        while let Some(joined) = refresh.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(message)) => report.refresh_errors.push(message),
                Err(err) => report
                    .refresh_errors
                    .push(format!("refresh task aborted: {}", err)),
            }
        }

        self.flush_web_cache().await;

        report
    }

    async fn import_region(self: Arc<Self>, region_id: u64) -> RegionOutcome {
        let outcome = RegionOutcome::new(region_id);

        let sources = match self.repository.get_inventory_sources(region_id).await {
            Ok(sources) => sources,
            Err(err) => return outcome.fail(format!("get sources: {}", err)),
        };

        if sources.is_empty() {
            return outcome;
        }

        let change_dates = match self.catalog.get_inventory_change_dates().await {
            Ok(change_dates) => change_dates,
            Err(err) => return outcome.fail(format!("get change dates: {}", err)),
        };

        let mut fan_out = JoinSet::new();
        for source in sources {
            let Some(plan) = decide_update(source.changed_at, change_dates.get(&source.id))
            else {
                continue;
            };

            let service = Arc::clone(&self);
            fan_out.spawn(async move { service.import_source(source, plan).await });
        }

        let mut outcome = outcome;
        while let Some(joined) = fan_out.join_next().await {
            match joined {
                Ok(source) => outcome.sources.push(source),
                Err(err) => {
                    outcome.error = Some(format!("source task aborted: {}", err));
                }
            }
        }

        outcome
    }

    async fn import_source(&self, source: InventorySource, plan: UpdatePlan) -> SourceOutcome {
        let outcome = SourceOutcome::new(source.id, plan.full);

        let date_from = if plan.full { None } else { source.changed_at };

        let stocks = match self.catalog.get_stocks(source.id, date_from).await {
            Ok(stocks) => stocks,
            Err(err) => return outcome.fail(format!("get stocks: {}", err)),
        };

        if stocks.is_empty() {
            if plan.full {
                // The truncate clears the high-water mark itself; the source
                // stays pickable by the next cycle.
                return match self.repository.truncate_stocks(source.id).await {
                    Ok(()) => outcome.fail("empty stocks"),
                    Err(err) => outcome.fail(format!("truncate stocks: {}", err)),
                };
            }

            // An empty delta is a success with no writes: trust upstream.
            if let Err(err) = self
                .repository
                .update_is_changed_at(source.id, plan.new_changed_at)
                .await
            {
                return outcome.fail(format!("update changed at: {}", err));
            }
            return outcome;
        }

        let mut empty_stocks: Vec<u64> = Vec::new();
        let mut live_stocks: HashMap<u64, UpstreamStock> = HashMap::with_capacity(stocks.len());

        for (product_id, stock) in stocks {
            if stock.is_empty() {
                empty_stocks.push(product_id);
            } else {
                live_stocks.insert(product_id, stock);
            }
        }

        if plan.full {
            // Products present in SQL but absent from the full upstream
            // response are gone and must be deleted too.
            let mut skip: Vec<u64> = empty_stocks.clone();
            skip.extend(live_stocks.keys().copied());

            match self
                .repository
                .get_stocks_product_id(&[source.id], &skip)
                .await
            {
                Ok(vanished) => empty_stocks.extend(vanished),
                Err(err) => return outcome.fail(format!("get vanished products: {}", err)),
            }
        }

        let mut outcome = outcome;
        outcome.empty_stocks = empty_stocks.len();
        outcome.has_stocks = live_stocks.len();

        if let Err(err) = self.repository.delete_stocks(source.id, &empty_stocks).await {
            return outcome.fail(format!("delete stocks: {}", err));
        }

        if !live_stocks.is_empty() {
            if let Err(err) = self.repository.upsert_stocks(source.id, &live_stocks).await {
                return outcome.fail(format!("upsert stocks: {}", err));
            }
        }

        outcome.products_changed = empty_stocks;
        outcome
            .products_changed
            .extend(live_stocks.keys().copied());

        if let Err(err) = self
            .repository
            .update_is_changed_at(source.id, plan.new_changed_at)
            .await
        {
            return outcome.fail(format!("update changed at: {}", err));
        }

        outcome
    }

    /// Storefront flush is advisory; the result is logged and ignored.
    async fn flush_web_cache(&self) {
        match self.http.get(&self.shop_flush_url).send().await {
            Ok(response) => debug!(status = %response.status(), "storefront cache flushed"),
            Err(err) => warn!(error = %err, "storefront cache flush failed"),
        }
    }
}
