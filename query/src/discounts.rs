//! Discount snapshot and price math.
//!
//! Prices are centimil integers (price x 10 000). Discounted prices round up
//! to the next whole currency unit; a computed price of 1 or below rejects
//! the discount, and a discounted price above the quoted price raises the
//! quoted price before totals are computed.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use granary_shared::repository::InventoryRepository;
use granary_shared::types::{Discount, RegionProductDiscounts};
use granary_shared::{Error, Result};

/// One currency unit in centimil.
const PRICE_UNIT: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceBreakdown {
    pub price: u64,
    pub discount_price: u64,
    pub sum: u64,
    pub discount_sum: u64,
}

pub struct DiscountService {
    repository: Arc<dyn InventoryRepository>,
    snapshot: RwLock<RegionProductDiscounts>,
}

impl DiscountService {
    pub fn new(repository: Arc<dyn InventoryRepository>) -> Self {
        Self {
            repository,
            snapshot: RwLock::new(RegionProductDiscounts::new()),
        }
    }

    /// Replaces the snapshot with the discounts active today. A failed load
    /// keeps the previous snapshot.
    pub async fn sync(&self) {
        match self.repository.get_discounts().await {
            Ok(discounts) => {
                debug!(regions = discounts.len(), "discounts refreshed");
                *self.snapshot.write().await = discounts;
            }
            Err(err) => warn!(error = %err, "discount refresh failed"),
        }
    }

    pub async fn calc(
        &self,
        region_id: u64,
        product_id: u64,
        quantity: u64,
        price: u64,
    ) -> Result<PriceBreakdown> {
        let snapshot = self.snapshot.read().await;
        let discount = find_discount(&snapshot, region_id, product_id);
        breakdown(discount, price, quantity)
    }
}

/// Region-specific discount first, then the all-regions wildcard.
fn find_discount(
    snapshot: &RegionProductDiscounts,
    region_id: u64,
    product_id: u64,
) -> Option<&Discount> {
    if region_id == 0 {
        return None;
    }

    snapshot
        .get(&region_id)
        .and_then(|products| products.get(&product_id))
        .or_else(|| snapshot.get(&0).and_then(|products| products.get(&product_id)))
}

/// Applies a discount to a centimil price. Returns the input price when the
/// discount does not apply or computes a price of 1 or below.
fn discounted_price(price: u64, discount: Option<&Discount>) -> u64 {
    let Some(discount) = discount else {
        return price;
    };

    let new_price = match discount.discount_type.as_str() {
        // Percent off.
        "1" => {
            if discount.type_value >= 100 {
                0
            } else {
                (price as u128 * (100 - discount.type_value) as u128 / 100) as u64
            }
        }
        // Fixed absolute off, in whole currency units.
        "2" => price.saturating_sub(discount.type_value.saturating_mul(PRICE_UNIT)),
        // Fixed replacement price, in whole currency units.
        "13" => discount.type_value.saturating_mul(PRICE_UNIT),
        _ => return price,
    };

    if new_price <= 1 {
        return price;
    }

    let rem = new_price % PRICE_UNIT;
    if rem > 0 {
        new_price.saturating_sub(rem).saturating_add(PRICE_UNIT)
    } else {
        new_price
    }
}

fn checked_total(price: u64, quantity: u64) -> Result<u64> {
    price.checked_mul(quantity).ok_or(Error::Overflow)
}

/// Full breakdown for a line: unit prices plus quantity totals computed with
/// checked multiplication.
fn breakdown(discount: Option<&Discount>, price: u64, quantity: u64) -> Result<PriceBreakdown> {
    let discount_price = discounted_price(price, discount);

    // Upstream occasionally reports a below-policy price; the quoted price
    // is raised to the discounted one in that case.
    let price = price.max(discount_price);

    let (sum, discount_sum) = if quantity > 1 {
        (
            checked_total(price, quantity)?,
            checked_total(discount_price, quantity)?,
        )
    } else {
        (price, discount_price)
    };

    Ok(PriceBreakdown {
        price,
        discount_price,
        sum,
        discount_sum,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn discount(discount_type: &str, type_value: u64) -> Discount {
        Discount {
            discount_type: discount_type.to_string(),
            type_value,
        }
    }

    #[test]
    fn percent_discount_rounds_up_to_whole_units() {
        let d = discount("1", 10);
        // 15000 * 90% = 13500, rounded up to 20000.
        assert_eq!(discounted_price(15000, Some(&d)), 20000);
        // Already a whole unit: 20000 * 50% = 10000, no rounding.
        let d = discount("1", 50);
        assert_eq!(discounted_price(20000, Some(&d)), 10000);
    }

    #[test]
    fn discounted_prices_are_whole_units_unless_rejected() {
        let prices = [1u64, 9999, 10000, 15000, 123456, 10_000_000];
        let discounts = [
            discount("1", 1),
            discount("1", 37),
            discount("1", 99),
            discount("2", 1),
            discount("2", 7),
            discount("13", 3),
        ];

        for price in prices {
            for d in &discounts {
                let result = discounted_price(price, Some(d));
                assert!(
                    result % PRICE_UNIT == 0 || result == price,
                    "price {} discount {:?} gave {}",
                    price,
                    d,
                    result
                );
            }
        }
    }

    #[test]
    fn computed_price_at_or_below_one_rejects_the_discount() {
        assert_eq!(discounted_price(15000, Some(&discount("13", 0))), 15000);
        assert_eq!(discounted_price(15000, Some(&discount("1", 100))), 15000);
        // Fixed amount bigger than the price saturates to zero and rejects.
        assert_eq!(discounted_price(15000, Some(&discount("2", 2))), 15000);
        // A 99% discount on a tiny price computes 1 and rejects.
        assert_eq!(discounted_price(150, Some(&discount("1", 99))), 150);
    }

    #[test]
    fn unknown_discount_type_changes_nothing() {
        assert_eq!(discounted_price(15000, Some(&discount("7", 10))), 15000);
        assert_eq!(discounted_price(15000, None), 15000);
    }

    #[test]
    fn discount_above_quote_raises_the_quoted_price() {
        let d = discount("13", 3);
        let result = breakdown(Some(&d), 15000, 1).unwrap();
        assert_eq!(result.discount_price, 30000);
        assert_eq!(result.price, 30000, "quoted price raised to policy price");
        assert_eq!(result.sum, 30000);
    }

    #[test]
    fn totals_use_checked_multiplication() {
        let result = breakdown(None, u64::MAX / 2, 3);
        assert!(matches!(result, Err(Error::Overflow)));

        let result = breakdown(None, 15000, 4).unwrap();
        assert_eq!(result.sum, 60000);
        assert_eq!(result.discount_sum, 60000);
    }

    #[test]
    fn quantity_of_one_keeps_unit_sums() {
        let d = discount("1", 50);
        let result = breakdown(Some(&d), 20000, 1).unwrap();
        assert_eq!(result.price, 20000);
        assert_eq!(result.discount_price, 10000);
        assert_eq!(result.sum, 20000);
        assert_eq!(result.discount_sum, 10000);
    }

    #[test]
    fn region_discount_beats_the_wildcard() {
        let mut snapshot = RegionProductDiscounts::new();
        snapshot
            .entry(1)
            .or_insert_with(HashMap::new)
            .insert(7, discount("1", 10));
        snapshot
            .entry(0)
            .or_insert_with(HashMap::new)
            .insert(7, discount("1", 50));
        snapshot
            .entry(0)
            .or_insert_with(HashMap::new)
            .insert(8, discount("1", 20));

        assert_eq!(find_discount(&snapshot, 1, 7), Some(&discount("1", 10)));
        assert_eq!(find_discount(&snapshot, 2, 7), Some(&discount("1", 50)));
        assert_eq!(find_discount(&snapshot, 1, 8), Some(&discount("1", 20)));
        assert_eq!(find_discount(&snapshot, 1, 9), None);
        assert_eq!(find_discount(&snapshot, 0, 7), None, "region 0 never matches");
    }
}
