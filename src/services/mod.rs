// Order pipeline
pub mod order_processor;
pub mod orders;

// Billing
pub mod invoices;
pub mod numbering;

// Catalog and customers
pub mod customers;
pub mod products;

// Outbound messaging
pub mod mail;
pub mod notifications;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::ValidationError;

pub const DEFAULT_PAGE_SIZE: u64 = 10;
pub const MAX_PAGE_SIZE: u64 = 100;

/// Largest price, cost or discount accepted from clients.
pub const MAX_MONEY_AMOUNT: i64 = 1_000_000_000;

/// Pagination block returned alongside every listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PageMeta {
    pub total: u64,
    pub page: u64,
    pub limit: u64,
    pub total_pages: u64,
}

impl PageMeta {
    pub fn new(total: u64, page: u64, limit: u64) -> Self {
        Self {
            total,
            page,
            limit,
            total_pages: if limit == 0 { 0 } else { total.div_ceil(limit) },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub meta: PageMeta,
}

/// Clamps user-supplied paging to `page >= 1` and `1 <= limit <= MAX_PAGE_SIZE`.
pub fn normalize_paging(page: Option<u64>, limit: Option<u64>) -> (u64, u64) {
    let page = page.unwrap_or(1).max(1);
    let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    (page, limit)
}

/// Money inputs: not negative and at most [`MAX_MONEY_AMOUNT`].
pub fn validate_money(value: &Decimal) -> Result<(), ValidationError> {
    if value.is_sign_negative() && !value.is_zero() {
        let mut err = ValidationError::new("non_negative");
        err.message = Some("must not be negative".into());
        return Err(err);
    }
    if *value > Decimal::from(MAX_MONEY_AMOUNT) {
        let mut err = ValidationError::new("too_large");
        err.message = Some(format!("must not exceed {}", MAX_MONEY_AMOUNT).into());
        return Err(err);
    }
    Ok(())
}

/// Tax rates are percentages between 0 and 100.
pub fn validate_tax_rate(value: &Decimal) -> Result<(), ValidationError> {
    if (value.is_sign_negative() && !value.is_zero()) || *value > Decimal::ONE_HUNDRED {
        let mut err = ValidationError::new("tax_rate");
        err.message = Some("must be between 0 and 100".into());
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn money_bounds() {
        assert!(validate_money(&dec!(0)).is_ok());
        assert!(validate_money(&dec!(1000000000)).is_ok());
        assert!(validate_money(&dec!(-0.01)).is_err());
        assert!(validate_money(&dec!(1000000000.01)).is_err());
        assert!(validate_money(&Decimal::MAX).is_err());
    }

    #[test]
    fn tax_rate_bounds() {
        assert!(validate_tax_rate(&dec!(0)).is_ok());
        assert!(validate_tax_rate(&dec!(100)).is_ok());
        assert!(validate_tax_rate(&dec!(100.01)).is_err());
        assert!(validate_tax_rate(&dec!(-1)).is_err());
    }

    #[test]
    fn page_meta_rounds_total_pages_up() {
        assert_eq!(PageMeta::new(0, 1, 10).total_pages, 0);
        assert_eq!(PageMeta::new(10, 1, 10).total_pages, 1);
        assert_eq!(PageMeta::new(11, 2, 10).total_pages, 2);
    }

    #[test]
    fn paging_defaults_and_clamps() {
        assert_eq!(normalize_paging(None, None), (1, DEFAULT_PAGE_SIZE));
        assert_eq!(normalize_paging(Some(0), Some(0)), (1, 1));
        assert_eq!(normalize_paging(Some(3), Some(1_000)), (3, MAX_PAGE_SIZE));
    }
}
