//! Text codec for product-inventory records embedded as field values inside
//! cache hashes.
//!
//! Records are pipe-delimited; record lists are newline-delimited with a
//! trailing newline per record. The store-id set decoder counts newlines
//! without parsing ids, which is the wire contract for the store-count RPC.

use crate::error::{Error, Result};
use crate::types::Stock;

/// Single-source inventory view.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InventoryRecord {
    pub price: u64,
    pub quantity: u64,
    pub valid_date: String,
}

/// Region-level inventory view carrying the originating source binding.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InventoryRecordFull {
    pub price: u64,
    pub quantity: u64,
    pub valid_date: String,
    pub store_id: u64,
    pub source_id: u64,
    pub source_type: u64,
    pub varies: bool,
}

impl InventoryRecord {
    pub fn from_stock(stock: &Stock) -> Self {
        Self {
            price: stock.price,
            quantity: stock.qty,
            valid_date: stock.valid_date_str(),
        }
    }

    pub fn encode(&self) -> String {
        format!("{}|{}|{}|", self.price, self.quantity, self.valid_date)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        let mut fields = raw.split('|');

        let price = parse_field(fields.next(), raw)?;
        let quantity = parse_field(fields.next(), raw)?;
        let valid_date = match fields.next() {
            Some(field) if raw.matches('|').count() >= 3 => field.to_string(),
            _ => return Err(corrupt(raw)),
        };

        Ok(Self {
            price,
            quantity,
            valid_date,
        })
    }
}

impl InventoryRecordFull {
    pub fn from_stock(
        stock: &Stock,
        source_type: u64,
        source_id: u64,
        store_id: u64,
        varies: bool,
    ) -> Self {
        Self {
            price: stock.price,
            quantity: stock.qty,
            valid_date: stock.valid_date_str(),
            store_id,
            source_id,
            source_type,
            varies,
        }
    }

    pub fn encode(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}|{}|",
            self.price,
            self.quantity,
            self.valid_date,
            self.store_id,
            self.source_id,
            self.source_type,
            self.varies,
        )
    }

    pub fn decode(raw: &str) -> Result<Self> {
        if raw.matches('|').count() < 7 {
            return Err(corrupt(raw));
        }

        let mut fields = raw.split('|');

        let price = parse_field(fields.next(), raw)?;
        let quantity = parse_field(fields.next(), raw)?;
        let valid_date = fields.next().ok_or_else(|| corrupt(raw))?.to_string();
        let store_id = parse_field(fields.next(), raw)?;
        let source_id = parse_field(fields.next(), raw)?;
        let source_type = parse_field(fields.next(), raw)?;
        let varies = match fields.next() {
            Some("true") => true,
            Some("false") => false,
            _ => return Err(corrupt(raw)),
        };

        Ok(Self {
            price,
            quantity,
            valid_date,
            store_id,
            source_id,
            source_type,
            varies,
        })
    }
}

/// Encodes a list of full records, one per line.
pub fn encode_record_list(records: &[InventoryRecordFull]) -> String {
    let mut out = String::new();
    for record in records {
        out.push_str(&record.encode());
        out.push('\n');
    }
    out
}

pub fn decode_record_list(raw: &str) -> Result<Vec<InventoryRecordFull>> {
    raw.split('\n')
        .filter(|line| !line.is_empty())
        .map(InventoryRecordFull::decode)
        .collect()
}

/// Encodes a store-id set, one decimal id per line.
pub fn encode_store_set(store_ids: &[u64]) -> String {
    let mut out = String::new();
    for store_id in store_ids {
        out.push_str(&store_id.to_string());
        out.push('\n');
    }
    out
}

/// Counts entries without decoding ids; this is the hot path for the
/// storefront store-count lookup.
pub fn count_store_set(raw: &str) -> u64 {
    raw.bytes().filter(|b| *b == b'\n').count() as u64
}

fn parse_field(field: Option<&str>, raw: &str) -> Result<u64> {
    field
        .and_then(|f| f.parse::<u64>().ok())
        .ok_or_else(|| corrupt(raw))
}

fn corrupt(raw: &str) -> Error {
    Error::CorruptRecord(raw.to_string())
}
