//! Canonical column layout of the listing import file.
//!
//! Adding or removing a column changes which files can be imported and how
//! failed rows are written back out.

use once_cell::sync::Lazy;
use std::collections::{BTreeMap, HashMap};

/// Encoding indicator column placed first by the spreadsheet template.
pub const ENCODING_MARKER_COLUMN: &str = "€";

pub const FIELD_SEPARATOR: u8 = b';';

pub const CANONICAL_COLUMNS: &[&str] = &[
    "id",
    "title",
    "categories",
    "condition",
    "condition_extra",
    "content",
    "quantity",
    "price_cents",
    "basic_price_cents",
    "basic_price_amount",
    "vat",
    "external_title_image_url",
    "image_2_url",
    "transport_pickup",
    "transport_type1",
    "transport_type1_provider",
    "transport_type1_price_cents",
    "transport_type1_number",
    "transport_type2",
    "transport_type2_provider",
    "transport_type2_price_cents",
    "transport_type2_number",
    "transport_details",
    "payment_bank_transfer",
    "payment_cash",
    "payment_paypal",
    "payment_cash_on_delivery",
    "payment_cash_on_delivery_price_cents",
    "payment_invoice",
    "payment_details",
    "fair_kind",
    "fair_seal",
    "support",
    "support_checkboxes",
    "support_other",
    "support_explanation",
    "labor_conditions",
    "labor_conditions_checkboxes",
    "labor_conditions_other",
    "labor_conditions_explanation",
    "environment_protection",
    "environment_protection_checkboxes",
    "environment_protection_other",
    "environment_protection_explanation",
    "controlling",
    "controlling_checkboxes",
    "controlling_other",
    "controlling_explanation",
    "awareness_raising",
    "awareness_raising_checkboxes",
    "awareness_raising_other",
    "awareness_raising_explanation",
    "nonprofit_association",
    "nonprofit_association_checkboxes",
    "social_businesses_muhammad_yunus",
    "social_businesses_muhammad_yunus_checkboxes",
    "social_entrepreneur",
    "social_entrepreneur_checkboxes",
    "social_entrepreneur_explanation",
    "ecologic_seal",
    "upcycling_reason",
    "small_and_precious_eu_small_enterprise",
    "small_and_precious_reason",
    "small_and_precious_handmade",
    "gtin",
    "custom_seller_identifier",
    "action",
];

static COLUMN_POSITIONS: Lazy<HashMap<&'static str, usize>> = Lazy::new(|| {
    CANONICAL_COLUMNS
        .iter()
        .enumerate()
        .map(|(position, column)| (*column, position))
        .collect()
});

/// Row exactly as read from the file (minus the encoding marker), keyed by header.
pub type RawRow = BTreeMap<String, String>;

/// A row reduced to the canonical columns, iterated in canonical order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SanitizedRow {
    fields: BTreeMap<usize, String>,
}

impl SanitizedRow {
    /// Drops every field whose header is not a canonical column.
    pub fn from_raw(raw: &RawRow) -> Self {
        let fields = raw
            .iter()
            .filter_map(|(column, value)| {
                COLUMN_POSITIONS
                    .get(column.as_str())
                    .map(|position| (*position, value.clone()))
            })
            .collect();
        Self { fields }
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        let position = COLUMN_POSITIONS.get(column)?;
        self.fields.get(position).map(String::as_str)
    }

    /// Non-blank value of a column, trimmed.
    pub fn value(&self, column: &str) -> Option<&str> {
        self.get(column)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn take(&mut self, column: &str) -> Option<String> {
        let position = COLUMN_POSITIONS.get(column)?;
        self.fields.remove(position)
    }

    /// Returns false (and stores nothing) for a non-canonical column.
    pub fn insert(&mut self, column: &str, value: impl Into<String>) -> bool {
        match COLUMN_POSITIONS.get(column) {
            Some(position) => {
                self.fields.insert(*position, value.into());
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        self.fields
            .iter()
            .map(|(position, value)| (CANONICAL_COLUMNS[*position], value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Header line of an import file, without the encoding marker.
pub fn header_line() -> String {
    let mut writer = line_writer();
    // Writing into a Vec cannot fail.
    let _ = writer.write_record(CANONICAL_COLUMNS);
    finish_line(writer).unwrap_or_default()
}

/// Writes the original row back out in canonical column order.
///
/// Missing columns become empty fields; non-canonical columns are dropped.
pub fn to_csv_line(raw: &RawRow) -> Result<String, csv::Error> {
    let mut writer = line_writer();
    writer.write_record(
        CANONICAL_COLUMNS
            .iter()
            .map(|column| raw.get(*column).map(String::as_str).unwrap_or("")),
    )?;
    finish_line(writer)
}

fn line_writer() -> csv::Writer<Vec<u8>> {
    csv::WriterBuilder::new()
        .delimiter(FIELD_SEPARATOR)
        .has_headers(false)
        .from_writer(Vec::new())
}

fn finish_line(writer: csv::Writer<Vec<u8>>) -> Result<String, csv::Error> {
    let bytes = writer
        .into_inner()
        .map_err(|err| csv::Error::from(err.into_error()))?;
    let line = String::from_utf8_lossy(&bytes);
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}
