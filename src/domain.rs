//! Listing-side collaborators of the import.
//!
//! The import only talks to listings through [`ListingBuilder`] and
//! [`CategoryResolver`]. [`DemoCatalog`] and [`StaticCategories`] are small
//! in-memory stand-ins used by the binary and the tests.

use crate::models::{Action, ListingRecord};
use crate::schema::SanitizedRow;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Category {
    pub id: u32,
    pub name: &'static str,
}

/// Money fields of a listing, in cents. All but `price_cents` are nullable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PriceFields {
    pub price_cents: Option<i64>,
    pub basic_price_cents: Option<i64>,
    pub transport_type1_price_cents: Option<i64>,
    pub transport_type2_price_cents: Option<i64>,
    pub payment_cash_on_delivery_price_cents: Option<i64>,
}

impl PriceFields {
    pub fn from_row(row: &SanitizedRow) -> Self {
        let cents = |column: &str| row.value(column).and_then(|value| value.parse::<i64>().ok());
        Self {
            price_cents: cents("price_cents"),
            basic_price_cents: cents("basic_price_cents"),
            transport_type1_price_cents: cents("transport_type1_price_cents"),
            transport_type2_price_cents: cents("transport_type2_price_cents"),
            payment_cash_on_delivery_price_cents: cents("payment_cash_on_delivery_price_cents"),
        }
    }

    pub fn normalize(&mut self) {
        for field in [
            &mut self.basic_price_cents,
            &mut self.transport_type1_price_cents,
            &mut self.transport_type2_price_cents,
            &mut self.payment_cash_on_delivery_price_cents,
        ] {
            field.get_or_insert(0);
        }
    }

    /// Writes every known amount back into the row.
    pub fn write_into(&self, row: &mut SanitizedRow) {
        for (column, value) in [
            ("price_cents", self.price_cents),
            ("basic_price_cents", self.basic_price_cents),
            ("transport_type1_price_cents", self.transport_type1_price_cents),
            ("transport_type2_price_cents", self.transport_type2_price_cents),
            (
                "payment_cash_on_delivery_price_cents",
                self.payment_cash_on_delivery_price_cents,
            ),
        ] {
            if let Some(value) = value {
                row.insert(column, value.to_string());
            }
        }
    }
}

/// A listing resolved for one row, not yet published.
#[derive(Debug, Clone)]
pub struct ListingDraft {
    pub listing_id: String,
    pub external_id: Option<String>,
    pub action: Action,
    pub user_id: String,
    pub attributes: SanitizedRow,
    pub categories: Vec<Category>,
    pub prices: PriceFields,
    /// Validation messages carried over from the stored listing.
    pub errors: Vec<String>,
    pub invalid_before: bool,
}

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("listing is invalid: {}", .0.join("; "))]
    Invalid(Vec<String>),
    #[error("listing backend failed: {0}")]
    Internal(String),
}

impl DomainError {
    pub fn messages(&self) -> Vec<String> {
        match self {
            DomainError::Invalid(messages) => messages.clone(),
            DomainError::Internal(message) => vec![message.clone()],
        }
    }
}

#[async_trait]
pub trait ListingBuilder: Send + Sync {
    /// Merges questionnaire and commendation fields into the row.
    fn enrich(&self, row: SanitizedRow) -> SanitizedRow {
        row
    }

    /// `Ok(None)` means the row targets nothing and is skipped.
    async fn resolve_or_create(
        &self,
        row: SanitizedRow,
        action: Action,
        user_id: &str,
    ) -> Result<Option<ListingDraft>, DomainError>;

    fn is_invalid_due_to_prior_state(&self, draft: &ListingDraft) -> bool {
        draft.invalid_before
    }

    async fn apply_fees_and_publish(
        &self,
        draft: ListingDraft,
        import_job_id: Uuid,
    ) -> Result<ListingRecord, DomainError>;
}

#[async_trait]
pub trait CategoryResolver: Send + Sync {
    /// `None` when the field names no known category.
    async fn resolve(&self, field: Option<&str>) -> Option<Vec<Category>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListingState {
    Active,
    Locked,
    Closed,
}

#[derive(Debug, Clone)]
struct StoredListing {
    listing_id: String,
    state: ListingState,
    attributes: SanitizedRow,
    invalid: Option<Vec<String>>,
}

const FEE_PERCENT: i64 = 6;
const MIN_FEE_CENTS: i64 = 10;

/// In-memory catalog keyed by owner and external id.
#[derive(Default)]
pub struct DemoCatalog {
    listings: Mutex<HashMap<(String, String), StoredListing>>,
}

impl DemoCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
impl DemoCatalog {
    pub async fn seed(&self, user_id: &str, external_id: &str, title: &str) {
        let mut attributes = SanitizedRow::default();
        attributes.insert("title", title);
        self.insert(user_id, external_id, attributes, None).await;
    }

    /// Seeds a listing that already failed validation before this import.
    pub async fn seed_invalid(&self, user_id: &str, external_id: &str, messages: &[&str]) {
        let messages = messages.iter().map(|message| message.to_string()).collect();
        self.insert(user_id, external_id, SanitizedRow::default(), Some(messages))
            .await;
    }

    async fn insert(
        &self,
        user_id: &str,
        external_id: &str,
        attributes: SanitizedRow,
        invalid: Option<Vec<String>>,
    ) {
        self.listings.lock().await.insert(
            (user_id.to_string(), external_id.to_string()),
            StoredListing {
                listing_id: Uuid::new_v4().to_string(),
                state: ListingState::Active,
                attributes,
                invalid,
            },
        );
    }

    pub async fn len(&self) -> usize {
        self.listings.lock().await.len()
    }

    pub async fn attributes(&self, user_id: &str, external_id: &str) -> Option<SanitizedRow> {
        self.listings
            .lock()
            .await
            .get(&(user_id.to_string(), external_id.to_string()))
            .map(|listing| listing.attributes.clone())
    }

    pub async fn is_active(&self, user_id: &str, external_id: &str) -> bool {
        self.listings
            .lock()
            .await
            .get(&(user_id.to_string(), external_id.to_string()))
            .is_some_and(|listing| listing.state == ListingState::Active)
    }
}

fn external_id(row: &SanitizedRow) -> Option<String> {
    row.value("id")
        .or_else(|| row.value("custom_seller_identifier"))
        .map(str::to_string)
}

fn validate(draft: &ListingDraft) -> Vec<String> {
    let mut messages = Vec::new();
    if matches!(draft.action, Action::Deactivate | Action::Delete) {
        return messages;
    }
    let row = &draft.attributes;
    if row.value("title").is_none() {
        messages.push("Title can't be blank".to_string());
    }
    match row.value("price_cents").map(str::parse::<i64>) {
        None => messages.push("Price can't be blank".to_string()),
        Some(Ok(cents)) if cents > 0 => {}
        Some(_) => messages.push("Price must be a positive number of cents".to_string()),
    }
    if let Some(quantity) = row.value("quantity")
        && !quantity.parse::<u32>().is_ok_and(|value| value >= 1)
    {
        messages.push("Quantity must be a whole number of at least 1".to_string());
    }
    if draft.categories.is_empty() {
        messages.push("Categories can't be blank".to_string());
    }
    messages
}

fn fee_cents(draft: &ListingDraft) -> Result<i64, DomainError> {
    if matches!(draft.action, Action::Deactivate | Action::Delete) {
        return Ok(0);
    }
    let price = draft.prices.price_cents.unwrap_or(0);
    price
        .checked_mul(FEE_PERCENT)
        .map(|scaled| (scaled / 100).max(MIN_FEE_CENTS))
        .ok_or_else(|| DomainError::Invalid(vec!["Price is too high".to_string()]))
}

#[async_trait]
impl ListingBuilder for DemoCatalog {
    fn enrich(&self, mut row: SanitizedRow) -> SanitizedRow {
        if row.value("fair_kind").is_none() && row.value("fair_seal").is_some() {
            row.insert("fair_kind", "fair_seal");
        }
        row
    }

    async fn resolve_or_create(
        &self,
        row: SanitizedRow,
        action: Action,
        user_id: &str,
    ) -> Result<Option<ListingDraft>, DomainError> {
        let external_id = external_id(&row);
        let guard = self.listings.lock().await;
        let existing = external_id
            .as_ref()
            .and_then(|id| guard.get(&(user_id.to_string(), id.clone())));

        let (listing_id, attributes, invalid) = match (action, existing) {
            (Action::Create, Some(_)) => return Ok(None),
            (Action::Create, None) => (Uuid::new_v4().to_string(), row, None),
            (_, None) => return Ok(None),
            (Action::Update, Some(stored)) => {
                let mut merged = stored.attributes.clone();
                for (column, value) in row.iter() {
                    if !value.trim().is_empty() {
                        merged.insert(column, value);
                    }
                }
                (stored.listing_id.clone(), merged, stored.invalid.clone())
            }
            (_, Some(stored)) => (
                stored.listing_id.clone(),
                stored.attributes.clone(),
                stored.invalid.clone(),
            ),
        };

        let prices = PriceFields::from_row(&attributes);
        Ok(Some(ListingDraft {
            listing_id,
            external_id,
            action,
            user_id: user_id.to_string(),
            attributes,
            categories: Vec::new(),
            prices,
            invalid_before: invalid.is_some(),
            errors: invalid.unwrap_or_default(),
        }))
    }

    async fn apply_fees_and_publish(
        &self,
        draft: ListingDraft,
        import_job_id: Uuid,
    ) -> Result<ListingRecord, DomainError> {
        let messages = validate(&draft);
        if !messages.is_empty() {
            return Err(DomainError::Invalid(messages));
        }
        let fee_cents = fee_cents(&draft)?;
        let mut attributes = draft.attributes;
        draft.prices.write_into(&mut attributes);
        let state = match draft.action {
            Action::Deactivate => ListingState::Locked,
            Action::Delete => ListingState::Closed,
            _ => ListingState::Active,
        };
        let key = draft
            .external_id
            .clone()
            .unwrap_or_else(|| draft.listing_id.clone());
        self.listings.lock().await.insert(
            (draft.user_id.clone(), key),
            StoredListing {
                listing_id: draft.listing_id.clone(),
                state,
                attributes,
                invalid: None,
            },
        );
        Ok(ListingRecord {
            listing_id: draft.listing_id,
            external_id: draft.external_id,
            action: draft.action,
            fee_cents,
            import_job_id,
        })
    }
}

#[derive(Clone, Copy)]
pub struct CategoryDefinition {
    id: u32,
    name: &'static str,
}

const CATEGORY_POOL: [CategoryDefinition; 6] = [
    CategoryDefinition {
        id: 1,
        name: "Other",
    },
    CategoryDefinition {
        id: 2,
        name: "Clothing & Accessories",
    },
    CategoryDefinition {
        id: 3,
        name: "Food & Drink",
    },
    CategoryDefinition {
        id: 4,
        name: "Household",
    },
    CategoryDefinition {
        id: 5,
        name: "Books",
    },
    CategoryDefinition {
        id: 6,
        name: "Electronics",
    },
];

/// Resolves a comma separated list of category ids or names.
#[derive(Clone)]
pub struct StaticCategories {
    pool: &'static [CategoryDefinition],
}

impl Default for StaticCategories {
    fn default() -> Self {
        Self {
            pool: &CATEGORY_POOL,
        }
    }
}

#[async_trait]
impl CategoryResolver for StaticCategories {
    async fn resolve(&self, field: Option<&str>) -> Option<Vec<Category>> {
        let mut found = Vec::new();
        for token in field?.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let hit = self.pool.iter().find(|definition| {
                token
                    .parse::<u32>()
                    .map(|id| id == definition.id)
                    .unwrap_or_else(|_| definition.name.eq_ignore_ascii_case(token))
            });
            if let Some(definition) = hit {
                let category = Category {
                    id: definition.id,
                    name: definition.name,
                };
                if !found.contains(&category) {
                    found.push(category);
                }
            }
        }
        (!found.is_empty()).then_some(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::RawRow;

    fn row(pairs: &[(&str, &str)]) -> SanitizedRow {
        let raw: RawRow = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SanitizedRow::from_raw(&raw)
    }

    #[tokio::test]
    async fn categories_resolve_by_id_or_name() {
        let categories = StaticCategories::default();
        let found = categories.resolve(Some("3, books ,99, 3")).await.unwrap();
        assert_eq!(
            found.iter().map(|c| c.id).collect::<Vec<_>>(),
            vec![3, 5]
        );
        assert!(categories.resolve(Some("unknown")).await.is_none());
        assert!(categories.resolve(None).await.is_none());
    }

    #[test]
    fn prices_normalize_to_zero() {
        let mut prices = PriceFields::from_row(&row(&[("transport_type1_price_cents", "450")]));
        prices.normalize();
        assert_eq!(prices.basic_price_cents, Some(0));
        assert_eq!(prices.transport_type1_price_cents, Some(450));
        assert_eq!(prices.payment_cash_on_delivery_price_cents, Some(0));
    }

    #[tokio::test]
    async fn create_on_known_id_is_skipped() {
        let catalog = DemoCatalog::new();
        catalog.seed("u1", "sku-1", "Mug").await;
        let draft = catalog
            .resolve_or_create(row(&[("id", "sku-1")]), Action::Create, "u1")
            .await
            .unwrap();
        assert!(draft.is_none());

        let other_user = catalog
            .resolve_or_create(row(&[("id", "sku-1")]), Action::Create, "u2")
            .await
            .unwrap();
        assert!(other_user.is_some());
    }

    #[tokio::test]
    async fn update_requires_existing_listing() {
        let catalog = DemoCatalog::new();
        let missing = catalog
            .resolve_or_create(row(&[("id", "nope")]), Action::Update, "u1")
            .await
            .unwrap();
        assert!(missing.is_none());

        catalog.seed("u1", "sku-2", "Old title").await;
        let draft = catalog
            .resolve_or_create(
                row(&[("custom_seller_identifier", "sku-2"), ("price_cents", "900")]),
                Action::Update,
                "u1",
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(draft.attributes.value("title"), Some("Old title"));
        assert_eq!(draft.attributes.value("price_cents"), Some("900"));
    }

    #[tokio::test]
    async fn prior_invalid_state_is_reported() {
        let catalog = DemoCatalog::new();
        catalog
            .seed_invalid("u1", "sku-3", &["Content can't be blank"])
            .await;
        let draft = catalog
            .resolve_or_create(row(&[("id", "sku-3")]), Action::Activate, "u1")
            .await
            .unwrap()
            .unwrap();
        assert!(catalog.is_invalid_due_to_prior_state(&draft));
        assert_eq!(draft.errors, vec!["Content can't be blank".to_string()]);
    }

    #[tokio::test]
    async fn publish_validates_and_charges_fee() {
        let catalog = DemoCatalog::new();
        let job_id = Uuid::new_v4();
        let mut draft = catalog
            .resolve_or_create(
                row(&[("title", "Tea"), ("price_cents", "2000"), ("quantity", "3")]),
                Action::Create,
                "u1",
            )
            .await
            .unwrap()
            .unwrap();
        draft.categories = vec![Category { id: 3, name: "Food & Drink" }];
        let record = catalog.apply_fees_and_publish(draft, job_id).await.unwrap();
        assert_eq!(record.fee_cents, 120);
        assert_eq!(record.import_job_id, job_id);

        let invalid = catalog
            .resolve_or_create(row(&[("price_cents", "-5")]), Action::Create, "u1")
            .await
            .unwrap()
            .unwrap();
        let err = catalog
            .apply_fees_and_publish(invalid, job_id)
            .await
            .unwrap_err();
        let messages = err.messages();
        assert!(messages.contains(&"Title can't be blank".to_string()));
        assert!(messages.contains(&"Price must be a positive number of cents".to_string()));
        assert!(messages.contains(&"Categories can't be blank".to_string()));
    }

    async fn draft_for(catalog: &DemoCatalog, pairs: &[(&str, &str)]) -> ListingDraft {
        let mut draft = catalog
            .resolve_or_create(row(pairs), Action::Create, "u1")
            .await
            .unwrap()
            .unwrap();
        draft.categories = vec![Category { id: 5, name: "Books" }];
        draft
    }

    #[tokio::test]
    async fn published_listing_carries_normalized_prices() {
        let catalog = DemoCatalog::new();
        let mut draft = draft_for(
            &catalog,
            &[
                ("id", "sku-5"),
                ("title", "Novel"),
                ("price_cents", "1500"),
                ("transport_type1_price_cents", "450"),
            ],
        )
        .await;
        draft.prices.normalize();
        catalog
            .apply_fees_and_publish(draft, Uuid::new_v4())
            .await
            .unwrap();

        let stored = catalog.attributes("u1", "sku-5").await.unwrap();
        assert_eq!(stored.value("transport_type1_price_cents"), Some("450"));
        assert_eq!(stored.value("transport_type2_price_cents"), Some("0"));
        assert_eq!(stored.value("payment_cash_on_delivery_price_cents"), Some("0"));
        assert_eq!(stored.value("basic_price_cents"), Some("0"));
    }

    #[tokio::test]
    async fn fee_on_huge_price_is_a_validation_error() {
        let catalog = DemoCatalog::new();
        let draft = draft_for(
            &catalog,
            &[("id", "sku-6"), ("title", "Gold"), ("price_cents", &i64::MAX.to_string())],
        )
        .await;
        let err = catalog
            .apply_fees_and_publish(draft, Uuid::new_v4())
            .await
            .unwrap_err();
        assert_eq!(err.messages(), vec!["Price is too high".to_string()]);
        assert!(catalog.attributes("u1", "sku-6").await.is_none());
    }

    #[tokio::test]
    async fn delete_closes_listing() {
        let catalog = DemoCatalog::new();
        catalog.seed("u1", "sku-4", "Lamp").await;
        let draft = catalog
            .resolve_or_create(row(&[("id", "sku-4")]), Action::Delete, "u1")
            .await
            .unwrap()
            .unwrap();
        let record = catalog
            .apply_fees_and_publish(draft, Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(record.fee_cents, 0);
        assert!(!catalog.is_active("u1", "sku-4").await);
    }

    #[test]
    fn enrich_derives_fair_kind() {
        let enriched = DemoCatalog::new().enrich(row(&[("fair_seal", "trusted")]));
        assert_eq!(enriched.value("fair_kind"), Some("fair_seal"));
    }
}
