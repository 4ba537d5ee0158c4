//! Required-field checks per event type.
use crate::event::Event;

pub const ORDER_FIELDS: &[&str] = &["id", "customer", "product", "quantity"];
pub const INVENTORY_ADJUSTMENT_FIELDS: &[&str] =
    &["id", "product", "quantity_delta", "adjustment_type"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Valid,
    /// Required fields absent from the document, in table order.
    Invalid(Vec<&'static str>),
}

impl Validation {
    pub fn is_valid(&self) -> bool {
        matches!(self, Validation::Valid)
    }
}

/// Fields that must be present for the event's type. Unknown types require none.
pub fn required_fields(event: &Event) -> &'static [&'static str] {
    match event {
        Event::Order(_) => ORDER_FIELDS,
        Event::InventoryAdjustment(_) => INVENTORY_ADJUSTMENT_FIELDS,
        Event::Unknown { .. } => &[],
    }
}

/// Presence check only: a field set to `null` counts as present.
pub fn validate(event: &Event) -> Validation {
    let document = event.document();
    let missing: Vec<&'static str> = required_fields(event)
        .iter()
        .copied()
        .filter(|field| !document.contains_key(*field))
        .collect();
    if missing.is_empty() {
        Validation::Valid
    } else {
        Validation::Invalid(missing)
    }
}
