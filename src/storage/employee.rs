// src/storage/employee.rs
use async_trait::async_trait;

use crate::utils::error::Result;

pub const TEMPLATE_SLOTS: usize = 4;

/// One employee row as read from the external store: up to four raw image
/// slots and four serialized template slots. Blank strings are normalized
/// to `None` at the read boundary.
#[derive(Debug, Clone, Default)]
pub struct EmployeeRow {
    pub employee_id: i64,
    pub images: [Option<String>; TEMPLATE_SLOTS],
    pub templates: [Option<String>; TEMPLATE_SLOTS],
}

impl EmployeeRow {
    /// A row is indexable when any slot carries data.
    pub fn has_any_sample(&self) -> bool {
        self.images.iter().any(Option::is_some) || self.templates.iter().any(Option::is_some)
    }
}

/// Thin read interface over the employee store. The engine never writes;
/// enrollment and schema management live elsewhere.
#[async_trait]
pub trait EmployeeStore: Send + Sync {
    /// All active employees with at least one non-empty sample slot.
    async fn fetch_active_employees(&self) -> Result<Vec<EmployeeRow>>;

    /// A single active employee, `None` when absent or inactive.
    async fn fetch_employee(&self, employee_id: i64) -> Result<Option<EmployeeRow>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_rows_are_not_indexable() {
        let row = EmployeeRow {
            employee_id: 7,
            ..Default::default()
        };
        assert!(!row.has_any_sample());

        let mut with_image = row.clone();
        with_image.images[2] = Some("iVBOR...".into());
        assert!(with_image.has_any_sample());

        let mut with_template = row;
        with_template.templates[0] = Some("H4sI...".into());
        assert!(with_template.has_any_sample());
    }
}
