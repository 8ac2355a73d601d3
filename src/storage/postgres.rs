// src/storage/postgres.rs
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use super::employee::{EmployeeRow, EmployeeStore, TEMPLATE_SLOTS};
use crate::utils::config::DatabaseConfig;
use crate::utils::error::{EngineError, Result};

const SELECT_COLUMNS: &str = "id_empleado::bigint AS id_empleado, \
     huella_1, huella_2, huella_3, huella_4, \
     huella_gzip_1, huella_gzip_2, huella_gzip_3, huella_gzip_4";

/// Read-only access to `rh.tbl_empleados`.
pub struct PgEmployeeStore {
    pool: PgPool,
}

impl PgEmployeeStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(&config.url())
            .await
            .map_err(|e| EngineError::Store(e.to_string()))?;
        Ok(Self { pool })
    }

    fn row_from_pg(row: &sqlx::postgres::PgRow) -> Result<EmployeeRow> {
        let employee_id: i64 = row
            .try_get("id_empleado")
            .map_err(|e| EngineError::Store(e.to_string()))?;

        let mut out = EmployeeRow {
            employee_id,
            ..Default::default()
        };
        for slot in 0..TEMPLATE_SLOTS {
            let image: Option<String> = row
                .try_get::<Option<String>, _>(format!("huella_{}", slot + 1).as_str())
                .map_err(|e| EngineError::Store(e.to_string()))?;
            let template: Option<String> = row
                .try_get::<Option<String>, _>(format!("huella_gzip_{}", slot + 1).as_str())
                .map_err(|e| EngineError::Store(e.to_string()))?;
            out.images[slot] = image.filter(|s| !s.trim().is_empty());
            out.templates[slot] = template.filter(|s| !s.trim().is_empty());
        }
        Ok(out)
    }
}

#[async_trait]
impl EmployeeStore for PgEmployeeStore {
    async fn fetch_active_employees(&self) -> Result<Vec<EmployeeRow>> {
        let query = format!(
            "SELECT {} FROM rh.tbl_empleados WHERE activo = 1 ORDER BY id_empleado",
            SELECT_COLUMNS
        );
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| EngineError::Store(e.to_string()))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let parsed = Self::row_from_pg(row)?;
            if parsed.has_any_sample() {
                out.push(parsed);
            }
        }
        Ok(out)
    }

    async fn fetch_employee(&self, employee_id: i64) -> Result<Option<EmployeeRow>> {
        let query = format!(
            "SELECT {} FROM rh.tbl_empleados WHERE activo = 1 AND id_empleado = $1",
            SELECT_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(employee_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| EngineError::Store(e.to_string()))?;

        match row {
            Some(row) => Ok(Some(Self::row_from_pg(&row)?)),
            None => Ok(None),
        }
    }
}
