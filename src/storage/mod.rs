pub mod employee;
pub mod postgres;

pub use employee::{EmployeeRow, EmployeeStore, TEMPLATE_SLOTS};
pub use postgres::PgEmployeeStore;
