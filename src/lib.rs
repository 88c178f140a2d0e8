//! Query planning layer of a distributed document-query engine.
//!
//! A normalized [`algebra::Statement`] goes in, an executable
//! [`plan::Operator`] tree comes out. Trees encode to a stable JSON form so a
//! plan prepared on one node can be shipped to and verified on another, and
//! named plans live in a [`PreparedCache`] between executions.
//!
//! ```
//! use std::sync::Arc;
//! use docplan::algebra::Statement;
//! use docplan::catalog::InMemoryCatalog;
//! use docplan::expr::parse_select;
//! use docplan::{Builder, PlannerConfig};
//!
//! # fn main() -> docplan::Result<()> {
//! let catalog = Arc::new(InMemoryCatalog::new().with_primary_index("orders"));
//! let builder = Builder::new(PlannerConfig::default(), catalog);
//! let select = parse_select("select `o`.`id` from `orders` as `o` where `o`.`total` > 10")?;
//! let plan = builder.build(&Statement::Select(select))?;
//! assert!(plan.readonly());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod algebra;
pub mod auth;
pub mod builder;
pub mod catalog;
pub mod config;
pub mod error;
pub mod expr;
pub mod plan;
pub mod prepareds;

pub use builder::{Builder, Estimator};
pub use config::PlannerConfig;
pub use error::{ErrorKind, PlanError, Result};
pub use plan::{Operator, Prepared};
pub use prepareds::{GetOptions, PreparedCache};
