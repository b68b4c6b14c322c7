//! # triggerfish-sql
//!
//! Definition-time half of Triggerfish: everything needed to turn a typed
//! trigger description into PostgreSQL DDL, with no I/O.
//!
//! ## Features
//!
//! - **Conditions**: a closed expression tree over `NEW` / `OLD` with a
//!   combinator API, a parser for arrow-function predicate source, a compiler
//!   to `WHEN (...)` fragments and a client-side evaluator with SQL semantics
//! - **Trigger builder**: validates timing, operations, granularity, watched
//!   columns, conditions and targets before any DDL exists
//! - **Model catalog**: the boundary through which a schema layer supplies
//!   table names and typed fields
//! - **DDL**: managed `pg_notify` functions and `CREATE/DROP TRIGGER`
//!
//! ## Quick Start
//!
//! ```rust
//! use triggerfish_sql::prelude::*;
//!
//! let spec = TriggerBuilder::new()
//!     .model("orders")
//!     .name("order_paid")
//!     .after()
//!     .on_update()
//!     .when_source("(NEW, OLD) => NEW.status === 'paid' && NEW.status !== OLD.status")
//!     .notify()
//!     .build()?;
//!
//! for statement in TriggerDdl::new(&spec).setup_statements() {
//!     println!("{statement};");
//! }
//! # Ok::<(), triggerfish_sql::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod catalog;
pub mod condition;
pub mod ddl;
pub mod error;
pub mod security;
pub mod trigger;

pub use error::{Error, Result, ValidationError};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::catalog::{FieldInfo, FieldType, ModelCatalog, ModelInfo, StaticCatalog};
    pub use crate::condition::{
        changed, compile, new_field, old_field, parse_predicate, CompareOp, Condition, FieldRef,
        Literal, Operand, PatternKind, Row, RowAccess, RowRef, SqlCondition,
    };
    pub use crate::ddl::TriggerDdl;
    pub use crate::error::{Error, RequiredField, Result, ValidationError};
    pub use crate::trigger::{
        TriggerBuilder, TriggerFunction, TriggerLevel, TriggerOperation, TriggerSpec,
        TriggerTiming, DEFAULT_SCHEMA,
    };
}
