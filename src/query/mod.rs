//! Query shapes and result materialization.

mod materialize;
mod shape;

pub use materialize::{
    stabilize, Completeness, Materialized, Materializer, ResultConnection, ResultNode, ResultObject,
};
pub use shape::{FieldSelection, SelectionSet};
