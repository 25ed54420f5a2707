//! `quarry-datasets`: datasets, their annotations and their result items.
//!
//! A dataset is either a top-level collection (a datasource search) or the
//! output of a processor run on another dataset, linked through
//! `key_parent`. Deleting a dataset deletes its whole subtree.

pub mod db;
pub mod error;
pub mod items;
pub mod store;
pub mod types;

pub use error::{DatasetError, Result};
pub use items::{Item, ItemSource, ItemWriter, Items};
pub use store::DatasetStore;
pub use types::{Annotation, Dataset, NewAnnotation, NewDataset, PARAM_DATASOURCE, PARAM_KEEP};
