//! Per-collection record mirror on top of a server connection.

pub mod cache;
pub mod collection;
pub mod template;

pub use cache::RecordCache;
pub use collection::{CollectionEvent, CollectionSync};
pub use template::{merge_template, representative_record, TemplateOptions};
