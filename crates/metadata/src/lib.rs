//! On-disk mirror of enrichment output.
//!
//! Every enriched vault file `<rel>` gets a pretty-printed sidecar document at
//! `<metadata_dir>/<rel>.json`, and a summary entry in the aggregate
//! `<metadata_dir>/index.json`.

mod document;
mod fs;
mod index;
mod store;

pub use document::{IndexEntry, MetadataDocument};
pub use index::{INDEX_FILE_NAME, SidecarIndex};
pub use store::MetadataStore;
