/// Aurora Lens - ATProto AppView read layer
///
/// A Rust implementation of the hydration core behind an ATProto AppView:
/// request-scoped batched loaders, a hydration engine that turns post URIs
/// into fully resolved views, embed and label resolution, viewer-relative
/// moderation, thread assembly and a namespaced TTL result cache over the
/// tables an ingestion pipeline maintains.
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod hydration;
pub mod loader;
pub mod metrics;
pub mod store;
pub mod thread;
pub mod uri;
pub mod views;

pub use cache::ResultCache;
pub use config::AppViewConfig;
pub use context::AppContext;
pub use error::{AppViewError, AppViewResult};
pub use hydration::{HydrationSnapshot, Hydrator};
pub use loader::Loaders;
pub use store::RecordStore;
pub use thread::{ThreadAssembler, ThreadTree};
