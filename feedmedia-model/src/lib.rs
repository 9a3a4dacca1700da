//! Data model shared by the feedmedia engine and its embedders.
#![allow(missing_docs)]

pub mod error;
pub mod ids;
pub mod media;
pub mod request;

pub use error::{ModelError, Result as ModelResult};
pub use ids::{ItemId, RequestKey};
pub use media::{MediaKind, MediaRef};
pub use request::{LoadProgress, Priority, RequestState};
