pub mod credentials;
pub mod errors;
pub mod events;
pub mod messages;
pub mod params;

pub use credentials::{CredentialBundle, ServiceAccountInfo};
pub use errors::{CredentialError, ToolError, ValidationError};
pub use messages::{BlobMeta, ToolMessage};
