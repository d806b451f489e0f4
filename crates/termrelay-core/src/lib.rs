//! termrelay-core: Shared library for the termrelay SSH terminal relay.
//!
//! Provides the client/relay frame types, the error taxonomy, the keystroke
//! command reconstructor used for auditing, the host credential cipher,
//! HMAC access tokens, staging file naming and incremental UTF-8 decoding.

pub mod command;
pub mod crypt;
pub mod error;
pub mod frames;
pub mod staging;
pub mod token;
pub mod utf8;

// Re-export commonly used items at crate root.
pub use command::{scrub_editor_noise, CommandBuffer, ReconstructorState};
pub use crypt::CredentialCipher;
pub use error::{RelayError, RelayResult};
pub use frames::{ClientFrame, Geometry, ServerFrame, WireMessage};
pub use staging::{file_name, staging_file_name};
pub use token::{create_token, generate_secret, verify_token};
pub use utf8::Utf8Decoder;
