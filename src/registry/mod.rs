//! Registry side of a publish
//!
//! Reference parsing, registry/repository inference, access checks and the
//! decoding of the engine's push status stream.

pub mod auth;
pub mod resolver;
pub mod status;

pub use auth::{
    Action, AuthProvider, Authenticator, BuiltinAuthenticator, RegistryAuthenticator,
    authenticator_for,
};
pub use resolver::{RegistryResolver, ResolvedIdentity, explicit_domain};
pub use status::{PushOutcome, PushStatusRecord, StatusDecoder};
