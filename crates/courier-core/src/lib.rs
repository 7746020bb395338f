//! courier-core: wire envelope, fragmentation, and cryptographic primitives.
//! All other Courier crates depend on this one.

pub mod config;
pub mod crypto;
pub mod envelope;
pub mod fragment;

pub use config::CourierConfig;
pub use crypto::{KeyResolver, KeySource, SecretKey};
pub use envelope::{
    Codec, CodecError, EncodeOptions, Envelope, FileMetadata, Outbound, Payload, PayloadKind,
};
pub use fragment::FragmentError;
