#![doc = include_str!("../README.md")]
#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results,
    variant_size_differences
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! The ingestion pipeline is assembled from small single-purpose crates:
//! vehicle **identity** extraction, the wire **envelope** codec, the
//! **record** unit of work, the **producer** contract with its **backends**
//! adapters, the static **router**, the **config** document, and the
//! **server** tying listener, connection handlers, registry, rate limiting,
//! and ack coordination together.

pub use backends;
pub use config;
pub use envelope;
pub use identity;
pub use producer;
pub use record;
pub use router;
pub use server;
