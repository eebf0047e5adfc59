#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! Vehicle identity extraction and validation.
//!
//! A vehicle is named by a `(device_id, sender_id)` pair. The device id is
//! the bare identifier carried in the client certificate; the sender id is
//! the hierarchical form (`vehicle_device.<device_id>`) carried in every
//! wire envelope. The identity of a connection is fixed at handshake time
//! and every envelope received on that connection must agree with it.

use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

/// Prefix of the hierarchical sender id form.
pub const SENDER_ID_PREFIX: &str = "vehicle_device.";

/// All the errors that can occur while extracting or validating an identity.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// No identity could be extracted from the peer certificate.
    #[error("no vehicle identity in peer certificate (source: {source_field})")]
    IdentityMissing {
        /// The certificate field that was inspected.
        source_field: &'static str,
    },

    /// A sender id did not have the expected hierarchical form.
    #[error("invalid sender id (sender_id: {sender_id})")]
    InvalidSenderId {
        /// The offending sender id, lossily decoded for diagnostics.
        sender_id: String,
    },

    /// The peer certificate could not be parsed.
    #[error("peer certificate parse failure (reason: {reason})")]
    CertificateParse {
        /// The parser error message.
        reason: String,
    },
}

/// The certificate field the device id is extracted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentitySource {
    /// The subject common name holds the device id verbatim.
    CommonName,
    /// The first URI subject-alternative-name holds the device id as its
    /// last path segment (e.g. `spiffe://fleet/device/<device_id>`).
    SanUri,
}

/// The `(device_id, sender_id)` pair uniquely naming a vehicle.
///
/// Immutable for the life of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    device_id: String,
    sender_id: String,
}

impl Identity {
    /// Creates an identity from a bare device id.
    pub fn from_device_id(device_id: &str) -> Result<Self, Error> {
        if device_id.is_empty() {
            return Err(Error::IdentityMissing {
                source_field: "device_id",
            });
        }
        Ok(Self {
            device_id: device_id.to_string(),
            sender_id: format!("{SENDER_ID_PREFIX}{device_id}"),
        })
    }

    /// Parses the hierarchical sender id form (`vehicle_device.<device_id>`).
    pub fn from_sender_id(sender_id: &[u8]) -> Result<Self, Error> {
        let sender_id = std::str::from_utf8(sender_id).map_err(|_| Error::InvalidSenderId {
            sender_id: String::from_utf8_lossy(sender_id).into_owned(),
        })?;
        match sender_id.strip_prefix(SENDER_ID_PREFIX) {
            Some(device_id) if !device_id.is_empty() => Ok(Self {
                device_id: device_id.to_string(),
                sender_id: sender_id.to_string(),
            }),
            _ => Err(Error::InvalidSenderId {
                sender_id: sender_id.to_string(),
            }),
        }
    }

    /// Extracts the identity from a DER-encoded client certificate.
    ///
    /// Failure to extract is terminal for the connection; no diagnostic is
    /// returned to the peer.
    pub fn from_client_cert(der: &[u8], source: IdentitySource) -> Result<Self, Error> {
        let (_, cert) = X509Certificate::from_der(der).map_err(|e| Error::CertificateParse {
            reason: e.to_string(),
        })?;

        match source {
            IdentitySource::CommonName => {
                let cn = cert
                    .subject()
                    .iter_common_name()
                    .next()
                    .and_then(|cn| cn.as_str().ok())
                    .ok_or(Error::IdentityMissing {
                        source_field: "common_name",
                    })?;
                Self::from_device_id(cn).map_err(|_| Error::IdentityMissing {
                    source_field: "common_name",
                })
            }
            IdentitySource::SanUri => {
                let san = cert
                    .subject_alternative_name()
                    .map_err(|e| Error::CertificateParse {
                        reason: e.to_string(),
                    })?
                    .ok_or(Error::IdentityMissing {
                        source_field: "subject_alternative_name",
                    })?;
                let uri = san
                    .value
                    .general_names
                    .iter()
                    .find_map(|name| match name {
                        GeneralName::URI(uri) => Some(*uri),
                        _ => None,
                    })
                    .ok_or(Error::IdentityMissing {
                        source_field: "san_uri",
                    })?;
                let device_id = uri.rsplit('/').next().unwrap_or_default();
                Self::from_device_id(device_id).map_err(|_| Error::IdentityMissing {
                    source_field: "san_uri",
                })
            }
        }
    }

    /// The bare device id.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// The hierarchical sender id (`vehicle_device.<device_id>`).
    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    /// Checks an envelope-level sender id against this identity.
    pub fn matches_sender_id(&self, sender_id: &[u8]) -> bool {
        self.sender_id.as_bytes() == sender_id
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.device_id)
    }
}
