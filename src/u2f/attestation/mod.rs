//! Replacement attestation for anonymized registrations.
//!
//! A registration's attestation certificate identifies the device batch. When
//! the caller asks for anonymized conveyance it is swapped for a self-issued
//! certificate around a fresh key. The certificate's own signature is a fixed
//! placeholder: nothing can vouch for this certificate, so nothing signs it.

mod transport;

pub use transport::extract_transport;

use ring::{
    rand::{SecureRandom, SystemRandom},
    signature::{self, EcdsaKeyPair, KeyPair},
};

use crate::u2f::{
    error::Error,
    proto::{
        constants::*,
        der::{encode_ecdsa_signature, ByteBuilder, DerError, Tag},
    },
};

/// Freshly generated attestation key and the certificate carrying its public half.
pub struct SyntheticAttestation {
    /// P-256 key producing fixed-size (r || s) signatures.
    pub key: EcdsaKeyPair,
    pub certificate: Vec<u8>,
}

/// Builds a replacement for `original_cert`, carrying over its transports extension.
pub fn make_cert_and_key(original_cert: &[u8]) -> Result<SyntheticAttestation, Error> {
    let transport = extract_transport(original_cert)?;

    if let Some(transport) = &transport {
        check_transport(transport)?;
    }

    let rng = SystemRandom::new();
    let pkcs8 = EcdsaKeyPair::generate_pkcs8(&signature::ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
        .map_err(|_| Error::Crypto("Unable to generate attestation key".to_string()))?;
    let key = EcdsaKeyPair::from_pkcs8(&signature::ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8.as_ref(), &rng)?;

    let mut serial = [0u8; SYNTHETIC_SERIAL_SIZE];
    rng.fill(&mut serial)?;

    let certificate = encode_certificate(&serial, key.public_key().as_ref(), transport.as_deref())?;

    Ok(SyntheticAttestation { key, certificate })
}

fn check_transport(transport: &[u8]) -> Result<(), Error> {
    if transport.len() != TRANSPORT_EXTENSION_SIZE {
        return Err(Error::Validation("bad extension length".to_string()));
    }

    // transport[0] is the unused-bit count; a small count leaves many bits in use
    if transport[0] < TRANSPORT_MIN_UNUSED_BITS {
        return Err(Error::Validation("too many bits set".to_string()));
    }

    Ok(())
}

/// The constant signature every synthetic certificate carries.
pub fn placeholder_signature() -> Result<Vec<u8>, DerError> {
    encode_ecdsa_signature(&PLACEHOLDER_SIGNATURE_R, &PLACEHOLDER_SIGNATURE_S)
}

/// Encodes a v3 certificate for `public_key` (uncompressed P-256 point).
///
/// `transport` is the raw BIT STRING content of a transports extension and is
/// copied verbatim.
pub fn encode_certificate(serial: &[u8], public_key: &[u8], transport: Option<&[u8]>) -> Result<Vec<u8>, DerError> {
    let signature = placeholder_signature()?;

    let mut b = ByteBuilder::new();
    b.write_element(Tag::Sequence, |cert| {
        cert.write_element(Tag::Sequence, |tbs| {
            tbs.write_element(Tag::Context0, |version| version.write_integer(X509_V3))?;
            tbs.write_big_int_from_bytes(serial)?;
            write_algorithm(tbs, OID_ECDSA_WITH_SHA256)?;
            write_name(tbs, SYNTHETIC_ISSUER_CN)?;
            tbs.write_element(Tag::Sequence, |validity| {
                validity.write_utc_time(SYNTHETIC_NOT_BEFORE)?;
                validity.write_utc_time(SYNTHETIC_NOT_AFTER)
            })?;
            write_name(tbs, SYNTHETIC_SUBJECT_CN)?;
            tbs.write_element(Tag::Sequence, |spki| {
                spki.write_element(Tag::Sequence, |alg| {
                    alg.write_object_identifier(OID_EC_PUBLIC_KEY)?;
                    alg.write_object_identifier(OID_PRIME256V1)
                })?;
                spki.write_bit_string(public_key)
            })?;

            if let Some(transport) = transport {
                tbs.write_element(Tag::Context3, |wrapper| {
                    wrapper.write_element(Tag::Sequence, |extensions| {
                        extensions.write_element(Tag::Sequence, |ext| {
                            ext.write_object_identifier(OID_FIDO_TRANSPORTS)?;
                            ext.write_element(Tag::OctetString, |value| {
                                value.write_element(Tag::BitString, |bits| {
                                    bits.write_raw_bytes(transport);
                                    Ok(())
                                })
                            })
                        })
                    })
                })?;
            }

            Ok(())
        })?;

        write_algorithm(cert, OID_ECDSA_WITH_SHA256)?;
        cert.write_bit_string(&signature)
    })?;

    Ok(b.into_bytes())
}

fn write_algorithm(b: &mut ByteBuilder, oid: &[u64]) -> Result<(), DerError> {
    b.write_element(Tag::Sequence, |alg| alg.write_object_identifier(oid))
}

fn write_name(b: &mut ByteBuilder, common_name: &str) -> Result<(), DerError> {
    b.write_element(Tag::Sequence, |name| {
        name.write_element(Tag::Set, |rdn| {
            rdn.write_element(Tag::Sequence, |attr| {
                attr.write_object_identifier(OID_COMMON_NAME)?;
                attr.write_printable_string(common_name)
            })
        })
    })
}
