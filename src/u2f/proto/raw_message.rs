use std::fmt;
use std::io::{Cursor, Read, Write};

use base64::Engine as _;
use byteorder::{ReadBytesExt, WriteBytesExt};
use ring::{
    rand::SystemRandom,
    signature::{self, EcdsaKeyPair},
};
use sha2::{Digest, Sha256};

use crate::base64::{decode_websafe, BASE64};
use crate::u2f::{
    error::Error,
    proto::{
        constants::*,
        der::{encode_ecdsa_signature, ByteCursor, Tag},
    },
};

/// Where the challenge parameter of a registration comes from.
pub enum ChallengeParameter<'a> {
    /// Legacy protocol: the 32-byte challenge hash itself.
    Hash(&'a [u8]),
    /// Current protocol: the client data whose SHA-256 is the challenge.
    ClientData(&'a [u8]),
}

/// A parsed registration response.
///
/// Layout: `[0x05][65-byte point][L][L-byte key handle][DER cert][DER signature]`.
#[derive(Clone, PartialEq)]
pub struct Registration {
    user_public_key: [u8; U2F_EC_POINT_SIZE],
    key_handle: Vec<u8>,
    attestation_cert: Vec<u8>,
    signature: Vec<u8>,
    challenge_hash: [u8; U2F_CHAL_SIZE],
    app_id: String,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("app_id", &self.app_id)
            .field("key_handle", &hex::encode(&self.key_handle))
            .field("user_public_key", &hex::encode(self.user_public_key))
            .field("attestation_cert_len", &self.attestation_cert.len())
            .finish()
    }
}

impl Registration {
    /// Parses registration data in either base64 alphabet.
    pub fn from_base64(registration_data: &str, app_id: &str, challenge: ChallengeParameter) -> Result<Self, Error> {
        Self::parse(&decode_websafe(registration_data)?, app_id, challenge)
    }

    pub fn parse(data: &[u8], app_id: &str, challenge: ChallengeParameter) -> Result<Self, Error> {
        let challenge_hash = match challenge {
            ChallengeParameter::Hash(hash) => <[u8; U2F_CHAL_SIZE]>::try_from(hash)
                .map_err(|_| Error::Validation(format!("Challenge hash must be {} bytes, got {}", U2F_CHAL_SIZE, hash.len())))?,
            ChallengeParameter::ClientData(client_data) => Sha256::digest(client_data).into(),
        };

        let mut cursor = Cursor::new(data);

        let reserved = cursor.read_u8().map_err(truncated)?;
        if reserved != U2F_REGISTER_ID {
            return Err(Error::Format(format!("Expecting registration id {:#04x}, got {:#04x}", U2F_REGISTER_ID, reserved)));
        }

        let mut user_public_key = [0u8; U2F_EC_POINT_SIZE];
        cursor.read_exact(&mut user_public_key).map_err(truncated)?;

        let key_handle_length = cursor.read_u8().map_err(truncated)?;
        let mut key_handle = vec![0u8; key_handle_length as usize];
        cursor.read_exact(&mut key_handle[..]).map_err(truncated)?;

        let mut der = ByteCursor::new(&data[cursor.position() as usize..]);
        let attestation_cert = der.read_raw_element(Tag::Sequence)?.to_vec();
        let signature = der.read_raw_element(Tag::Sequence)?.to_vec();

        if !der.is_empty() {
            return Err(Error::Format(format!("{} trailing bytes after registration signature", der.remaining())));
        }

        Ok(Registration {
            user_public_key,
            key_handle,
            attestation_cert,
            signature,
            challenge_hash,
            app_id: app_id.to_string(),
        })
    }

    pub fn user_public_key(&self) -> &[u8] {
        &self.user_public_key
    }

    pub fn key_handle(&self) -> &[u8] {
        &self.key_handle
    }

    pub fn certificate(&self) -> &[u8] {
        &self.attestation_cert
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    pub fn challenge_hash(&self) -> &[u8] {
        &self.challenge_hash
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// The bytes an attestation signature covers.
    pub fn to_be_signed(&self) -> Vec<u8> {
        let app_id_hash = Sha256::digest(self.app_id.as_bytes());

        let mut tbs_vec = Vec::with_capacity(U2F_REGISTER_MAX_DATA_TBS_SIZE);
        tbs_vec.push(U2F_REGISTER_HASH_ID);
        tbs_vec.extend_from_slice(&app_id_hash);
        tbs_vec.extend_from_slice(&self.challenge_hash);
        tbs_vec.extend_from_slice(&self.key_handle);
        tbs_vec.extend_from_slice(&self.user_public_key);
        tbs_vec
    }

    /// Signs the registration with a key built for `ECDSA_P256_SHA256_FIXED_SIGNING`
    /// and returns the DER form of the signature.
    pub fn sign(&self, key: &EcdsaKeyPair) -> Result<Vec<u8>, Error> {
        let rng = SystemRandom::new();
        let sig = key.sign(&rng, &self.to_be_signed())?;
        let raw = sig.as_ref();

        if raw.len() != U2F_RAW_SIG_SIZE {
            return Err(Error::Crypto(format!("Expecting a {} byte r || s signature, got {}", U2F_RAW_SIG_SIZE, raw.len())));
        }

        let (r, s) = raw.split_at(U2F_EC_KEY_SIZE);
        Ok(encode_ecdsa_signature(r, s)?)
    }

    /// Checks the registration signature against an uncompressed P-256 point.
    pub fn verify_signature_with(&self, public_key: &[u8]) -> Result<(), Error> {
        let public_key = signature::UnparsedPublicKey::new(&signature::ECDSA_P256_SHA256_ASN1, public_key);
        public_key.verify(&self.to_be_signed(), &self.signature)?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        self.serialize(&self.attestation_cert, &self.signature)
    }

    /// Re-serializes with a new certificate and signature, base64 encoded.
    pub fn with_replacement(&self, attestation_cert: &[u8], signature: &[u8]) -> Result<String, Error> {
        Ok(BASE64.encode(self.serialize(attestation_cert, signature)?))
    }

    fn serialize(&self, attestation_cert: &[u8], signature: &[u8]) -> Result<Vec<u8>, Error> {
        let key_handle_length = u8::try_from(self.key_handle.len())
            .map_err(|_| Error::Format(format!("Key handle too long: {} bytes", self.key_handle.len())))?;

        let mut data = Vec::with_capacity(
            2 + U2F_EC_POINT_SIZE + self.key_handle.len() + attestation_cert.len() + signature.len(),
        );

        data.write_u8(U2F_REGISTER_ID)?;
        data.write_all(&self.user_public_key)?;
        data.write_u8(key_handle_length)?;
        data.write_all(&self.key_handle)?;
        data.write_all(attestation_cert)?;
        data.write_all(signature)?;

        Ok(data)
    }
}

fn truncated(e: std::io::Error) -> Error {
    Error::Format(format!("Truncated registration data: {}", e))
}
