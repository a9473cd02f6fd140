pub const U2F_V1_VERSION_STR: &str = "U2F_V1";
pub const U2F_V2_VERSION_STR: &str = "U2F_V2";

// From :Common U2F raw message format header - Review Draft
// 2014-10-08

// ASN1 constants

pub const ASN1_DEFINITE_SHORT_MASK: u8 = 0x80;
pub const ASN1_DEFINITE_LONG_FOLLOWING_MASK: u8 = 0x7f;
pub const ASN1_MAX_FOLLOWING_LEN_BYTES: usize = 4;

// General constants

pub const U2F_EC_KEY_SIZE: usize = 32; // EC key size in bytes
pub const U2F_EC_POINT_SIZE: usize = (U2F_EC_KEY_SIZE * 2) + 1; // Size of EC point
pub const U2F_MAX_KH_SIZE: usize = 255; // Max size of key handle, bounded by its one byte length
pub const U2F_APPID_SIZE: usize = 32; // Size of application id
pub const U2F_CHAL_SIZE: usize = 32; // Size of challenge
pub const U2F_RAW_SIG_SIZE: usize = U2F_EC_KEY_SIZE * 2; // r || s
pub const U2F_REGISTER_MAX_DATA_TBS_SIZE: usize = 1 + U2F_APPID_SIZE + U2F_CHAL_SIZE + U2F_MAX_KH_SIZE + U2F_EC_POINT_SIZE;

// EC (uncompressed) point

pub const U2F_POINT_UNCOMPRESSED: u8 = 0x04; // Uncompressed point format

// U2F_CMD_REGISTER command defines

pub const U2F_REGISTER_ID: u8 = 0x05; // Version 2 registration identifier
pub const U2F_REGISTER_HASH_ID: u8 = 0x00; // Version 2 hash identintifier

// Device status codes reported by the helper

pub const DEVICE_OK_STATUS: i32 = 0;
pub const DEVICE_WAIT_TOUCH_STATUS: i32 = 0x6985; // SW_CONDITIONS_NOT_SATISFIED
pub const DEVICE_WRONG_DATA_STATUS: i32 = 0x6A80; // SW_WRONG_DATA
pub const DEVICE_TIMEOUT_STATUS: i32 = -5;

// Helper wire strings

pub const BROWSER_DATA_ENROLL_TYP: &str = "navigator.id.finishEnrollment";
pub const TLS_CHANNEL_ID_UNUSED: &str = "unused";

// Object identifiers

pub const OID_FIDO_TRANSPORTS: &[u64] = &[1, 3, 6, 1, 4, 1, 45724, 2, 1, 1];
pub const OID_EC_PUBLIC_KEY: &[u64] = &[1, 2, 840, 10045, 2, 1];
pub const OID_PRIME256V1: &[u64] = &[1, 2, 840, 10045, 3, 1, 7];
pub const OID_ECDSA_WITH_SHA256: &[u64] = &[1, 2, 840, 10045, 4, 3, 2];
pub const OID_COMMON_NAME: &[u64] = &[2, 5, 4, 3];

// Synthetic attestation certificate

pub const X509_V3: u64 = 2;
pub const SYNTHETIC_SERIAL_SIZE: usize = 10;
pub const SYNTHETIC_ISSUER_CN: &str = "U2F Issuer";
pub const SYNTHETIC_SUBJECT_CN: &str = "U2F Device";
pub const SYNTHETIC_NOT_BEFORE: &str = "180101000000Z";
pub const SYNTHETIC_NOT_AFTER: &str = "491231235959Z";
pub const TRANSPORT_EXTENSION_SIZE: usize = 2;
/// The first transport byte is the bit string's unused-bit count.
pub const TRANSPORT_MIN_UNUSED_BITS: u8 = 3;

/// Fixed r and s of the placeholder certificate signature. Nothing signs the
/// synthetic certificate, these only keep the outer structure well formed.
pub const PLACEHOLDER_SIGNATURE_R: [u8; 32] = [0x5a; 32];
pub const PLACEHOLDER_SIGNATURE_S: [u8; 32] = [0x3c; 32];
