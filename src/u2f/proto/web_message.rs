use serde_derive::*;
use serde_repr::*;

use crate::u2f::proto::constants::{BROWSER_DATA_ENROLL_TYP, TLS_CHANNEL_ID_UNUSED, U2F_V1_VERSION_STR};

/// One registration challenge as handed over by the relying party.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnrollChallenge {
    /// The version of the protocol that the to-be-registered token must speak. E.g. "U2F_V2".
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub version: Option<String>,
    /// The websafe-base64-encoded challenge.
    pub challenge: String,
    /// Application id for this challenge, if distinct from the request's.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub app_id: Option<String>,
}

impl EnrollChallenge {
    /// Protocol version, defaulting to the legacy one when absent.
    pub fn version(&self) -> &str {
        self.version.as_deref().unwrap_or(U2F_V1_VERSION_STR)
    }
}

/// A key the user already registered, sent along so the device can refuse a
/// second registration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SignChallenge {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub version: Option<String>,
    /// Unused for enrollment, defaulted to an empty string when missing.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub challenge: Option<String>,
    /// The registered keyHandle, websafe-base64 encoded.
    pub key_handle: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub app_id: Option<String>,
}

impl SignChallenge {
    pub fn version(&self) -> &str {
        self.version.as_deref().unwrap_or(U2F_V1_VERSION_STR)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelperEnrollChallenge {
    pub version: String,
    pub challenge_hash: String,
    pub app_id_hash: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelperSignChallenge {
    pub version: String,
    pub challenge_hash: String,
    pub app_id_hash: String,
    pub key_handle: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub enum HelperRequestType {
    #[serde(rename = "enroll_helper_request")]
    Enroll,
}

/// Request dispatched to the out-of-process device helper.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelperRequest {
    #[serde(rename = "type")]
    pub req_type: HelperRequestType,
    pub enroll_challenges: Vec<HelperEnrollChallenge>,
    pub sign_data: Vec<HelperSignChallenge>,
    /// Seconds left on the enroller's timer when the request was built.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub timeout_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub log_msg_url: Option<String>,
}

/// Reply from the device helper. A missing `code` means success.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelperReply {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub code: Option<i32>,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub enroll_data: String,
}

/// The "client data" a registration signature commits to.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BrowserData {
    pub typ: String,
    pub challenge: String,
    pub origin: String,
    pub cid_pubkey: serde_json::Value,
}

impl BrowserData {
    pub fn enroll(challenge: &str, origin: &str, tls_channel_id: Option<&str>) -> Self {
        BrowserData {
            typ: BROWSER_DATA_ENROLL_TYP.to_string(),
            challenge: challenge.to_string(),
            origin: origin.to_string(),
            cid_pubkey: tls_channel_id_value(tls_channel_id),
        }
    }
}

fn tls_channel_id_value(tls_channel_id: Option<&str>) -> serde_json::Value {
    match tls_channel_id {
        None | Some("") => serde_json::Value::String(TLS_CHANNEL_ID_UNUSED.to_string()),
        Some(id) => match serde_json::from_str::<serde_json::Value>(id) {
            Ok(obj @ serde_json::Value::Object(_)) => obj,
            _ => serde_json::Value::String(id.to_string()),
        },
    }
}

#[derive(Serialize_repr, Deserialize_repr, PartialEq, Eq, Clone, Copy, Debug)]
#[repr(u8)]
pub enum ErrorCode {
    Ok = 0,
    OtherError = 1,
    BadRequest = 2,
    ConfigurationUnsupported = 3,
    DeviceIneligible = 4,
    Timeout = 5,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClientError {
    pub error_code: ErrorCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub error_message: Option<String>,
}

impl ClientError {
    pub fn new(error_code: ErrorCode, error_message: Option<String>) -> Self {
        ClientError { error_code, error_message }
    }

    pub fn bad_request(error_message: Option<String>) -> Self {
        Self::new(ErrorCode::BadRequest, error_message)
    }

    pub fn other_error(error_message: Option<String>) -> Self {
        Self::new(ErrorCode::OtherError, error_message)
    }

    pub fn timeout() -> Self {
        Self::new(ErrorCode::Timeout, None)
    }

    pub fn device_ineligible() -> Self {
        Self::new(ErrorCode::DeviceIneligible, None)
    }
}

/// Successful enrollment as delivered to the caller.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct U2fRegisterResponse {
    pub version: String,
    pub registration_data: String,
    /// Websafe-base64 browser data, present for the current protocol version.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub client_data: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::u2f::proto::constants::DEVICE_WRONG_DATA_STATUS;

    #[test]
    fn browser_data_field_order() {
        let data = BrowserData::enroll("AAAA", "https://example.com", None);

        assert_eq!(
            serde_json::to_string(&data).unwrap(),
            r#"{"typ":"navigator.id.finishEnrollment","challenge":"AAAA","origin":"https://example.com","cid_pubkey":"unused"}"#
        );
    }

    #[test]
    fn tls_channel_id_object_is_embedded() {
        let data = BrowserData::enroll("AAAA", "https://example.com", Some(r#"{"kty":"EC"}"#));
        assert_eq!(data.cid_pubkey, serde_json::json!({"kty": "EC"}));

        let data = BrowserData::enroll("AAAA", "https://example.com", Some("opaque"));
        assert_eq!(data.cid_pubkey, serde_json::json!("opaque"));
    }

    #[test]
    fn empty_tls_channel_id_is_unused() {
        let data = BrowserData::enroll("AAAA", "https://example.com", Some(""));
        assert_eq!(data.cid_pubkey, serde_json::json!(TLS_CHANNEL_ID_UNUSED));
    }

    #[test]
    fn helper_reply_without_code_is_success_shaped() {
        let reply: HelperReply = serde_json::from_str(r#"{"version":"U2F_V2","enrollData":"BQ"}"#).unwrap();
        assert_eq!(reply.code, None);
        assert_eq!(reply.enroll_data, "BQ");

        let reply: HelperReply = serde_json::from_str(r#"{"code":27264}"#).unwrap();
        assert_eq!(reply.code, Some(DEVICE_WRONG_DATA_STATUS));
        assert!(reply.version.is_empty());
    }

    #[test]
    fn helper_request_wire_names() {
        let request = HelperRequest {
            req_type: HelperRequestType::Enroll,
            enroll_challenges: vec![HelperEnrollChallenge {
                version: "U2F_V2".to_string(),
                challenge_hash: "c".to_string(),
                app_id_hash: "a".to_string(),
            }],
            sign_data: vec![],
            timeout_seconds: Some(29.0),
            log_msg_url: None,
        };

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["type"], "enroll_helper_request");
        assert_eq!(value["enrollChallenges"][0]["challengeHash"], "c");
        assert_eq!(value["enrollChallenges"][0]["appIdHash"], "a");
        assert_eq!(value["signData"], serde_json::json!([]));
        assert_eq!(value["timeoutSeconds"], 29.0);
        assert!(value.get("logMsgUrl").is_none());
    }

    #[test]
    fn error_code_is_numeric() {
        let error = ClientError::bad_request(None);
        assert_eq!(serde_json::to_string(&error).unwrap(), r#"{"errorCode":2}"#);
    }

    #[test]
    fn challenge_version_defaults_to_legacy() {
        let challenge: EnrollChallenge = serde_json::from_str(r#"{"challenge":"AAAA"}"#).unwrap();
        assert_eq!(challenge.version(), "U2F_V1");
    }
}
