pub mod error;
pub mod attestation;
pub mod enroller;

pub mod proto {
    pub mod constants;
    pub mod der;
    pub mod raw_message;
    pub mod web_message;
}
