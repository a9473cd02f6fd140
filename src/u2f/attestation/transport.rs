use crate::u2f::{
    error::Error,
    proto::{
        constants::OID_FIDO_TRANSPORTS,
        der::{ByteCursor, Tag},
    },
};

/// Finds the FIDO transports extension of an attestation certificate.
///
/// Returns the raw BIT STRING content (unused-bit count first) or `None`
/// when the certificate carries no such extension. Fields ahead of the
/// extensions are skipped without being interpreted.
pub fn extract_transport(cert: &[u8]) -> Result<Option<Vec<u8>>, Error> {
    let mut cursor = ByteCursor::new(cert);
    let mut certificate = cursor.read_element(Tag::Sequence)?;
    let mut tbs = certificate.read_element(Tag::Sequence)?;

    tbs.read_optional_element(Tag::Context0)?; // version
    tbs.skip_element(Tag::Integer)?; // serial
    tbs.skip_element(Tag::Sequence)?; // signature algorithm
    tbs.skip_element(Tag::Sequence)?; // issuer
    tbs.skip_element(Tag::Sequence)?; // validity
    tbs.skip_element(Tag::Sequence)?; // subject
    tbs.skip_element(Tag::Sequence)?; // subject public key info
    tbs.read_optional_element(Tag::Context1)?; // issuer unique id
    tbs.read_optional_element(Tag::Context2)?; // subject unique id

    let mut wrapper = match tbs.read_optional_element(Tag::Context3)? {
        Some(wrapper) if !wrapper.is_empty() => wrapper,
        _ => return Ok(None),
    };
    let mut extensions = wrapper.read_element(Tag::Sequence)?;

    while !extensions.is_empty() {
        let mut extension = extensions.read_element(Tag::Sequence)?;

        if extension.read_object_identifier()? != OID_FIDO_TRANSPORTS {
            continue;
        }

        extension.read_optional_element(Tag::Boolean)?; // critical
        let mut value = extension.read_element(Tag::OctetString)?;
        let bits = value.read_element(Tag::BitString)?.rest();

        if !value.is_empty() || !extension.is_empty() {
            return Err(Error::CertParse("trailing bytes after transports extension".to_string()));
        }

        return Ok(Some(bits.to_vec()));
    }

    Ok(None)
}
