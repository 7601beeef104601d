//! Authentication primitives.
//!
//! Two modes: modern HTTP Basic (carried by the REST transport directly via
//! `reqwest::RequestBuilder::basic_auth`) and the legacy socket
//! challenge-response, implemented here.

use md5::{Digest, Md5};

use crate::error::{Error, Result};

/// Compute the legacy RouterOS login response for `password` and a hex
/// `challenge` (the value of `ret=` from the first `/login` reply).
///
/// `response = "00" || lowercase_hex(MD5(0x00 || utf8(password) || hex_decode(challenge)))`.
///
/// The working buffer is zeroed before returning so the password does not
/// linger in memory longer than necessary.
pub fn legacy_login_response(password: &str, challenge: &str) -> Result<String> {
    if challenge.is_empty() || !challenge.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::Auth(format!("invalid challenge: {challenge:?}")));
    }
    let challenge_bytes =
        hex::decode(challenge).map_err(|e| Error::Auth(format!("bad challenge hex: {e}")))?;

    let mut buf = Vec::with_capacity(1 + password.len() + challenge_bytes.len());
    buf.push(0u8);
    buf.extend_from_slice(password.as_bytes());
    buf.extend_from_slice(&challenge_bytes);

    let digest = Md5::digest(&buf);
    buf.iter_mut().for_each(|b| *b = 0);

    Ok(format!("00{}", hex::encode(digest)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_the_known_login_fixture() {
        let password = "abc";
        let challenge = "0123456789abcdef0123456789abcdef";
        let response = legacy_login_response(password, challenge).unwrap();

        let mut expected_buf = vec![0u8];
        expected_buf.extend_from_slice(password.as_bytes());
        expected_buf.extend_from_slice(&hex::decode(challenge).unwrap());
        assert_eq!(expected_buf.len(), 20);
        let digest = Md5::digest(&expected_buf);
        assert_eq!(response, format!("00{}", hex::encode(digest)));
    }

    #[test]
    fn rejects_empty_challenge() {
        assert!(legacy_login_response("abc", "").is_err());
    }

    #[test]
    fn rejects_non_hex_challenge() {
        assert!(legacy_login_response("abc", "not-hex-zz").is_err());
    }
}
