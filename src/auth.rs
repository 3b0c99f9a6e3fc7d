use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Why a handshake was refused. `reason()` is the machine-readable string
/// sent to the client before the socket closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    MissingHandle,
    MissingCredentials,
    MalformedToken,
    HandleMismatch,
    TokenExpired,
    BadSignature,
    BadSecret,
}

impl Rejection {
    pub fn reason(self) -> &'static str {
        use Rejection::*;
        match self {
            MissingHandle => "missing_handle",
            MissingCredentials => "missing_credentials",
            MalformedToken => "malformed_token",
            HandleMismatch => "handle_mismatch",
            TokenExpired => "token_expired",
            BadSignature => "bad_signature",
            BadSecret => "bad_secret",
        }
    }
}

/// Validate a handshake: a signed `token` or the legacy `api_secret`.
/// Either path compares in constant time.
pub fn verify_handshake(
    user_handle: Option<&str>,
    token: Option<&str>,
    api_secret: Option<&str>,
    secret: &str,
    now: i64,
) -> Result<(), Rejection> {
    let handle = match user_handle {
        Some(h) if !h.is_empty() => h,
        _ => return Err(Rejection::MissingHandle),
    };

    if let Some(token) = token {
        verify_token(handle, token, secret, now)
    } else if let Some(provided) = api_secret {
        if constant_time_eq(provided.as_bytes(), secret.as_bytes()) {
            Ok(())
        } else {
            Err(Rejection::BadSecret)
        }
    } else {
        Err(Rejection::MissingCredentials)
    }
}

/// Wire form: `base64(handle ":" expiry_unix ":" hex(hmac))` where the MAC
/// covers `handle ":" expiry_unix`.
pub fn issue_token(handle: &str, expires_at: i64, secret: &str) -> String {
    let payload = format!("{handle}:{expires_at}");
    let mac = mac_hex(&payload, secret);
    BASE64.encode(format!("{payload}:{mac}"))
}

fn verify_token(handle: &str, token: &str, secret: &str, now: i64) -> Result<(), Rejection> {
    let decoded = BASE64
        .decode(token)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .ok_or(Rejection::MalformedToken)?;

    // Split from the right so a handle containing ':' still parses.
    let mut parts = decoded.rsplitn(3, ':');
    let mac_hex_str = parts.next().ok_or(Rejection::MalformedToken)?;
    let expiry_str = parts.next().ok_or(Rejection::MalformedToken)?;
    let token_handle = parts.next().ok_or(Rejection::MalformedToken)?;

    if token_handle != handle {
        return Err(Rejection::HandleMismatch);
    }

    let expires_at: i64 = expiry_str.parse().map_err(|_| Rejection::MalformedToken)?;
    if expires_at < now {
        return Err(Rejection::TokenExpired);
    }

    let mac_bytes = hex::decode(mac_hex_str).map_err(|_| Rejection::BadSignature)?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| Rejection::BadSignature)?;
    mac.update(format!("{token_handle}:{expires_at}").as_bytes());
    // verify_slice is a constant-time comparison.
    mac.verify_slice(&mac_bytes).map_err(|_| Rejection::BadSignature)
}

fn mac_hex(payload: &str, secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("hmac-sha256 accepts keys of any length");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "unit-test-secret";

    #[test]
    fn valid_token_is_accepted() {
        let token = issue_token("alice", 2_000, SECRET);
        assert_eq!(
            verify_handshake(Some("alice"), Some(&token), None, SECRET, 1_000),
            Ok(())
        );
    }

    #[test]
    fn expired_token_is_rejected() {
        let token = issue_token("alice", 500, SECRET);
        assert_eq!(
            verify_handshake(Some("alice"), Some(&token), None, SECRET, 1_000),
            Err(Rejection::TokenExpired)
        );
    }

    #[test]
    fn forged_mac_is_rejected() {
        let token = issue_token("alice", 2_000, "some-other-secret");
        assert_eq!(
            verify_handshake(Some("alice"), Some(&token), None, SECRET, 1_000),
            Err(Rejection::BadSignature)
        );
    }

    #[test]
    fn token_for_another_handle_is_rejected() {
        let token = issue_token("mallory", 2_000, SECRET);
        assert_eq!(
            verify_handshake(Some("alice"), Some(&token), None, SECRET, 1_000),
            Err(Rejection::HandleMismatch)
        );
    }

    #[test]
    fn garbage_token_is_malformed() {
        assert_eq!(
            verify_handshake(Some("alice"), Some("not-base64!!"), None, SECRET, 0),
            Err(Rejection::MalformedToken)
        );
    }

    #[test]
    fn legacy_secret_path() {
        assert_eq!(
            verify_handshake(Some("bot"), None, Some(SECRET), SECRET, 0),
            Ok(())
        );
        assert_eq!(
            verify_handshake(Some("bot"), None, Some("wrong"), SECRET, 0),
            Err(Rejection::BadSecret)
        );
    }

    #[test]
    fn missing_handle_or_credentials() {
        assert_eq!(
            verify_handshake(None, None, Some(SECRET), SECRET, 0),
            Err(Rejection::MissingHandle)
        );
        assert_eq!(
            verify_handshake(Some(""), None, Some(SECRET), SECRET, 0),
            Err(Rejection::MissingHandle)
        );
        assert_eq!(
            verify_handshake(Some("alice"), None, None, SECRET, 0),
            Err(Rejection::MissingCredentials)
        );
    }

    #[test]
    fn handle_with_colon_still_parses() {
        let token = issue_token("guest:42", 2_000, SECRET);
        assert_eq!(
            verify_handshake(Some("guest:42"), Some(&token), None, SECRET, 1_000),
            Ok(())
        );
    }
}
