//! Local-mode signed-URL issuance and verification, substituting for the
//! cloud provider's SAS tokens per spec.md §4.B.
//!
//! String-to-sign = `version \n bufferId \n permissions \n startIso \n
//! endIso`, signed with Ed25519 and carried as a base64 `sig` query param.
//! Two keys may be configured so a rotation window can validate under either
//! the retiring or the new key while only ever signing with the primary.

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

pub const SAS_VERSION: &str = "2023-01-01";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Read,
    ReadCreate,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "r",
            Self::ReadCreate => "rc",
        }
    }

    pub fn allows(&self, requested: Action) -> bool {
        match (self, requested) {
            (Permission::Read, Action::Read) => true,
            (Permission::ReadCreate, Action::Read | Action::Create) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Read,
    Create,
}

/// Holds the signing key and up to one retiring key still accepted for
/// validation during rotation.
#[derive(Clone)]
pub struct SigningKeys {
    primary: SigningKey,
    secondary: Option<SigningKey>,
}

impl SigningKeys {
    pub fn new(primary: SigningKey, secondary: Option<SigningKey>) -> Self {
        Self { primary, secondary }
    }

    pub fn from_seed_bytes(primary: &[u8; 32], secondary: Option<&[u8; 32]>) -> Self {
        Self {
            primary: SigningKey::from_bytes(primary),
            secondary: secondary.map(SigningKey::from_bytes),
        }
    }

    fn verifying_keys(&self) -> Vec<VerifyingKey> {
        let mut keys = vec![self.primary.verifying_key()];
        if let Some(secondary) = &self.secondary {
            keys.push(secondary.verifying_key());
        }
        keys
    }

    pub fn sign_url(
        &self,
        buffer_id: &str,
        permission: Permission,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> SignedQuery {
        let string_to_sign = string_to_sign(buffer_id, permission, start, end);
        let signature: Signature = self.primary.sign(string_to_sign.as_bytes());
        SignedQuery {
            sv: SAS_VERSION.to_string(),
            sp: permission.as_str().to_string(),
            st: start.to_rfc3339(),
            se: end.to_rfc3339(),
            sig: base64::Engine::encode(&base64::engine::general_purpose::STANDARD, signature.to_bytes()),
        }
    }
}

fn string_to_sign(buffer_id: &str, permission: Permission, start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    format!(
        "{SAS_VERSION}\n{buffer_id}\n{}\n{}\n{}",
        permission.as_str(),
        start.to_rfc3339(),
        end.to_rfc3339()
    )
}

#[derive(Debug, Clone)]
pub struct SignedQuery {
    pub sv: String,
    pub sp: String,
    pub st: String,
    pub se: String,
    pub sig: String,
}

impl SignedQuery {
    pub fn to_query_string(&self) -> String {
        format!(
            "sv={}&sp={}&st={}&se={}&sig={}",
            urlencode(&self.sv),
            urlencode(&self.sp),
            urlencode(&self.st),
            urlencode(&self.se),
            urlencode(&self.sig)
        )
    }
}

fn urlencode(s: &str) -> String {
    // Only the characters our own query params can produce (RFC3339 colons
    // and base64 `+`/`/`/`=`) need escaping for a well-formed query string.
    s.replace('+', "%2B").replace('/', "%2F").replace(':', "%3A").replace('=', "%3D")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SasOutcome {
    Allowed,
    InvalidSas,
    ActionNotAllowed,
}

pub struct SasParams<'a> {
    pub sv: Option<&'a str>,
    pub sp: Option<&'a str>,
    pub st: Option<&'a str>,
    pub se: Option<&'a str>,
    pub sig: Option<&'a str>,
}

/// Verifies a signed request per spec.md §4.B's "Verification of signed
/// requests" list, in order: missing params, expiry, signature, then the
/// requested action against `sp`.
pub fn verify(buffer_id: &str, params: SasParams<'_>, now: DateTime<Utc>, keys: &SigningKeys, requested: Action) -> SasOutcome {
    let (Some(_sv), Some(sp), Some(st), Some(se), Some(sig)) =
        (params.sv, params.sp, params.st, params.se, params.sig)
    else {
        return SasOutcome::InvalidSas;
    };

    let Ok(start) = DateTime::parse_from_rfc3339(st) else {
        return SasOutcome::InvalidSas;
    };
    let Ok(end) = DateTime::parse_from_rfc3339(se) else {
        return SasOutcome::InvalidSas;
    };
    if end.with_timezone(&Utc) < now {
        return SasOutcome::InvalidSas;
    }

    let permission = match sp {
        "r" => Permission::Read,
        "rc" => Permission::ReadCreate,
        _ => return SasOutcome::InvalidSas,
    };

    let Ok(sig_bytes) = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, sig) else {
        return SasOutcome::InvalidSas;
    };
    let Ok(sig_array): Result<[u8; 64], _> = sig_bytes.try_into() else {
        return SasOutcome::InvalidSas;
    };
    let signature = Signature::from_bytes(&sig_array);

    let to_verify = string_to_sign(buffer_id, permission, start.with_timezone(&Utc), end.with_timezone(&Utc));
    let verified = keys
        .verifying_keys()
        .iter()
        .any(|vk| vk.verify(to_verify.as_bytes(), &signature).is_ok());
    if !verified {
        return SasOutcome::InvalidSas;
    }

    if !permission.allows(requested) {
        return SasOutcome::ActionNotAllowed;
    }

    SasOutcome::Allowed
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn keys() -> SigningKeys {
        SigningKeys::from_seed_bytes(&[7u8; 32], None)
    }

    #[test]
    fn signed_url_for_read_create_allows_both_actions() {
        let keys = keys();
        let now = Utc::now();
        let signed = keys.sign_url("buf1", Permission::ReadCreate, now - Duration::minutes(1), now + Duration::hours(1));
        let params = SasParams {
            sv: Some(&signed.sv),
            sp: Some(&signed.sp),
            st: Some(&signed.st),
            se: Some(&signed.se),
            sig: Some(&signed.sig),
        };
        assert_eq!(verify("buf1", params_clone(&params), now, &keys, Action::Read), SasOutcome::Allowed);
        assert_eq!(verify("buf1", params, now, &keys, Action::Create), SasOutcome::Allowed);
    }

    #[test]
    fn read_only_url_rejects_create_action() {
        let keys = keys();
        let now = Utc::now();
        let signed = keys.sign_url("buf1", Permission::Read, now - Duration::minutes(1), now + Duration::hours(1));
        let params = SasParams {
            sv: Some(&signed.sv),
            sp: Some(&signed.sp),
            st: Some(&signed.st),
            se: Some(&signed.se),
            sig: Some(&signed.sig),
        };
        assert_eq!(verify("buf1", params, now, &keys, Action::Create), SasOutcome::ActionNotAllowed);
    }

    #[test]
    fn expired_url_is_invalid() {
        let keys = keys();
        let now = Utc::now();
        let signed = keys.sign_url("buf1", Permission::Read, now - Duration::hours(2), now - Duration::hours(1));
        let params = SasParams {
            sv: Some(&signed.sv),
            sp: Some(&signed.sp),
            st: Some(&signed.st),
            se: Some(&signed.se),
            sig: Some(&signed.sig),
        };
        assert_eq!(verify("buf1", params, now, &keys, Action::Read), SasOutcome::InvalidSas);
    }

    #[test]
    fn missing_param_is_invalid() {
        let keys = keys();
        let params = SasParams { sv: Some("v"), sp: Some("r"), st: Some("x"), se: None, sig: Some("y") };
        assert_eq!(verify("buf1", params, Utc::now(), &keys, Action::Read), SasOutcome::InvalidSas);
    }

    #[test]
    fn rotated_secondary_key_still_validates() {
        let primary = SigningKeys::from_seed_bytes(&[1u8; 32], None);
        let both = SigningKeys::from_seed_bytes(&[2u8; 32], Some(&[1u8; 32]));
        let now = Utc::now();
        let signed = primary.sign_url("buf1", Permission::Read, now - Duration::minutes(1), now + Duration::hours(1));
        let params = SasParams {
            sv: Some(&signed.sv),
            sp: Some(&signed.sp),
            st: Some(&signed.st),
            se: Some(&signed.se),
            sig: Some(&signed.sig),
        };
        assert_eq!(verify("buf1", params, now, &both, Action::Read), SasOutcome::Allowed);
    }

    fn params_clone<'a>(p: &SasParams<'a>) -> SasParams<'a> {
        SasParams { sv: p.sv, sp: p.sp, st: p.st, se: p.se, sig: p.sig }
    }
}
