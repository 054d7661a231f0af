use proptest::prelude::*;

use presence_auth::{AuthError, DEFAULT_TOKEN_TTL, HmacTokenIssuer};

const NOW: i64 = 1_700_000_000;

fn issuer() -> HmacTokenIssuer {
    HmacTokenIssuer::new("property-secret", DEFAULT_TOKEN_TTL)
}

// --- Token issuance ---

proptest! {
    #[test]
    fn issued_tokens_validate(sub in "[a-zA-Z0-9_-]{1,40}", email in "[a-z]{1,12}@[a-z]{1,8}\\.com") {
        let token = issuer().issue_at(&sub, &email, NOW).unwrap();
        let claims = issuer().validate_at(&token, NOW + 1).unwrap();
        prop_assert_eq!(claims.sub, sub);
        prop_assert_eq!(claims.email, email);
    }

    #[test]
    fn any_single_byte_flip_is_rejected(sub in "[a-z0-9]{1,20}", idx in any::<prop::sample::Index>()) {
        let token = issuer().issue_at(&sub, "x@y.com", NOW).unwrap();
        let mut bytes = token.into_bytes();
        let i = idx.index(bytes.len());
        if bytes[i] == b'.' {
            return Ok(());
        }
        bytes[i] = if bytes[i] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(bytes).unwrap();
        let result = issuer().validate_at(&tampered, NOW + 1);
        prop_assert!(result.is_err());
    }

    #[test]
    fn expiry_is_exact(offset in 0i64..7200) {
        let token = issuer().issue_at("u1", "a@b.com", NOW).unwrap();
        let result = issuer().validate_at(&token, NOW + offset);
        if offset < 3600 {
            prop_assert!(result.is_ok());
        } else {
            prop_assert_eq!(result, Err(AuthError::Expired));
        }
    }
}
