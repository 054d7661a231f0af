//! Bearer token and password primitives for the presence hub.

pub mod error;
pub mod password;
pub mod token;

pub use error::{AuthError, ErrorResponse};
pub use password::{hash_password, verify_password};
pub use token::{Claims, DEFAULT_TOKEN_TTL, HmacTokenIssuer, TokenValidator, bearer_token};
