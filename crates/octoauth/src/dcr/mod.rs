//! Dynamic Client Registration (RFC 7591) input validation.
//!
//! Pure checks run before a client is registered and long before any token
//! is issued to it.

mod uri;
pub mod validator;

pub use validator::{
    DEFAULT_APP_NAME_REGEX, DcrValidator, client_error, is_application_name_valid,
    is_application_role_permission_required, is_backchannel_logout_uri_valid,
    is_redirect_uri_valid, server_error,
};
