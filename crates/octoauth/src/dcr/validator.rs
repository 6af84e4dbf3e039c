//! Input checks for dynamic client registration.
//!
//! The predicates never fail: invalid input yields `false` and a debug log
//! line explaining why.

use regex::Regex;
use tracing::debug;

use crate::config::{AuthConfig, ConfigError, DcrmConfig};
use crate::dcr::uri;
use crate::error::{AuthError, BoxError, ErrorCode, ErrorKind};

/// Platform default for application names.
pub const DEFAULT_APP_NAME_REGEX: &str = r"^[a-zA-Z0-9\s.+_-]*$";

/// `true` iff `redirect_uri` is non-blank and parses as a URI reference.
#[must_use]
pub fn is_redirect_uri_valid(redirect_uri: &str) -> bool {
    debug!(uri = %redirect_uri, "Validating redirect URI");

    if redirect_uri.trim().is_empty() {
        debug!("The redirection URI is either empty or blank");
        return false;
    }

    match uri::parse(redirect_uri) {
        Ok(_) => true,
        Err(e) => {
            debug!(uri = %redirect_uri, error = %e, "The redirection URI is not a valid URI");
            false
        }
    }
}

/// `true` iff `logout_uri` is blank, or an absolute URI without a fragment.
#[must_use]
pub fn is_backchannel_logout_uri_valid(logout_uri: &str) -> bool {
    if logout_uri.trim().is_empty() {
        return true;
    }

    debug!(uri = %logout_uri, "Validating back-channel logout URI");

    if logout_uri.contains('#') {
        debug!(uri = %logout_uri, "The back-channel logout URI contains a fragment component");
        return false;
    }

    let parsed = match uri::parse(logout_uri) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!(uri = %logout_uri, error = %e, "The back-channel logout URI is not a valid URI");
            return false;
        }
    };

    if !parsed.is_absolute() {
        debug!(uri = %logout_uri, "The back-channel logout URI is not an absolute URI");
        return false;
    }

    true
}

/// `true` iff `name` fully matches `regex`, or the default regex when `None`.
///
/// A regex that does not compile matches nothing.
#[must_use]
pub fn is_application_name_valid(name: &str, regex: Option<&str>) -> bool {
    let pattern = regex
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .unwrap_or(DEFAULT_APP_NAME_REGEX);

    match compile_full_match(pattern) {
        Ok(re) => re.is_match(name),
        Err(e) => {
            debug!(regex = %pattern, error = %e, "Application name regex does not compile");
            false
        }
    }
}

/// Reads `oauth.dcrm.application_role_permission_required_to_view`.
///
/// Absent or empty means `true`; otherwise only a case-insensitive `true`
/// enables it.
#[must_use]
pub fn is_application_role_permission_required(config: &DcrmConfig) -> bool {
    match config.application_role_permission_required_to_view.as_deref() {
        None => true,
        Some(value) if value.is_empty() => true,
        Some(value) => value.trim().eq_ignore_ascii_case("true"),
    }
}

/// Builds a client error from an error code's template.
#[must_use]
pub fn client_error(code: ErrorCode, data: Option<&str>, cause: Option<BoxError>) -> AuthError {
    AuthError::new(ErrorKind::Client, code, data).with_optional_source(cause)
}

/// Builds a server error from an error code's template.
#[must_use]
pub fn server_error(code: ErrorCode, data: Option<&str>, cause: Option<BoxError>) -> AuthError {
    AuthError::new(ErrorKind::Server, code, data).with_optional_source(cause)
}

/// Anchors the pattern so that it must match the whole input.
fn compile_full_match(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{pattern})$"))
}

// =============================================================================
// Configured Validator
// =============================================================================

/// Validator bound to the configured application-name regex.
///
/// The regex is compiled once at construction.
#[derive(Debug, Clone)]
pub struct DcrValidator {
    name_pattern: Regex,
    role_permission_required: bool,
}

impl DcrValidator {
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if the configured regex does not
    /// compile.
    pub fn from_config(config: &AuthConfig) -> Result<Self, ConfigError> {
        let pattern = config.service_providers.name_regex();
        let name_pattern = compile_full_match(pattern).map_err(|e| {
            ConfigError::InvalidValue(format!(
                "service_providers.sp_name_regex '{}' does not compile: {}",
                pattern, e
            ))
        })?;
        Ok(Self {
            name_pattern,
            role_permission_required: is_application_role_permission_required(&config.oauth.dcrm),
        })
    }

    #[must_use]
    pub fn is_redirect_uri_valid(&self, redirect_uri: &str) -> bool {
        is_redirect_uri_valid(redirect_uri)
    }

    #[must_use]
    pub fn is_backchannel_logout_uri_valid(&self, logout_uri: &str) -> bool {
        is_backchannel_logout_uri_valid(logout_uri)
    }

    #[must_use]
    pub fn is_application_name_valid(&self, name: &str) -> bool {
        let valid = self.name_pattern.is_match(name);
        if !valid {
            debug!(name = %name, regex = %self.name_pattern, "Application name rejected");
        }
        valid
    }

    #[must_use]
    pub fn is_application_role_permission_required(&self) -> bool {
        self.role_permission_required
    }

    /// Checks registration metadata, returning the first violation.
    ///
    /// # Errors
    ///
    /// Returns a client error carrying the offending value.
    pub fn validate_registration(
        &self,
        name: &str,
        redirect_uris: &[String],
        backchannel_logout_uri: Option<&str>,
    ) -> Result<(), AuthError> {
        if !self.is_application_name_valid(name) {
            return Err(client_error(
                ErrorCode::InvalidApplicationName,
                Some(self.name_pattern.as_str()),
                None,
            ));
        }
        if let Some(bad) = redirect_uris.iter().find(|u| !is_redirect_uri_valid(u)) {
            return Err(client_error(ErrorCode::InvalidRedirectUri, Some(bad), None));
        }
        if let Some(uri) = backchannel_logout_uri
            && !is_backchannel_logout_uri_valid(uri)
        {
            return Err(client_error(
                ErrorCode::InvalidBackchannelLogoutUri,
                Some(uri),
                None,
            ));
        }
        Ok(())
    }
}
