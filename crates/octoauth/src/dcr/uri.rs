//! Syntax check for URI references (RFC 3986).
//!
//! `url::Url` only accepts absolute URLs and silently repairs some invalid
//! input, so registration metadata is checked here instead. The grammar is
//! the strict one: no whitespace or control characters, well-formed percent
//! escapes, a valid scheme when one is present, a non-empty authority after
//! `//`, and brackets only around an IPv6 host literal. Ports and
//! registry-based authorities are not interpreted.

/// Parsed shape of a syntactically valid URI reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct UriReference<'a> {
    pub scheme: Option<&'a str>,
    pub authority: Option<&'a str>,
    pub fragment: Option<&'a str>,
}

impl UriReference<'_> {
    pub fn is_absolute(&self) -> bool {
        self.scheme.is_some()
    }
}

/// Why a string is not a URI reference.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum UriSyntaxError {
    #[error("empty URI")]
    Empty,
    #[error("illegal character at index {0}")]
    IllegalCharacter(usize),
    #[error("malformed escape pair at index {0}")]
    MalformedEscape(usize),
    #[error("illegal character in scheme name at index {0}")]
    IllegalScheme(usize),
    #[error("expected scheme name at index 0")]
    MissingScheme,
    #[error("expected scheme-specific part at index {0}")]
    MissingSchemeSpecificPart(usize),
    #[error("expected authority at index {0}")]
    MissingAuthority(usize),
    #[error("malformed IPv6 address at index {0}")]
    MalformedIpv6(usize),
}

fn is_unreserved(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~')
}

fn is_sub_delim(c: char) -> bool {
    matches!(
        c,
        '!' | '$' | '&' | '\'' | '(' | ')' | '*' | '+' | ',' | ';' | '='
    )
}

/// Characters allowed outside the authority, `%` handled separately.
fn is_path_char(c: char) -> bool {
    is_unreserved(c) || is_sub_delim(c) || matches!(c, ':' | '@' | '/' | '?') || is_other(c)
}

/// Non-ASCII characters that are neither whitespace nor control characters.
fn is_other(c: char) -> bool {
    !c.is_ascii() && !c.is_control() && !c.is_whitespace()
}

fn check_component(
    component: &str,
    offset: usize,
    allowed: impl Fn(char) -> bool,
) -> Result<(), UriSyntaxError> {
    let bytes = component.as_bytes();
    for (i, c) in component.char_indices() {
        if c == '%' {
            let hex = bytes.get(i + 1..i + 3);
            if !hex.is_some_and(|h| h.iter().all(u8::is_ascii_hexdigit)) {
                return Err(UriSyntaxError::MalformedEscape(offset + i));
            }
            continue;
        }
        if !allowed(c) {
            return Err(UriSyntaxError::IllegalCharacter(offset + i));
        }
    }
    Ok(())
}

fn is_authority_char(c: char) -> bool {
    is_unreserved(c) || is_sub_delim(c) || matches!(c, ':' | '@') || is_other(c)
}

/// Brackets may only enclose a leading IPv6 host literal, optionally
/// followed by `:port`.
fn check_authority(authority: &str, offset: usize) -> Result<(), UriSyntaxError> {
    let host_start = authority.rfind('@').map_or(0, |i| i + 1);
    let (userinfo, host_port) = authority.split_at(host_start);
    check_component(userinfo, offset, is_authority_char)?;

    let host_offset = offset + host_start;
    let Some(literal) = host_port.strip_prefix('[') else {
        return check_component(host_port, host_offset, is_authority_char);
    };

    let close = literal
        .find(']')
        .ok_or(UriSyntaxError::MalformedIpv6(host_offset))?;
    let address = &literal[..close];
    let is_address_char = |c: char| c.is_ascii_hexdigit() || matches!(c, ':' | '.');
    if address.is_empty() || !address.chars().all(is_address_char) {
        return Err(UriSyntaxError::MalformedIpv6(host_offset + 1));
    }

    let port_offset = host_offset + close + 2;
    match &literal[close + 1..] {
        "" => Ok(()),
        port => match port.strip_prefix(':') {
            Some(digits) if digits.chars().all(|c| c.is_ascii_digit()) => Ok(()),
            _ => Err(UriSyntaxError::IllegalCharacter(port_offset)),
        },
    }
}

fn check_scheme(scheme: &str) -> Result<(), UriSyntaxError> {
    let mut chars = scheme.char_indices();
    match chars.next() {
        None => return Err(UriSyntaxError::MissingScheme),
        Some((_, c)) if !c.is_ascii_alphabetic() => return Err(UriSyntaxError::IllegalScheme(0)),
        Some(_) => {}
    }
    for (i, c) in chars {
        if !(c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')) {
            return Err(UriSyntaxError::IllegalScheme(i));
        }
    }
    Ok(())
}

/// Parses a URI reference, absolute or relative.
pub(crate) fn parse(input: &str) -> Result<UriReference<'_>, UriSyntaxError> {
    if input.is_empty() {
        return Err(UriSyntaxError::Empty);
    }

    let (before_fragment, fragment) = match input.find('#') {
        Some(i) => (&input[..i], Some((&input[i + 1..], i + 1))),
        None => (input, None),
    };

    // A colon ahead of any '/', '?' or '#' terminates a scheme.
    let scheme_end = before_fragment
        .find([':', '/', '?'])
        .filter(|&i| before_fragment.as_bytes()[i] == b':');
    let (scheme, rest, rest_offset) = match scheme_end {
        Some(i) => {
            let scheme = &before_fragment[..i];
            check_scheme(scheme)?;
            (Some(scheme), &before_fragment[i + 1..], i + 1)
        }
        None => (None, before_fragment, 0),
    };

    if scheme.is_some() && rest.is_empty() {
        return Err(UriSyntaxError::MissingSchemeSpecificPart(rest_offset));
    }

    let (authority, path, path_offset) = match rest.strip_prefix("//") {
        Some(after) => {
            let end = after.find(['/', '?']).unwrap_or(after.len());
            let authority = &after[..end];
            let path = &after[end..];
            if authority.is_empty() && path.is_empty() {
                return Err(UriSyntaxError::MissingAuthority(rest_offset + 2));
            }
            check_authority(authority, rest_offset + 2)?;
            (Some(authority), path, rest_offset + 2 + end)
        }
        None => (None, rest, rest_offset),
    };

    check_component(path, path_offset, is_path_char)?;

    let fragment = match fragment {
        Some((fragment, offset)) => {
            check_component(fragment, offset, is_path_char)?;
            Some(fragment)
        }
        None => None,
    };

    Ok(UriReference {
        scheme,
        authority,
        fragment,
    })
}
