// src/utils/surt.rs

//! URL to SURT conversion.
//!
//! A SURT reverses the host labels so that a string prefix selects a domain
//! and all of its subdomains:
//!
//! ```text
//! http://www.nla.gov.au/fish.html  ->  (au,gov,nla,www,)/fish.html
//! ```

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

use crate::error::{AppError, Result};

static WWW_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^www\d*\.").unwrap_or_else(|e| unreachable!("invalid www pattern: {e}"))
});

/// Convert an absolute URL into its SURT form.
pub fn to_surt(url: &str) -> Result<String> {
    let parsed = Url::parse(url)?;
    let host = host_of(&parsed, url)?;

    let mut out = String::with_capacity(url.len() + 2);
    out.push('(');
    for label in host.split('.').rev() {
        out.push_str(label);
        out.push(',');
    }
    // `Url::port` is None for the scheme's default port
    if let Some(port) = parsed.port() {
        out.push(':');
        out.push_str(&port.to_string());
    }
    out.push(')');
    out.push_str(parsed.path());
    if let Some(query) = parsed.query() {
        out.push('?');
        out.push_str(query);
    }
    Ok(out)
}

/// Lowercased host of an absolute URL.
pub fn host(url: &str) -> Result<String> {
    let parsed = Url::parse(url)?;
    host_of(&parsed, url)
}

/// Host with a leading `www` / `wwwN` label removed.
pub fn site(host: &str) -> String {
    WWW_PREFIX.replace(host, "").into_owned()
}

fn host_of(parsed: &Url, raw: &str) -> Result<String> {
    parsed
        .host_str()
        .map(|h| h.to_lowercase())
        .ok_or_else(|| AppError::validation(format!("URL has no host: {}", raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_surt() {
        assert_eq!(
            to_surt("http://www.nla.gov.au/fish.html").unwrap(),
            "(au,gov,nla,www,)/fish.html"
        );
        assert_eq!(to_surt("http://Example.COM").unwrap(), "(com,example,)/");
        assert_eq!(
            to_surt("https://example.com:8443/a?b=c").unwrap(),
            "(com,example,:8443)/a?b=c"
        );
    }

    #[test]
    fn test_to_surt_rejects_relative() {
        assert!(to_surt("/relative/path").is_err());
    }

    #[test]
    fn test_site() {
        assert_eq!(site("www.nla.gov.au"), "nla.gov.au");
        assert_eq!(site("www2.example.edu.au"), "example.edu.au");
        assert_eq!(site("wwwexample.com"), "wwwexample.com");
    }
}
