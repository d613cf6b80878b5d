/// Destination coordinates derived from a recipient address.
///
/// `foo+add@example.com` with route prefix `/` becomes path `/foo/add` on
/// domain `example.com`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub path: String,
    pub domain: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("Malformed address, no '@' in {0:?}")]
    Malformed(String),
}

/// Maps `mailbox+tag@domain` addresses onto webhook routes
#[derive(Debug, Clone)]
pub struct AddressRouter {
    api_route: String,
}

impl AddressRouter {
    pub fn new(api_route: impl Into<String>) -> Self {
        Self {
            api_route: api_route.into(),
        }
    }

    /// Split an address into routing path and domain.
    ///
    /// Every `+` in the local part becomes a path separator. The split is on
    /// the first `@`; anything after it is the domain.
    pub fn split(&self, address: &str) -> Result<Route, AddressError> {
        let (mailbox, domain) = address
            .split_once('@')
            .ok_or_else(|| AddressError::Malformed(address.to_string()))?;

        let path = format!("{}{}", self.api_route, mailbox.replace('+', "/"));

        Ok(Route {
            path,
            domain: domain.to_string(),
        })
    }
}

/// Suffix match against the allow-list, so listed domains delegate to their
/// subdomains.
pub fn domain_allowed(domain: &str, allow_list: &[String]) -> bool {
    allow_list.iter().any(|allowed| domain.ends_with(allowed.as_str()))
}

/// Membership check honouring the on/off switch. With checking off every
/// domain is accepted.
pub fn check_domain(domain: &str, checking_on: bool, allow_list: &[String]) -> bool {
    !checking_on || domain_allowed(domain, allow_list)
}
