//! Host header validation.
//!
//! Defends against Host-header-confusion and cache-poisoning requests
//! without a configured vhost list: the request must name this server,
//! nothing else.

use crate::{errors::Reject, http::request::Request, limits::SiteConfig};

/// Checks that the request carries exactly one `Host` header naming an
/// allowed host, and (when a port is given) this server's port.
///
/// A missing header is a 400; any mismatch is a 403 that the connection
/// handler reports as a security violation.
pub(crate) fn validate(req: &Request, site: &SiteConfig) -> Result<(), Reject> {
    let value = req.header("host").ok_or(Reject::MissingHost)?;
    if req.headers().count("host") > 1 {
        return Err(Reject::BadRequest("duplicate Host header"));
    }

    // Split on the rightmost ':' so a bare host and host:port both work.
    let (host, port) = match value.rsplit_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (value, None),
    };

    if !site.allowed_hosts.contains(&host.to_ascii_lowercase()) {
        return Err(Reject::HostMismatch);
    }

    // An absent port always matches: it denotes the port the client
    // connected to, which is necessarily ours.
    if let Some(port) = port {
        match port.parse::<u16>() {
            Ok(port) if port == site.port => {}
            _ => return Err(Reject::HostMismatch),
        }
    }

    Ok(())
}
