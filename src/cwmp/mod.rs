use crate::http::HttpRequest;

use error::CwmpError;
use xml::XmlNode;

pub mod error;
pub mod xml;

/// Matches both `InternetGatewayDevice.` (TR-098) and `Device.` (TR-181) data models.
pub const CONNECTION_REQUEST_URL_PARAM: &str = "ManagementServer.ConnectionRequestURL";

/// A ConnectionRequestURL as found in a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionUrl {
    /// Unescaped, trimmed value.
    pub value: String,
    /// Trimmed value as written in the document, entity references included.
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteOutcome {
    Rewritten { origin: String, replacement: String },
    Unchanged,
}

/// Look for the ConnectionRequestURL parameter in a CWMP message.
///
/// `Ok(None)` means the message simply does not carry one, which is the case
/// for most event-only Informs.
pub fn find_connection_url(xml: &str) -> Result<Option<ConnectionUrl>, CwmpError> {
    let root = XmlNode::parse_fragment(xml)?;

    for parameter in root.descendants("ParameterValueStruct") {
        let is_connection_url = parameter
            .child("Name")
            .is_some_and(|name| name.text().trim().ends_with(CONNECTION_REQUEST_URL_PARAM));

        if !is_connection_url {
            continue;
        }

        if let Some(value) = parameter.child("Value") {
            let raw = value.raw_text.trim();

            // Nothing to route through the proxy.
            if raw.is_empty() {
                continue;
            }

            return Ok(Some(ConnectionUrl {
                value: value.text().trim().to_string(),
                raw: raw.to_string(),
            }));
        }
    }

    Ok(None)
}

pub fn get_connection_url(xml: &str) -> Result<String, CwmpError> {
    find_connection_url(xml)?
        .map(|url| url.value)
        .ok_or(CwmpError::NotFound)
}

/// Rewrites ConnectionRequestURL values so they point at the connection
/// request proxy listening on `proxy_host_port`.
#[derive(Debug, Clone)]
pub struct CwmpMessage {
    proxy_host_port: String,
}

impl CwmpMessage {
    pub fn new(proxy_host_port: impl Into<String>) -> Self {
        CwmpMessage {
            proxy_host_port: proxy_host_port.into(),
        }
    }

    pub fn proxy_host_port(&self) -> &str {
        &self.proxy_host_port
    }

    /// The origin is embedded as-is, without percent-encoding.
    pub fn proxied_url(&self, origin: &str) -> String {
        format!("http://{}/client?origin={}", self.proxy_host_port, origin)
    }

    /// Replace the first occurrence of the request's ConnectionRequestURL with
    /// its proxied form, updating the content length.
    ///
    /// Requests that carry no such parameter get their body back untouched.
    /// Only a failure to read the body is reported as an error.
    ///
    /// The origin is embedded as it appears in the document, so entity
    /// references such as `&amp;` are carried over still escaped.
    pub fn replace_connection_url(
        &self,
        request: &mut HttpRequest,
    ) -> Result<RewriteOutcome, CwmpError> {
        let body = request.read_body()?;

        let rewritten = match std::str::from_utf8(&body) {
            Ok(text) => find_connection_url(text)
                .ok()
                .flatten()
                .filter(|url| text.contains(&url.raw))
                .map(|url| {
                    let replacement = self.proxied_url(&url.raw);
                    let new_body = text.replacen(&url.raw, &replacement, 1);
                    (url.value, replacement, new_body)
                }),
            Err(_) => None,
        };

        match rewritten {
            Some((origin, replacement, new_body)) => {
                request.replace_body(new_body.into_bytes());
                Ok(RewriteOutcome::Rewritten {
                    origin,
                    replacement,
                })
            }
            None => {
                request.restore_body(body);
                Ok(RewriteOutcome::Unchanged)
            }
        }
    }
}
