use std::collections::BTreeMap;

use reqwest::header::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::ValidationError;

const REDACTED: &str = "********";

/// Connection parameters for a remote tool server, one set per transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum TransportConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    #[serde(rename_all = "camelCase")]
    Http {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_secret: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token_url: Option<String>,
    },
}

/// A registered remote tool server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteToolServer {
    pub name: String,
    #[serde(flatten)]
    pub transport: TransportConfig,
}

impl RemoteToolServer {
    pub fn transport_name(&self) -> &'static str {
        match self.transport {
            TransportConfig::Stdio { .. } => "stdio",
            TransportConfig::Http { .. } => "http",
        }
    }

    /// Copy safe to hand back to callers, with the client secret masked
    pub fn redacted(&self) -> Self {
        let mut server = self.clone();
        if let TransportConfig::Http { client_secret, .. } = &mut server.transport {
            if client_secret.is_some() {
                *client_secret = Some(REDACTED.to_string());
            }
        }
        server
    }
}

/// Registration input as received at the service boundary, before validation
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRegistration {
    pub name: Option<String>,
    pub transport: Option<String>,
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    pub env: Option<BTreeMap<String, String>>,
    pub url: Option<String>,
    pub headers: Option<BTreeMap<String, String>>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub token_url: Option<String>,
}

fn not_allowed(field: &'static str, transport: &str) -> ValidationError {
    ValidationError::InvalidField {
        field,
        reason: format!("not allowed for {} transport", transport),
    }
}

fn parse_http_url(field: &'static str, raw: &str) -> Result<Url, ValidationError> {
    let url = Url::parse(raw).map_err(|e| ValidationError::InvalidField {
        field,
        reason: e.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ValidationError::InvalidField {
            field,
            reason: format!("unsupported scheme '{}'", other),
        }),
    }
}

fn check_headers(headers: &BTreeMap<String, String>) -> Result<(), ValidationError> {
    for (name, value) in headers {
        HeaderName::from_bytes(name.as_bytes()).map_err(|e| ValidationError::InvalidField {
            field: "headers",
            reason: format!("bad header name '{}': {}", name, e),
        })?;
        HeaderValue::from_str(value).map_err(|e| ValidationError::InvalidField {
            field: "headers",
            reason: format!("bad value for header '{}': {}", name, e),
        })?;
    }
    Ok(())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl ServerRegistration {
    pub fn stdio<N: Into<String>, C: Into<String>>(name: N, command: C, args: Vec<String>) -> Self {
        Self {
            name: Some(name.into()),
            transport: Some("stdio".into()),
            command: Some(command.into()),
            args: Some(args),
            ..Default::default()
        }
    }

    pub fn http<N: Into<String>, U: Into<String>>(name: N, url: U) -> Self {
        Self {
            name: Some(name.into()),
            transport: Some("http".into()),
            url: Some(url.into()),
            ..Default::default()
        }
    }

    /// Turn raw input into a server definition, rejecting anything inconsistent
    pub fn validate(self) -> Result<RemoteToolServer, ValidationError> {
        let name = non_blank(self.name).ok_or(ValidationError::MissingField("name"))?;
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(ValidationError::InvalidField {
                field: "name",
                reason: "only letters, digits, '-', '_' and '.' are allowed".into(),
            });
        }

        let transport = non_blank(self.transport).ok_or(ValidationError::MissingField("transport"))?;
        let transport = match transport.to_ascii_lowercase().as_str() {
            "stdio" => {
                for (field, present) in [
                    ("url", self.url.is_some()),
                    ("headers", self.headers.is_some()),
                    ("clientId", self.client_id.is_some()),
                    ("clientSecret", self.client_secret.is_some()),
                    ("tokenUrl", self.token_url.is_some()),
                ] {
                    if present {
                        return Err(not_allowed(field, "stdio"));
                    }
                }
                TransportConfig::Stdio {
                    command: non_blank(self.command).ok_or(ValidationError::MissingField("command"))?,
                    args: self.args.unwrap_or_default(),
                    env: self.env.unwrap_or_default(),
                }
            }
            "http" => {
                for (field, present) in [
                    ("command", self.command.is_some()),
                    ("args", self.args.is_some()),
                    ("env", self.env.is_some()),
                ] {
                    if present {
                        return Err(not_allowed(field, "http"));
                    }
                }
                let url = non_blank(self.url).ok_or(ValidationError::MissingField("url"))?;
                parse_http_url("url", &url)?;

                let client_id = non_blank(self.client_id);
                let client_secret = non_blank(self.client_secret);
                match (&client_id, &client_secret) {
                    (Some(_), None) => return Err(ValidationError::MissingField("clientSecret")),
                    (None, Some(_)) => return Err(ValidationError::MissingField("clientId")),
                    _ => {}
                }
                let token_url = non_blank(self.token_url);
                if let Some(token_url) = &token_url {
                    if client_id.is_none() {
                        return Err(ValidationError::MissingField("clientId"));
                    }
                    parse_http_url("tokenUrl", token_url)?;
                }

                let headers = self.headers.unwrap_or_default();
                check_headers(&headers)?;

                TransportConfig::Http {
                    url,
                    headers,
                    client_id,
                    client_secret,
                    token_url,
                }
            }
            other => {
                return Err(ValidationError::InvalidField {
                    field: "transport",
                    reason: format!("expected 'stdio' or 'http', got '{}'", other),
                })
            }
        };

        Ok(RemoteToolServer { name, transport })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    /// Registered but no connection attempted yet
    Disconnected,
    Connected,
    Unreachable,
}

/// A registered server together with its connection state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    #[serde(flatten)]
    pub server: RemoteToolServer,
    pub status: ServerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}
