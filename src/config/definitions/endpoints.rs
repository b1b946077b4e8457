use crate::domain::EndpointKind;
use crate::endpoint::EndpointDescriptor;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawEndpoint {
    pub(crate) name: String,
    pub(crate) kind: String,
    pub(crate) address: String,
    #[serde(default)]
    pub(crate) auth_mode: Option<String>,
}

pub(crate) fn parse_endpoints(
    raw_endpoints: Vec<RawEndpoint>,
    errors: &mut Vec<String>,
) -> Vec<EndpointDescriptor> {
    let mut endpoints = Vec::with_capacity(raw_endpoints.len());

    for raw in raw_endpoints {
        if raw.name.trim().is_empty() {
            errors.push("error[endpoints]: endpoint name must be non-empty".to_string());
        }
        if raw.address.trim().is_empty() {
            errors.push(format!(
                "error[endpoints]: endpoint `{}` must declare an address",
                raw.name
            ));
        }

        let kind = match EndpointKind::from_raw(&raw.kind) {
            Some(kind) => kind,
            None => {
                errors.push(format!(
                    "error[endpoints]: endpoint `{}` has unknown kind `{}` (expected rest, soap, queue, or stream)",
                    raw.name, raw.kind
                ));
                EndpointKind::Rest
            }
        };

        endpoints.push(EndpointDescriptor {
            name: raw.name,
            kind,
            address: raw.address,
            auth_mode: raw.auth_mode,
        });
    }

    endpoints
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(name: &str, kind: &str) -> RawEndpoint {
        RawEndpoint {
            name: name.to_string(),
            kind: kind.to_string(),
            address: "amqp://broker/q".to_string(),
            auth_mode: None,
        }
    }

    #[test]
    fn known_kinds_parse() {
        let mut errors = Vec::new();
        let endpoints = parse_endpoints(vec![raw("q", "queue"), raw("s", "stream")], &mut errors);
        assert!(errors.is_empty());
        assert_eq!(endpoints[0].kind, EndpointKind::Queue);
        assert_eq!(endpoints[1].kind, EndpointKind::Stream);
    }

    #[test]
    fn unknown_kind_accumulates_an_error() {
        let mut errors = Vec::new();
        parse_endpoints(vec![raw("q", "carrier_pigeon")], &mut errors);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("carrier_pigeon"));
    }
}
