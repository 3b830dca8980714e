//! URI-driven configuration (§6).
//!
//! A destination URI such as `queue://orders?consumer.prefetchSize=10&
//! consumer.nms.IgnoreExpiration=true` carries broker-facing `ConsumerInfo`
//! fields under the `consumer.` prefix and consumer-local extensions under
//! `consumer.nms.`; `session.` configures the owning `Session`. The teacher
//! has no URI layer of its own (IB Gateway connections are bare host:port),
//! so this is grounded on the wider retrieval pack's query-string-driven
//! setup and built on the `url` crate rather than hand-rolled splitting.

use url::Url;

use crate::{command::Destination, Error, Result};

/// `consumer.*` keys applied to `ConsumerInfo` at consumer-creation time.
#[derive(Debug, Clone, Default)]
pub struct ConsumerUriOptions {
    pub prefetch_size: Option<u32>,
    pub maximum_pending_message_limit: Option<u32>,
    pub no_local: Option<bool>,
    pub browser: Option<bool>,
    pub dispatch_async: Option<bool>,
    pub priority: Option<i8>,
    pub selector: Option<String>,
    pub subscription_name: Option<String>,
}

/// `consumer.nms.*` keys applied to the consumer object itself, never sent
/// to the broker.
#[derive(Debug, Clone, Default)]
pub struct ConsumerLocalOptions {
    pub ignore_expiration: Option<bool>,
}

/// `session.*` keys applied to the owning `Session`.
#[derive(Debug, Clone, Default)]
pub struct SessionUriOptions {
    pub priority_supported: Option<bool>,
}

/// Everything recovered from parsing one destination URI.
#[derive(Debug, Clone)]
pub struct ParsedDestinationUri {
    pub destination: Destination,
    pub consumer: ConsumerUriOptions,
    pub consumer_local: ConsumerLocalOptions,
    pub session: SessionUriOptions,
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

/// Parse a destination URI. Scheme selects the destination kind: `queue`,
/// `topic`, `temp-queue`/`temp:queue`, `temp-topic`/`temp:topic`; an
/// unrecognised scheme is treated as a queue, matching how a bare name with
/// no scheme is handled by most OpenWire clients. Unknown query keys (no
/// recognised prefix, or a recognised prefix with an unrecognised suffix)
/// are ignored rather than rejected. A malformed query string surfaces as
/// `Error::InvalidUri`.
pub fn parse_destination_uri(uri: &str) -> Result<ParsedDestinationUri> {
    let url = Url::parse(uri).map_err(|err| Error::InvalidUri(format!("{uri}: {err}")))?;

    let physical_name = {
        let host = url.host_str().unwrap_or("");
        let path = url.path().trim_start_matches('/');
        if host.is_empty() {
            path.to_string()
        } else if path.is_empty() {
            host.to_string()
        } else {
            format!("{host}/{path}")
        }
    };
    if physical_name.is_empty() {
        return Err(Error::InvalidDestination);
    }

    let (is_topic, is_temporary) = match url.scheme() {
        "queue" => (false, false),
        "topic" => (true, false),
        "temp-queue" | "temp:queue" => (false, true),
        "temp-topic" | "temp:topic" => (true, true),
        _ => (false, false),
    };
    let destination = Destination { physical_name, is_topic, is_temporary };

    let mut parsed = ParsedDestinationUri {
        destination,
        consumer: ConsumerUriOptions::default(),
        consumer_local: ConsumerLocalOptions::default(),
        session: SessionUriOptions::default(),
    };
    for (key, value) in url.query_pairs() {
        apply_query_param(&mut parsed, &key, &value);
    }
    Ok(parsed)
}

fn apply_query_param(parsed: &mut ParsedDestinationUri, key: &str, value: &str) {
    if let Some(suffix) = key.strip_prefix("consumer.nms.") {
        match suffix {
            "IgnoreExpiration" | "ignoreExpiration" => {
                parsed.consumer_local.ignore_expiration = parse_bool(value);
            }
            _ => {}
        }
    } else if let Some(suffix) = key.strip_prefix("consumer.") {
        match suffix {
            "prefetchSize" => parsed.consumer.prefetch_size = value.parse().ok(),
            "maximumPendingMessageLimit" => {
                parsed.consumer.maximum_pending_message_limit = value.parse().ok();
            }
            "noLocal" => parsed.consumer.no_local = parse_bool(value),
            "browser" => parsed.consumer.browser = parse_bool(value),
            "dispatchAsync" => parsed.consumer.dispatch_async = parse_bool(value),
            "priority" => parsed.consumer.priority = value.parse().ok(),
            "selector" => parsed.consumer.selector = Some(value.to_string()),
            "subscriptionName" => parsed.consumer.subscription_name = Some(value.to_string()),
            _ => {}
        }
    } else if let Some(suffix) = key.strip_prefix("session.") {
        if suffix == "prioritySupported" {
            parsed.session.priority_supported = parse_bool(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn plain_queue_uri_has_no_options() {
        let parsed = parse_destination_uri("queue://orders").unwrap();
        assert_eq!(parsed.destination.physical_name, "orders");
        assert!(!parsed.destination.is_topic);
        assert!(parsed.consumer.prefetch_size.is_none());
    }

    #[test]
    fn topic_scheme_is_recognised() {
        let parsed = parse_destination_uri("topic://market-data").unwrap();
        assert!(parsed.destination.is_topic);
        assert!(!parsed.destination.is_temporary);
    }

    #[test]
    fn consumer_prefix_populates_consumer_info_options() {
        let parsed =
            parse_destination_uri("queue://orders?consumer.prefetchSize=10&consumer.noLocal=true")
                .unwrap();
        assert_eq!(parsed.consumer.prefetch_size, Some(10));
        assert_eq!(parsed.consumer.no_local, Some(true));
    }

    #[test]
    fn consumer_nms_prefix_populates_local_options_not_consumer_info() {
        let parsed =
            parse_destination_uri("queue://orders?consumer.nms.IgnoreExpiration=true").unwrap();
        assert_eq!(parsed.consumer_local.ignore_expiration, Some(true));
        assert!(parsed.consumer.prefetch_size.is_none());
    }

    #[test]
    fn session_prefix_populates_session_options() {
        let parsed = parse_destination_uri("queue://orders?session.prioritySupported=false").unwrap();
        assert_eq!(parsed.session.priority_supported, Some(false));
    }

    #[test]
    fn unknown_keys_are_silently_ignored() {
        let parsed = parse_destination_uri("queue://orders?bogus=1&consumer.bogus=2").unwrap();
        assert_eq!(parsed.destination.physical_name, "orders");
        assert!(parsed.consumer.prefetch_size.is_none());
    }

    #[test]
    fn malformed_uri_is_an_error() {
        assert!(matches!(parse_destination_uri("not a uri"), Err(Error::InvalidUri(_))));
    }

    #[test]
    fn empty_physical_name_is_an_invalid_destination() {
        assert!(matches!(parse_destination_uri("queue://"), Err(Error::InvalidDestination)));
    }
}
