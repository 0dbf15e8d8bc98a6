//! Channel endpoint derivation.

use std::collections::BTreeMap;
use std::fmt;

use url::Url;

use crate::channel::CHAT_SESSION_KEY;
use crate::error::LinkError;

/// Query parameter carrying the session hint.
pub const SESSION_QUERY_PARAM: &str = "session_id";

/// Which real-time stream a channel carries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Assistant chat conversation.
    Chat,
    /// Live courier location for one delivery.
    DeliveryTracking {
        /// Delivery being tracked.
        delivery_id: String,
    },
}

impl ChannelKind {
    /// Tracking channel for `delivery_id`.
    #[must_use]
    pub fn tracking(delivery_id: impl Into<String>) -> Self {
        Self::DeliveryTracking {
            delivery_id: delivery_id.into(),
        }
    }

    /// Path segments appended to the base address.
    #[must_use]
    pub fn path_segments(&self) -> Vec<&str> {
        match self {
            Self::Chat => vec!["ws", "chat"],
            Self::DeliveryTracking { delivery_id } => vec!["ws", "delivery", delivery_id],
        }
    }

    /// Key under which this channel's session id is stored.
    #[must_use]
    pub fn session_key(&self) -> String {
        match self {
            Self::Chat => CHAT_SESSION_KEY.to_string(),
            Self::DeliveryTracking { delivery_id } => format!("delivery_{delivery_id}_session_id"),
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chat => f.write_str("chat"),
            Self::DeliveryTracking { delivery_id } => write!(f, "tracking:{delivery_id}"),
        }
    }
}

/// Map an API base address onto its WebSocket counterpart.
///
/// `http` becomes `ws` and `https` becomes `wss`; WebSocket schemes pass
/// through unchanged.
///
/// # Errors
///
/// Returns [`LinkError::InvalidUrl`] for any other scheme.
pub fn websocket_base(base: &Url) -> Result<Url, LinkError> {
    let scheme = match base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(LinkError::InvalidUrl(format!(
                "unsupported scheme '{other}' in {base}"
            )));
        }
    };

    let mut url = base.clone();
    url.set_scheme(scheme)
        .map_err(|()| LinkError::InvalidUrl(format!("cannot switch {base} to {scheme}")))?;
    Ok(url)
}

/// Build the full URL a channel connects to.
///
/// Extra query parameters are appended in key order, followed by the session
/// hint when one is known. A `session_id` entry in `query` is ignored in
/// favour of the hint.
///
/// # Errors
///
/// Returns [`LinkError::InvalidUrl`] if the base cannot carry a path or uses
/// an unsupported scheme.
pub fn channel_endpoint(
    base: &Url,
    kind: &ChannelKind,
    session_hint: Option<&str>,
    query: &BTreeMap<String, String>,
) -> Result<Url, LinkError> {
    let mut url = websocket_base(base)?;

    url.path_segments_mut()
        .map_err(|()| LinkError::InvalidUrl(format!("{base} cannot be a base")))?
        .pop_if_empty()
        .extend(kind.path_segments());

    url.set_query(None);
    url.set_fragment(None);

    let extra: Vec<(&String, &String)> = query
        .iter()
        .filter(|(key, _)| key.as_str() != SESSION_QUERY_PARAM)
        .collect();
    if !extra.is_empty() || session_hint.is_some() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in extra {
            pairs.append_pair(key, value);
        }
        if let Some(hint) = session_hint {
            pairs.append_pair(SESSION_QUERY_PARAM, hint);
        }
    }

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(s: &str) -> Url {
        Url::parse(s).expect("valid url")
    }

    #[test]
    fn test_websocket_base_schemes() {
        assert_eq!(
            websocket_base(&base("http://api.local:8000")).expect("http").scheme(),
            "ws"
        );
        assert_eq!(
            websocket_base(&base("https://api.example.com")).expect("https").scheme(),
            "wss"
        );
        assert_eq!(
            websocket_base(&base("wss://api.example.com")).expect("wss").scheme(),
            "wss"
        );
        assert!(matches!(
            websocket_base(&base("ftp://api.example.com")),
            Err(LinkError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_chat_endpoint() {
        let url = channel_endpoint(
            &base("https://shop.example.com"),
            &ChannelKind::Chat,
            None,
            &BTreeMap::new(),
        )
        .expect("endpoint");
        assert_eq!(url.as_str(), "wss://shop.example.com/ws/chat");
    }

    #[test]
    fn test_tracking_endpoint_keeps_base_path() {
        let url = channel_endpoint(
            &base("http://localhost:8000/api/"),
            &ChannelKind::tracking("d-42"),
            None,
            &BTreeMap::new(),
        )
        .expect("endpoint");
        assert_eq!(url.as_str(), "ws://localhost:8000/api/ws/delivery/d-42");
    }

    #[test]
    fn test_tracking_endpoint_escapes_delivery_id() {
        let url = channel_endpoint(
            &base("https://shop.example.com"),
            &ChannelKind::tracking("a/b c"),
            None,
            &BTreeMap::new(),
        )
        .expect("endpoint");
        assert_eq!(url.path(), "/ws/delivery/a%2Fb%20c");
    }

    #[test]
    fn test_endpoint_with_hint_and_query() {
        let mut query = BTreeMap::new();
        query.insert("store".to_string(), "seattle-1".to_string());
        query.insert("session_id".to_string(), "stale".to_string());

        let url = channel_endpoint(
            &base("https://shop.example.com?ignored=1#frag"),
            &ChannelKind::Chat,
            Some("abc"),
            &query,
        )
        .expect("endpoint");

        assert_eq!(
            url.as_str(),
            "wss://shop.example.com/ws/chat?store=seattle-1&session_id=abc"
        );
    }

    #[test]
    fn test_session_keys() {
        assert_eq!(ChannelKind::Chat.session_key(), "chat_session_id");
        assert_eq!(
            ChannelKind::tracking("d-1").session_key(),
            "delivery_d-1_session_id"
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(ChannelKind::Chat.to_string(), "chat");
        assert_eq!(ChannelKind::tracking("d-7").to_string(), "tracking:d-7");
    }
}
