//! # Reply Values and Push Classification
//!
//! Purpose: Model decoded RESP2 replies and recognize the unsolicited
//! pub/sub shapes the demultiplexer must route out-of-band.

/// Decoded RESP2 reply value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// +OK or +PONG style responses.
    Simple(Vec<u8>),
    /// -ERR ... responses.
    Error(Vec<u8>),
    /// :123 responses.
    Integer(i64),
    /// $... bulk strings, with None for null.
    Bulk(Option<Vec<u8>>),
    /// *... arrays.
    Array(Vec<RespValue>),
}

impl RespValue {
    /// Classifies this reply as a pub/sub push shape, if it is one.
    ///
    /// Only arrays whose first element is one of the six pub/sub verbs and
    /// whose arity matches that verb qualify. Anything else is an ordinary
    /// reply and must consume an in-flight slot.
    pub fn as_push(&self) -> Option<Push<'_>> {
        let items = match self {
            RespValue::Array(items) => items,
            _ => return None,
        };

        let verb = items.first().and_then(text)?;
        match (verb, items.len()) {
            (b"message", 3) => Some(Push::Message {
                channel: text(&items[1])?,
                payload: text(&items[2])?,
            }),
            (b"pmessage", 4) => Some(Push::PatternMessage {
                pattern: text(&items[1])?,
                channel: text(&items[2])?,
                payload: text(&items[3])?,
            }),
            (b"subscribe", 3) | (b"psubscribe", 3) => Some(Push::SubscribeAck {
                name: text(&items[1])?,
            }),
            (b"unsubscribe", 3) | (b"punsubscribe", 3) => Some(Push::UnsubscribeAck {
                name: text(&items[1])?,
            }),
            _ => None,
        }
    }
}

/// Pub/sub push shapes carried inside the ordinary reply stream.
#[derive(Debug, PartialEq, Eq)]
pub enum Push<'a> {
    /// Message published to a channel this client subscribed to directly.
    Message { channel: &'a [u8], payload: &'a [u8] },
    /// Message delivered through a pattern subscription; carries both the
    /// matched pattern and the concrete channel.
    PatternMessage {
        pattern: &'a [u8],
        channel: &'a [u8],
        payload: &'a [u8],
    },
    /// One per-name acknowledgment of a (p)subscribe batch.
    SubscribeAck { name: &'a [u8] },
    /// One per-name acknowledgment of a (p)unsubscribe batch.
    UnsubscribeAck { name: &'a [u8] },
}

fn text(value: &RespValue) -> Option<&[u8]> {
    match value {
        RespValue::Bulk(Some(data)) => Some(data),
        RespValue::Simple(data) => Some(data),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(data: &[u8]) -> RespValue {
        RespValue::Bulk(Some(data.to_vec()))
    }

    #[test]
    fn classifies_channel_message() {
        let reply = RespValue::Array(vec![bulk(b"message"), bulk(b"news"), bulk(b"hello")]);
        assert_eq!(
            reply.as_push(),
            Some(Push::Message {
                channel: b"news",
                payload: b"hello"
            })
        );
    }

    #[test]
    fn classifies_pattern_message() {
        let reply = RespValue::Array(vec![
            bulk(b"pmessage"),
            bulk(b"news.*"),
            bulk(b"news.uk"),
            bulk(b"hello"),
        ]);
        assert_eq!(
            reply.as_push(),
            Some(Push::PatternMessage {
                pattern: b"news.*",
                channel: b"news.uk",
                payload: b"hello"
            })
        );
    }

    #[test]
    fn classifies_acks() {
        let sub = RespValue::Array(vec![bulk(b"subscribe"), bulk(b"news"), RespValue::Integer(1)]);
        assert_eq!(sub.as_push(), Some(Push::SubscribeAck { name: b"news" }));

        let unsub = RespValue::Array(vec![
            bulk(b"punsubscribe"),
            bulk(b"news.*"),
            RespValue::Integer(0),
        ]);
        assert_eq!(unsub.as_push(), Some(Push::UnsubscribeAck { name: b"news.*" }));
    }

    #[test]
    fn ordinary_arrays_are_not_pushes() {
        let reply = RespValue::Array(vec![bulk(b"key"), bulk(b"value")]);
        assert_eq!(reply.as_push(), None);

        // Right verb, wrong arity.
        let reply = RespValue::Array(vec![bulk(b"message"), bulk(b"news")]);
        assert_eq!(reply.as_push(), None);

        assert_eq!(RespValue::Integer(3).as_push(), None);
    }
}
