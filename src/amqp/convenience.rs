//! Conversions between [`lapin::BasicProperties`] and the transport-level [`MessageProperties`].
use amq_protocol_types::ShortString;
use lapin::BasicProperties;

use crate::transport::MessageProperties;

impl From<MessageProperties> for BasicProperties {
    fn from(properties: MessageProperties) -> Self {
        let mut basic = BasicProperties::default();
        if let Some(reply_to) = properties.reply_to {
            basic = basic.with_reply_to(ShortString::from(reply_to));
        }
        if let Some(correlation_id) = properties.correlation_id {
            basic = basic.with_correlation_id(ShortString::from(correlation_id));
        }
        basic
    }
}

impl From<&BasicProperties> for MessageProperties {
    fn from(properties: &BasicProperties) -> Self {
        Self {
            reply_to: properties.reply_to().as_ref().map(|s| s.to_string()),
            correlation_id: properties
                .correlation_id()
                .as_ref()
                .map(|s| s.to_string()),
        }
    }
}
