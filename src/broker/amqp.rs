// AMQP 0-9-1 broker session over `lapin`, publishing through the default exchange.
use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions, QueueDeclareOptions};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::debug;

use super::{BrokerConnector, BrokerSession, OutgoingMessage, QueueOptions, QueueTarget};
use crate::core::error::{Error, ErrorKind};

const DEFAULT_EXCHANGE: &str = "";
const REPLY_SUCCESS: u16 = 200;
const DELIVERY_MODE_TRANSIENT: u8 = 1;
const DELIVERY_MODE_PERSISTENT: u8 = 2;

#[derive(Clone, Copy, Debug, Default)]
pub struct AmqpConnector;

pub struct AmqpSession {
    connection: Connection,
    channel: Channel,
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn connect(&self, target: &QueueTarget) -> Result<Box<dyn BrokerSession>, Error> {
        let uri = target.amqp_uri()?;
        let properties =
            ConnectionProperties::default().with_connection_name("rowrelay".into());
        let connection = Connection::connect(uri.as_str(), properties)
            .await
            .map_err(|err| {
                delivery_error("failed to connect to broker", err).with_hint(
                    "Check rabbit_config host/port/user/password and that the vhost exists.",
                )
            })?;

        let channel = match open_confirming_channel(&connection).await {
            Ok(channel) => channel,
            Err(err) => {
                if let Err(close_err) = connection.close(REPLY_SUCCESS, "channel setup failed").await {
                    debug!(error = %close_err, "broker connection close after setup failure");
                }
                return Err(err);
            }
        };

        debug!(target = %target.describe(), "broker session opened");
        Ok(Box::new(AmqpSession {
            connection,
            channel,
        }))
    }
}

async fn open_confirming_channel(connection: &Connection) -> Result<Channel, Error> {
    let channel = connection
        .create_channel()
        .await
        .map_err(|err| delivery_error("failed to open broker channel", err))?;
    channel
        .confirm_select(ConfirmSelectOptions::default())
        .await
        .map_err(|err| delivery_error("failed to enable publisher confirms", err))?;
    Ok(channel)
}

#[async_trait]
impl BrokerSession for AmqpSession {
    async fn declare_queue(&mut self, queue: &str, options: QueueOptions) -> Result<(), Error> {
        let declare = QueueDeclareOptions {
            passive: false,
            durable: options.durable,
            exclusive: options.exclusive,
            auto_delete: options.auto_delete,
            nowait: false,
        };
        self.channel
            .queue_declare(queue, declare, FieldTable::default())
            .await
            .map_err(|err| {
                delivery_error(&format!("failed to declare queue {queue:?}"), err).with_hint(
                    "An existing queue with different durable/exclusive/autoDelete flags cannot be redeclared; align rabbit_config with it.",
                )
            })?;
        Ok(())
    }

    async fn publish(&mut self, message: OutgoingMessage<'_>) -> Result<(), Error> {
        let properties = BasicProperties::default()
            .with_content_type(message.content_type.into())
            .with_delivery_mode(if message.persistent {
                DELIVERY_MODE_PERSISTENT
            } else {
                DELIVERY_MODE_TRANSIENT
            });
        let options = BasicPublishOptions {
            mandatory: true,
            ..BasicPublishOptions::default()
        };

        let confirm = self
            .channel
            .basic_publish(DEFAULT_EXCHANGE, message.queue, options, message.body, properties)
            .await
            .map_err(|err| delivery_error("failed to publish message", err))?;
        let confirmation = confirm
            .await
            .map_err(|err| delivery_error("failed to receive publish confirmation", err))?;

        match confirmation {
            Confirmation::Ack(None) => Ok(()),
            Confirmation::Ack(Some(_)) => Err(Error::new(ErrorKind::Delivery)
                .with_message(format!("message to queue {:?} was returned unroutable", message.queue))),
            Confirmation::Nack(_) => Err(Error::new(ErrorKind::Delivery)
                .with_message("broker rejected the message (nack)")),
            Confirmation::NotRequested => Err(Error::new(ErrorKind::Internal)
                .with_message("publisher confirms are not enabled on the channel")),
        }
    }

    async fn close(self: Box<Self>) -> Result<(), Error> {
        // A failed declare already closed the channel on the broker side.
        if let Err(err) = self.channel.close(REPLY_SUCCESS, "relay finished").await {
            debug!(error = %err, "broker channel close");
        }
        self.connection
            .close(REPLY_SUCCESS, "relay finished")
            .await
            .map_err(|err| delivery_error("failed to close broker connection", err))
    }
}

fn delivery_error(message: &str, err: lapin::Error) -> Error {
    Error::new(ErrorKind::Delivery)
        .with_message(message)
        .with_source(err)
}

#[cfg(test)]
mod tests {
    use super::delivery_error;
    use crate::core::error::ErrorKind;
    use std::error::Error as _;

    #[test]
    fn delivery_error_keeps_cause_out_of_message() {
        let err = delivery_error("failed to publish message", lapin::Error::ChannelsLimitReached);
        assert_eq!(err.kind(), ErrorKind::Delivery);
        assert_eq!(err.message(), Some("failed to publish message"));
        let cause = err.source().expect("source").to_string();
        assert!(!err.message().unwrap_or_default().contains(&cause));
    }
}
