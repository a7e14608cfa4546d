// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! This module implements the processing of a single delivery: the listener is
//! called inside a consumer span, successful deliveries are acknowledged and
//! failed ones go through the redelivery path.
//!
//! A failed delivery whose (exchange, routing key) has a declared redelivery
//! queue is republished there, carrying its retry counters, and acknowledged.
//! It comes back to the original exchange once the queue TTL expires. A message
//! that exhausted its retries is acknowledged and dropped. Anything else, or a
//! failed republish, is negatively acknowledged with requeue.

use crate::{
    errors::AmqpError,
    listener::RabbitListener,
    otel,
    publisher::{PublishMessage, Publisher},
    redelivery::{redeliver_queue_name, RetryDecision, HEADER_CURR_RETRY, HEADER_MAX_RETRY},
};
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicNackOptions},
    protocol::basic::AMQPProperties,
};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
    Context,
};
use std::{borrow::Cow, collections::HashSet, sync::Arc};
use tracing::{debug, error, info, warn};

/// How a delivery is settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settlement {
    Ack,
    Requeue,
}

/// The parts of a failed delivery needed to redeliver it.
pub(crate) struct FailedDelivery<'a> {
    pub(crate) exchange: &'a str,
    pub(crate) routing_key: &'a str,
    pub(crate) properties: &'a AMQPProperties,
    pub(crate) payload: &'a [u8],
}

impl<'a> From<&'a Delivery> for FailedDelivery<'a> {
    fn from(delivery: &'a Delivery) -> Self {
        FailedDelivery {
            exchange: delivery.exchange.as_str(),
            routing_key: delivery.routing_key.as_str(),
            properties: &delivery.properties,
            payload: &delivery.data,
        }
    }
}

/// Redelivery settings shared by the consumers of one connect cycle.
pub(crate) struct Redelivery {
    publisher: Arc<dyn Publisher>,
    queues: HashSet<String>,
    default_max_retry: Option<i64>,
}

impl Redelivery {
    /// # Parameters
    /// * `publisher` - Publisher used to send failed messages to their redelivery queue
    /// * `queues` - Redelivery queues declared in the current connect cycle
    /// * `default_max_retry` - Retry cap of messages without a max-retry header
    pub(crate) fn new(
        publisher: Arc<dyn Publisher>,
        queues: HashSet<String>,
        default_max_retry: Option<i64>,
    ) -> Redelivery {
        Redelivery {
            publisher,
            queues,
            default_max_retry,
        }
    }

    /// Republishes a failed delivery to its redelivery queue and tells how the
    /// original must be settled.
    pub(crate) async fn redeliver(&self, ctx: &Context, failed: FailedDelivery<'_>) -> Settlement {
        let queue = redeliver_queue_name(failed.exchange, failed.routing_key);

        if !self.queues.contains(&queue) {
            warn!(
                exchange = failed.exchange,
                routing_key = failed.routing_key,
                "no redelivery queue for message, requeuing"
            );
            return Settlement::Requeue;
        }

        let headers = failed.properties.headers().as_ref();

        let retry = match RetryDecision::decide(headers, self.default_max_retry) {
            RetryDecision::Drop { max } => {
                info!(
                    max_retry = max,
                    exchange = failed.exchange,
                    routing_key = failed.routing_key,
                    "too many attempts, dropping message"
                );
                return Settlement::Ack;
            }
            RetryDecision::Redeliver { retry } => retry,
        };

        let content_type = failed
            .properties
            .content_type()
            .as_ref()
            .map(|c| c.as_str())
            .unwrap_or_default();

        let mut msg = PublishMessage::new("", &queue, content_type, failed.payload.to_vec());
        if let Some((max, next)) = retry {
            msg = msg
                .header(HEADER_MAX_RETRY, max)
                .header(HEADER_CURR_RETRY, next);
        }

        match self.publisher.publish(ctx, &msg).await {
            Ok(()) => {
                debug!(queue = queue.as_str(), "message sent to redelivery queue");
                Settlement::Ack
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = queue.as_str(),
                    "failure to send message to redelivery queue, requeuing"
                );
                Settlement::Requeue
            }
        }
    }
}

/// Consumes and processes a message from RabbitMQ.
///
/// This function is the core of the message consumption process. It:
/// 1. Extracts the trace context from the headers and opens a consumer span
/// 2. Calls the listener with the payload
/// 3. Acknowledges the message on success
/// 4. Runs the redelivery path on failure
///
/// # Parameters
/// * `tracer` - OpenTelemetry tracer for creating spans
/// * `delivery` - The RabbitMQ delivery containing the message
/// * `listener` - Listener of the consumed queue
/// * `redelivery` - Redelivery settings of the current connect cycle
///
/// # Returns
/// Ok(()) once settled or AmqpError when the ack/nack failed
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: &Delivery,
    listener: &dyn RabbitListener,
    redelivery: &Redelivery,
) -> Result<(), AmqpError> {
    let (ctx, mut span) = otel::new_span(&delivery.properties, tracer, listener.queue_name());

    debug!(
        queue = listener.queue_name(),
        exchange = delivery.exchange.as_str(),
        "received message"
    );

    let settlement = match listener.handle(&ctx, &delivery.data).await {
        Ok(()) => {
            debug!("message successfully processed");
            span.set_status(Status::Ok);
            Settlement::Ack
        }
        Err(err) => {
            error!(
                error = err.to_string(),
                listener = listener.describe(),
                "failure handling message"
            );
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from(err.to_string()),
            });
            redelivery.redeliver(&ctx, FailedDelivery::from(delivery)).await
        }
    };

    settle(delivery, settlement, &mut span).await
}

async fn settle<S: Span>(delivery: &Delivery, settlement: Settlement, span: &mut S) -> Result<(), AmqpError> {
    match settlement {
        Settlement::Ack => {
            if let Err(e) = delivery.ack(BasicAckOptions { multiple: false }).await {
                error!(error = e.to_string(), "error while ack msg");
                span.record_error(&e);
                span.set_status(Status::Error {
                    description: Cow::from("error to ack msg"),
                });
                return Err(AmqpError::AckMessageError);
            }
        }
        Settlement::Requeue => {
            if let Err(e) = delivery
                .nack(BasicNackOptions {
                    multiple: false,
                    requeue: true,
                })
                .await
            {
                error!(error = e.to_string(), "error while nack msg");
                span.record_error(&e);
                span.set_status(Status::Error {
                    description: Cow::from("error to nack msg"),
                });
                return Err(AmqpError::NackMessageError);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        errors::HandlerError,
        listener::{MsgListener, PanicSafeListener},
        publisher::{HeaderValue, MockPublisher},
        queue::BindingRegistration,
    };
    use lapin::{
        acker::Acker,
        types::{AMQPValue, FieldTable, LongString, ShortString},
    };
    use opentelemetry::global;
    use std::collections::BTreeMap;

    const EXCHANGE: &str = "E";
    const KEY: &str = "k";

    fn redelivery(publisher: MockPublisher, default_max_retry: Option<i64>) -> Redelivery {
        let queues = [BindingRegistration::new("Q").exchange(EXCHANGE).routing_key(KEY)]
            .iter()
            .map(BindingRegistration::redelivery_queue)
            .collect();

        Redelivery::new(Arc::new(publisher), queues, default_max_retry)
    }

    fn props(retry: &[(&str, AMQPValue)]) -> AMQPProperties {
        let mut headers = BTreeMap::new();
        for (key, value) in retry {
            headers.insert(ShortString::from(*key), value.clone());
        }

        AMQPProperties::default()
            .with_content_type(ShortString::from("application/json"))
            .with_headers(FieldTable::from(headers))
    }

    fn failed<'a>(exchange: &'a str, props: &'a AMQPProperties) -> FailedDelivery<'a> {
        FailedDelivery {
            exchange,
            routing_key: KEY,
            properties: props,
            payload: b"{}",
        }
    }

    fn header<'m>(msg: &'m PublishMessage, key: &str) -> Option<&'m HeaderValue> {
        msg.headers.as_ref().and_then(|h| h.get(key))
    }

    fn delivery(exchange: &str, properties: AMQPProperties) -> Delivery {
        Delivery {
            delivery_tag: 1,
            exchange: ShortString::from(exchange),
            routing_key: ShortString::from(KEY),
            redelivered: false,
            properties,
            data: b"{}".to_vec(),
            acker: Acker::default(),
        }
    }

    fn failing() -> MsgListener {
        MsgListener::new("Q", |_, _| async { Err(HandlerError::failed("cannot handle")) })
    }

    async fn explode(_: Context, _: String) -> crate::listener::HandlerResult {
        panic!("handler exploded")
    }

    #[tokio::test]
    async fn handled_delivery_is_acked_without_publish() {
        let mut publisher = MockPublisher::new();
        publisher.expect_publish().never();

        let listener = MsgListener::new("Q", |_, payload| async move {
            assert_eq!(payload, "{}");
            Ok(())
        });
        let delivery = delivery(EXCHANGE, props(&[]));

        consume(&global::tracer("test"), &delivery, &listener, &redelivery(publisher, None))
            .await
            .unwrap();

        assert!(delivery.acker.used());
    }

    #[tokio::test]
    async fn failed_delivery_goes_to_redelivery_queue() {
        let mut publisher = MockPublisher::new();
        publisher
            .expect_publish()
            .withf(|_, msg| msg.routing_key == "redeliver_E_k_5000" && msg.payload == b"{}")
            .times(1)
            .returning(|_, _| Ok(()));

        let delivery = delivery(EXCHANGE, props(&[]));

        consume(&global::tracer("test"), &delivery, &failing(), &redelivery(publisher, None))
            .await
            .unwrap();

        assert!(delivery.acker.used());
    }

    #[tokio::test]
    async fn exhausted_delivery_is_settled_without_publish() {
        let mut publisher = MockPublisher::new();
        publisher.expect_publish().never();

        let delivery = delivery(
            EXCHANGE,
            props(&[
                (HEADER_MAX_RETRY, AMQPValue::LongInt(1)),
                (HEADER_CURR_RETRY, AMQPValue::LongInt(1)),
            ]),
        );

        consume(&global::tracer("test"), &delivery, &failing(), &redelivery(publisher, None))
            .await
            .unwrap();

        assert!(delivery.acker.used());
    }

    #[tokio::test]
    async fn failed_delivery_without_redelivery_queue_is_requeued() {
        let mut publisher = MockPublisher::new();
        publisher.expect_publish().never();

        let delivery = delivery("other", props(&[]));

        consume(&global::tracer("test"), &delivery, &failing(), &redelivery(publisher, None))
            .await
            .unwrap();

        assert!(delivery.acker.used());
    }

    #[tokio::test]
    async fn panicking_listener_is_redelivered() {
        let mut publisher = MockPublisher::new();
        publisher.expect_publish().times(1).returning(|_, _| Ok(()));

        let listener = PanicSafeListener::new(Arc::new(MsgListener::new("Q", explode)));
        let delivery = delivery(EXCHANGE, props(&[]));

        consume(&global::tracer("test"), &delivery, &listener, &redelivery(publisher, None))
            .await
            .unwrap();

        assert!(delivery.acker.used());
    }

    #[tokio::test]
    async fn uncapped_message_is_redelivered_without_counters() {
        let mut publisher = MockPublisher::new();
        publisher
            .expect_publish()
            .withf(|_, msg| {
                msg.exchange.is_empty()
                    && msg.routing_key == "redeliver_E_k_5000"
                    && msg.content_type == "application/json"
                    && msg.payload == b"{}"
                    && msg.headers.is_none()
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let props = props(&[]);
        let settlement = redelivery(publisher, None)
            .redeliver(&Context::new(), failed(EXCHANGE, &props))
            .await;

        assert_eq!(settlement, Settlement::Ack);
    }

    #[tokio::test]
    async fn capped_message_carries_next_retry() {
        let mut publisher = MockPublisher::new();
        publisher
            .expect_publish()
            .withf(|_, msg| {
                header(msg, HEADER_MAX_RETRY) == Some(&HeaderValue::LongLongInt(3))
                    && header(msg, HEADER_CURR_RETRY) == Some(&HeaderValue::LongLongInt(2))
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let props = props(&[
            (HEADER_MAX_RETRY, AMQPValue::LongInt(3)),
            (HEADER_CURR_RETRY, AMQPValue::LongString(LongString::from("1"))),
        ]);
        let settlement = redelivery(publisher, None)
            .redeliver(&Context::new(), failed(EXCHANGE, &props))
            .await;

        assert_eq!(settlement, Settlement::Ack);
    }

    #[tokio::test]
    async fn exhausted_message_is_acked_without_publish() {
        let mut publisher = MockPublisher::new();
        publisher.expect_publish().never();

        let props = props(&[
            (HEADER_MAX_RETRY, AMQPValue::LongLongInt(2)),
            (HEADER_CURR_RETRY, AMQPValue::LongLongInt(2)),
        ]);
        let settlement = redelivery(publisher, None)
            .redeliver(&Context::new(), failed(EXCHANGE, &props))
            .await;

        assert_eq!(settlement, Settlement::Ack);
    }

    #[tokio::test]
    async fn failed_republish_requeues() {
        let mut publisher = MockPublisher::new();
        publisher
            .expect_publish()
            .times(1)
            .returning(|_, _| Err(AmqpError::NoChannelAvailable));

        let props = props(&[]);
        let settlement = redelivery(publisher, None)
            .redeliver(&Context::new(), failed(EXCHANGE, &props))
            .await;

        assert_eq!(settlement, Settlement::Requeue);
    }

    #[tokio::test]
    async fn unknown_binding_requeues() {
        let mut publisher = MockPublisher::new();
        publisher.expect_publish().never();

        let props = props(&[]);
        let settlement = redelivery(publisher, None)
            .redeliver(&Context::new(), failed("other", &props))
            .await;

        assert_eq!(settlement, Settlement::Requeue);
    }

    #[tokio::test]
    async fn default_cap_starts_counting() {
        let mut publisher = MockPublisher::new();
        publisher
            .expect_publish()
            .withf(|_, msg| {
                header(msg, HEADER_MAX_RETRY) == Some(&HeaderValue::LongLongInt(5))
                    && header(msg, HEADER_CURR_RETRY) == Some(&HeaderValue::LongLongInt(1))
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let props = AMQPProperties::default();
        let settlement = redelivery(publisher, Some(5))
            .redeliver(&Context::new(), failed(EXCHANGE, &props))
            .await;

        assert_eq!(settlement, Settlement::Ack);
    }
}
