// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delayed Redelivery
//!
//! RabbitMQ has no native way to redeliver a message later, and the
//! x-delayed-message plugin is not always available. Instead, every binding gets
//! a redelivery queue without consumers: messages published to it expire after
//! [`REDELIVER_DELAY_MS`] and are dead-lettered back to the binding's exchange
//! and routing key.
//!
//! The number of redeliveries is tracked by the message itself through the
//! [`HEADER_MAX_RETRY`] and [`HEADER_CURR_RETRY`] headers.

use lapin::types::{AMQPValue, FieldTable};
use tracing::warn;

/// Redelivery delay in milliseconds.
///
/// The delay is part of the redelivery queue name, changing it declares a new set
/// of redelivery queues.
pub const REDELIVER_DELAY_MS: i32 = 5000;

/// Messages are redelivered every 5 seconds, 180 times is roughly 15 minutes.
pub const MAX_RETRY_TIMES_15_MIN: i64 = 180;

/// Header key telling how many times the message may be redelivered.
pub const HEADER_MAX_RETRY: &str = "miso-rabbitmq-max-retry";

/// Header key telling how many times the message has been redelivered.
pub const HEADER_CURR_RETRY: &str = "miso-rabbitmq-curr-retry";

/// Name of the redelivery queue for the given exchange and routing key.
pub fn redeliver_queue_name(exchange: &str, routing_key: &str) -> String {
    format!("redeliver_{}_{}_{}", exchange, routing_key, REDELIVER_DELAY_MS)
}

/// What to do with a delivery that the listener failed to handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Publish the message to the redelivery queue.
    ///
    /// `retry` holds the `(max, next)` retry counters to attach, `None` when the
    /// message is not capped.
    Redeliver { retry: Option<(i64, i64)> },
    /// The message exhausted its retries, acknowledge and drop it.
    Drop { max: i64 },
}

impl RetryDecision {
    /// Decides how to redeliver a failed message based on its headers.
    ///
    /// Messages without a max-retry header fall back to `default_max`; when that
    /// is `None` as well they are redelivered until handled. A max-retry header
    /// that is not a number caps the message at zero retries.
    pub fn decide(headers: Option<&FieldTable>, default_max: Option<i64>) -> RetryDecision {
        let max = match headers.and_then(|h| h.inner().get(HEADER_MAX_RETRY)) {
            Some(value) => Some(amqp_int(value).unwrap_or_else(|| {
                warn!(header = HEADER_MAX_RETRY, "unreadable max retry value {:?}", value);
                0
            })),
            None => default_max,
        };

        let Some(max) = max else {
            return RetryDecision::Redeliver { retry: None };
        };

        let curr = headers
            .and_then(|h| header_int(h, HEADER_CURR_RETRY))
            .unwrap_or_default();

        if curr >= max {
            return RetryDecision::Drop { max };
        }

        RetryDecision::Redeliver {
            retry: Some((max, curr + 1)),
        }
    }
}

/// Reads an integer header, accepting any AMQP integer width, a float truncated
/// toward zero, or a numeric string.
pub(crate) fn header_int(headers: &FieldTable, key: &str) -> Option<i64> {
    headers.inner().get(key).and_then(amqp_int)
}

fn amqp_int(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::ShortShortInt(i) => Some(*i as i64),
        AMQPValue::ShortShortUInt(u) => Some(*u as i64),
        AMQPValue::ShortInt(i) => Some(*i as i64),
        AMQPValue::ShortUInt(u) => Some(*u as i64),
        AMQPValue::LongInt(i) => Some(*i as i64),
        AMQPValue::LongUInt(u) => Some(*u as i64),
        AMQPValue::LongLongInt(i) => Some(*i),
        AMQPValue::Timestamp(u) => (*u).try_into().ok(),
        AMQPValue::Float(f) => float_int(*f as f64),
        AMQPValue::Double(d) => float_int(*d),
        AMQPValue::ShortString(s) => numeric_str(s.as_str()),
        AMQPValue::LongString(s) => std::str::from_utf8(s.as_bytes()).ok().and_then(numeric_str),
        _ => None,
    }
}

fn numeric_str(s: &str) -> Option<i64> {
    let s = s.trim();
    s.parse().ok().or_else(|| s.parse().ok().and_then(float_int))
}

fn float_int(f: f64) -> Option<i64> {
    // NaN and out of range values are not numbers of retries
    (f.is_finite() && f.abs() < i64::MAX as f64).then(|| f.trunc() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::{LongString, ShortString};

    fn headers(entries: &[(&str, AMQPValue)]) -> FieldTable {
        let mut table = FieldTable::default();
        for (k, v) in entries {
            table.insert(ShortString::from(*k), v.clone());
        }
        table
    }

    #[test]
    fn queue_name_includes_delay() {
        assert_eq!(redeliver_queue_name("ex", "#"), "redeliver_ex_#_5000");
    }

    #[test]
    fn uncapped_message_is_redelivered() {
        assert_eq!(
            RetryDecision::decide(None, None),
            RetryDecision::Redeliver { retry: None }
        );

        let h = headers(&[("x-other", AMQPValue::LongInt(1))]);
        assert_eq!(
            RetryDecision::decide(Some(&h), None),
            RetryDecision::Redeliver { retry: None }
        );
    }

    #[test]
    fn capped_message_increments_counter() {
        let h = headers(&[(HEADER_MAX_RETRY, AMQPValue::LongInt(3))]);
        assert_eq!(
            RetryDecision::decide(Some(&h), None),
            RetryDecision::Redeliver {
                retry: Some((3, 1))
            }
        );

        let h = headers(&[
            (HEADER_MAX_RETRY, AMQPValue::LongInt(3)),
            (HEADER_CURR_RETRY, AMQPValue::LongLongInt(2)),
        ]);
        assert_eq!(
            RetryDecision::decide(Some(&h), None),
            RetryDecision::Redeliver {
                retry: Some((3, 3))
            }
        );
    }

    #[test]
    fn exhausted_message_is_dropped() {
        let h = headers(&[
            (HEADER_MAX_RETRY, AMQPValue::ShortShortUInt(3)),
            (HEADER_CURR_RETRY, AMQPValue::LongString(LongString::from("3"))),
        ]);
        assert_eq!(
            RetryDecision::decide(Some(&h), None),
            RetryDecision::Drop { max: 3 }
        );

        let h = headers(&[(HEADER_MAX_RETRY, AMQPValue::LongInt(0))]);
        assert_eq!(
            RetryDecision::decide(Some(&h), None),
            RetryDecision::Drop { max: 0 }
        );
    }

    #[test]
    fn default_cap_applies_without_header() {
        assert_eq!(
            RetryDecision::decide(None, Some(2)),
            RetryDecision::Redeliver {
                retry: Some((2, 1))
            }
        );

        let h = headers(&[(HEADER_MAX_RETRY, AMQPValue::LongInt(5))]);
        assert_eq!(
            RetryDecision::decide(Some(&h), Some(2)),
            RetryDecision::Redeliver {
                retry: Some((5, 1))
            }
        );
    }

    #[test]
    fn always_failing_message_is_handled_max_plus_one_times() {
        let max = 4;
        let mut current = headers(&[(HEADER_MAX_RETRY, AMQPValue::LongInt(max as i32))]);
        let mut handled = 0;

        loop {
            handled += 1;
            match RetryDecision::decide(Some(&current), None) {
                RetryDecision::Redeliver {
                    retry: Some((max, next)),
                } => {
                    assert!(next <= max);
                    current = headers(&[
                        (HEADER_MAX_RETRY, AMQPValue::LongLongInt(max)),
                        (HEADER_CURR_RETRY, AMQPValue::LongLongInt(next)),
                    ]);
                }
                RetryDecision::Drop { .. } => break,
                other => panic!("unexpected decision {:?}", other),
            }
        }

        assert_eq!(handled, max + 1);
    }

    #[test]
    fn ignores_non_numeric_headers() {
        let h = headers(&[(HEADER_MAX_RETRY, AMQPValue::Boolean(true))]);
        assert_eq!(header_int(&h, HEADER_MAX_RETRY), None);

        let h = headers(&[(HEADER_MAX_RETRY, AMQPValue::ShortString(ShortString::from("abc")))]);
        assert_eq!(header_int(&h, HEADER_MAX_RETRY), None);

        let h = headers(&[(HEADER_MAX_RETRY, AMQPValue::Double(f64::NAN))]);
        assert_eq!(header_int(&h, HEADER_MAX_RETRY), None);
    }

    #[test]
    fn float_headers_are_truncated() {
        let h = headers(&[
            (HEADER_MAX_RETRY, AMQPValue::Double(3.9)),
            (HEADER_CURR_RETRY, AMQPValue::Float(1.0)),
        ]);
        assert_eq!(header_int(&h, HEADER_MAX_RETRY), Some(3));
        assert_eq!(
            RetryDecision::decide(Some(&h), None),
            RetryDecision::Redeliver {
                retry: Some((3, 2))
            }
        );

        let h = headers(&[(HEADER_MAX_RETRY, AMQPValue::LongString(LongString::from("2.5")))]);
        assert_eq!(header_int(&h, HEADER_MAX_RETRY), Some(2));
    }

    #[test]
    fn unreadable_max_retry_drops_the_message() {
        let h = headers(&[(HEADER_MAX_RETRY, AMQPValue::Boolean(true))]);
        assert_eq!(
            RetryDecision::decide(Some(&h), None),
            RetryDecision::Drop { max: 0 }
        );

        // the header wins over the default cap even when unreadable
        let h = headers(&[(HEADER_MAX_RETRY, AMQPValue::ShortString(ShortString::from("abc")))]);
        assert_eq!(
            RetryDecision::decide(Some(&h), Some(5)),
            RetryDecision::Drop { max: 0 }
        );

        // an unreadable current counter starts from zero
        let h = headers(&[
            (HEADER_MAX_RETRY, AMQPValue::LongInt(2)),
            (HEADER_CURR_RETRY, AMQPValue::Boolean(false)),
        ]);
        assert_eq!(
            RetryDecision::decide(Some(&h), None),
            RetryDecision::Redeliver {
                retry: Some((2, 1))
            }
        );
    }
}
