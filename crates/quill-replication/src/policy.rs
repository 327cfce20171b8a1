//! Subscriber delivery policies.

use std::fmt::Display;
use std::str::FromStr;

use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

use crate::error::ReplicationError;

const START_TIME_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

/// Where a durable consumer starts (or resumes) in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverPolicy {
    /// Deliver every retained message.
    All,
    /// Deliver starting from the last message in the stream.
    Last,
    /// Deliver only messages published after the consumer is created.
    New,
    /// Deliver starting from an explicit stream sequence.
    ByStartSequence(u64),
    /// Deliver starting from a wall-clock instant (UTC).
    ByStartTime(OffsetDateTime),
}

impl DeliverPolicy {
    /// Converts to the consumer configuration of the underlying bus.
    pub(crate) fn to_consumer_policy(self) -> async_nats::jetstream::consumer::DeliverPolicy {
        use async_nats::jetstream::consumer;
        match self {
            DeliverPolicy::All => consumer::DeliverPolicy::All,
            DeliverPolicy::Last => consumer::DeliverPolicy::Last,
            DeliverPolicy::New => consumer::DeliverPolicy::New,
            DeliverPolicy::ByStartSequence(seq) => consumer::DeliverPolicy::ByStartSequence {
                start_sequence: seq,
            },
            DeliverPolicy::ByStartTime(start_time) => {
                consumer::DeliverPolicy::ByStartTime { start_time }
            }
        }
    }
}

impl FromStr for DeliverPolicy {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "all" => Ok(DeliverPolicy::All),
            "last" => Ok(DeliverPolicy::Last),
            "new" => Ok(DeliverPolicy::New),
            other => {
                if let Some(seq) = other.strip_prefix("by_start_sequence=") {
                    let seq = seq
                        .parse::<u64>()
                        .map_err(|_| ReplicationError::Policy(other.to_string()))?;
                    return Ok(DeliverPolicy::ByStartSequence(seq));
                }
                if let Some(datetime) = other.strip_prefix("by_start_time=") {
                    let parsed = PrimitiveDateTime::parse(datetime, START_TIME_FORMAT)
                        .map_err(|_| ReplicationError::Policy(other.to_string()))?;
                    return Ok(DeliverPolicy::ByStartTime(parsed.assume_utc()));
                }
                Err(ReplicationError::Policy(other.to_string()))
            }
        }
    }
}

impl Display for DeliverPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliverPolicy::All => write!(f, "all"),
            DeliverPolicy::Last => write!(f, "last"),
            DeliverPolicy::New => write!(f, "new"),
            DeliverPolicy::ByStartSequence(seq) => write!(f, "by_start_sequence={seq}"),
            DeliverPolicy::ByStartTime(t) => {
                let formatted = t
                    .format(START_TIME_FORMAT)
                    .unwrap_or_else(|_| t.to_string());
                write!(f, "by_start_time={formatted}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_policies() {
        assert_eq!("all".parse::<DeliverPolicy>().unwrap(), DeliverPolicy::All);
        assert_eq!("".parse::<DeliverPolicy>().unwrap(), DeliverPolicy::All);
        assert_eq!("last".parse::<DeliverPolicy>().unwrap(), DeliverPolicy::Last);
        assert_eq!("new".parse::<DeliverPolicy>().unwrap(), DeliverPolicy::New);
    }

    #[test]
    fn parses_start_sequence() {
        assert_eq!(
            "by_start_sequence=42".parse::<DeliverPolicy>().unwrap(),
            DeliverPolicy::ByStartSequence(42)
        );
    }

    #[test]
    fn parses_start_time_as_utc() {
        let policy = "by_start_time=2026-01-02 15:04:05"
            .parse::<DeliverPolicy>()
            .unwrap();
        match policy {
            DeliverPolicy::ByStartTime(t) => {
                assert_eq!(t.year(), 2026);
                assert_eq!(t.hour(), 15);
                assert_eq!(t.offset(), time::UtcOffset::UTC);
            }
            other => panic!("unexpected policy: {other:?}"),
        }
    }

    #[test]
    fn rejects_garbage() {
        for bad in ["sometimes", "by_start_sequence=x", "by_start_time=tomorrow"] {
            assert!(bad.parse::<DeliverPolicy>().is_err(), "{bad}");
        }
    }

    #[test]
    fn display_round_trips() {
        for s in ["all", "last", "new", "by_start_sequence=7"] {
            let policy = s.parse::<DeliverPolicy>().unwrap();
            assert_eq!(policy.to_string().parse::<DeliverPolicy>().unwrap(), policy);
        }
    }
}
