use chrono::{DateTime, Duration, Utc};
use prost_types::Duration as ProstDuration;
use prost_types::Timestamp as ProstTimestamp;

pub fn prost_duration_to_duration(prost_duration: &ProstDuration) -> Duration {
    let seconds = prost_duration.seconds.max(0);
    let nanos = prost_duration.nanos.max(0) as i64;
    Duration::seconds(seconds) + Duration::nanoseconds(nanos)
}

pub fn duration_to_prost_duration(duration: &Duration) -> ProstDuration {
    let seconds = duration.num_seconds();
    let nanos = (*duration - Duration::seconds(seconds))
        .num_nanoseconds()
        .unwrap_or(0) as i32;
    ProstDuration { seconds, nanos }
}

pub fn prost_timestamp_to_datetime(prost_timestamp: &ProstTimestamp) -> DateTime<Utc> {
    let nanos = prost_timestamp.nanos.clamp(0, 999_999_999) as u32;
    DateTime::<Utc>::from_timestamp(prost_timestamp.seconds, nanos)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

pub fn datetime_to_prost_timestamp(datetime: &DateTime<Utc>) -> ProstTimestamp {
    ProstTimestamp {
        seconds: datetime.timestamp(),
        nanos: datetime.timestamp_subsec_nanos() as i32,
    }
}

/// Current time truncated to microseconds, the resolution registry timestamps are kept at.
pub fn now() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::<Utc>::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now)
}
