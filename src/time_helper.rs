use bson::Timestamp;
use chrono::{DateTime, Local, TimeZone};

pub fn to_datetime(ts: &Timestamp) -> DateTime<Local> {
    Local.timestamp_opt(ts.time as i64, 0).unwrap()
}
